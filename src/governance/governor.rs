//! Risk Governor - gate in front of every mutating backend call
//!
//! `pre_check` runs hard limits in a fixed order and short-circuits on the
//! first failure; `post_check` feeds realized outcomes back into the daily
//! loss budget and the circuit breaker.
//!
//! Lock order is always config -> ledger -> approvals.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::approval::{ApprovalDecision, ApprovalRegistry, ApprovalRequest};
use super::circuit_breaker::{BreakerCheck, CircuitBreaker, CircuitBreakerState, TripReason};
use super::daily_loss::DailyLossAccumulator;
use crate::config::RiskConfig;
use crate::domain::{OperationContext, TradeOutcome};
use crate::error::{ApprovalError, GuardError, Result};

/// Machine-readable denial codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    BlacklistedSymbol,
    PositionSizeExceeded,
    DailyLossLimit,
    PositionCapExceeded,
    CircuitBreakerTripped,
    AwaitingApproval,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::BlacklistedSymbol => "blacklisted_symbol",
            DenyReason::PositionSizeExceeded => "position_size_exceeded",
            DenyReason::DailyLossLimit => "daily_loss_limit",
            DenyReason::PositionCapExceeded => "position_cap_exceeded",
            DenyReason::CircuitBreakerTripped => "circuit_breaker_tripped",
            DenyReason::AwaitingApproval => "awaiting_approval",
        }
    }

    /// Hard-limit denials; the caller must change the request or wait
    pub fn is_hard_limit(&self) -> bool {
        !matches!(self, DenyReason::AwaitingApproval)
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pre-check verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCheckResult {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    /// Human-readable detail for the denial
    pub detail: Option<String>,
    /// Set when the operation is parked behind an approval request
    pub request_id: Option<String>,
    pub warnings: Vec<String>,
}

impl RiskCheckResult {
    fn allow(warnings: Vec<String>) -> Self {
        Self {
            allowed: true,
            reason: None,
            detail: None,
            request_id: None,
            warnings,
        }
    }

    fn deny(reason: DenyReason, detail: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            detail: Some(detail),
            request_id: None,
            warnings: Vec::new(),
        }
    }

    fn awaiting(request: &ApprovalRequest, warnings: Vec<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(DenyReason::AwaitingApproval),
            detail: Some(format!(
                "{} requires approval before {}",
                request.tool_name,
                request.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
            )),
            request_id: Some(request.id.clone()),
            warnings,
        }
    }

    pub fn is_denied_by(&self, reason: DenyReason) -> bool {
        self.reason == Some(reason)
    }
}

/// Read-only status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub config: RiskConfig,
    pub daily_loss_usd: Decimal,
    pub daily_loss_remaining_usd: Decimal,
    pub breaker: CircuitBreakerState,
    pub cooldown_remaining_secs: Option<u64>,
    pub pending_approvals: usize,
    pub as_of: DateTime<Utc>,
}

/// Counters and breaker, guarded together so trips see consistent totals
struct Ledger {
    breaker: CircuitBreaker,
    daily: DailyLossAccumulator,
}

/// Gatekeeper composing limits, the circuit breaker and the approval registry
pub struct RiskGovernor {
    config: RwLock<Arc<RiskConfig>>,
    ledger: Mutex<Ledger>,
    approvals: Mutex<ApprovalRegistry>,
}

impl RiskGovernor {
    /// Create a governor; the configuration must pass validation
    pub fn new(config: RiskConfig) -> Result<Self> {
        config.validate().map_err(GuardError::InvalidConfig)?;

        let ledger = Ledger {
            breaker: CircuitBreaker::new(
                config.consecutive_loss_threshold,
                config.cooldown_minutes,
            ),
            daily: DailyLossAccumulator::new(Utc::now().date_naive()),
        };
        let approvals = ApprovalRegistry::new(config.approval_retention_seconds);

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            ledger: Mutex::new(ledger),
            approvals: Mutex::new(approvals),
        })
    }

    /// Current configuration snapshot
    pub async fn config(&self) -> Arc<RiskConfig> {
        self.config.read().await.clone()
    }

    /// Hot-reload limits; evaluations already running keep their snapshot
    pub async fn update_config(&self, config: RiskConfig) -> Result<()> {
        config.validate().map_err(GuardError::InvalidConfig)?;

        let mut current = self.config.write().await;
        self.ledger
            .lock()
            .await
            .breaker
            .set_limits(config.consecutive_loss_threshold, config.cooldown_minutes);
        self.approvals
            .lock()
            .await
            .set_retention(config.approval_retention_seconds);
        *current = Arc::new(config);

        info!("Risk configuration reloaded");
        Ok(())
    }

    // ==================== Pre-Trade Checks ====================

    /// Decide whether an operation may proceed
    pub async fn pre_check(&self, ctx: &OperationContext) -> RiskCheckResult {
        self.pre_check_at(ctx, Utc::now()).await
    }

    pub async fn pre_check_at(&self, ctx: &OperationContext, now: DateTime<Utc>) -> RiskCheckResult {
        let config = self.config().await;
        let result = self.evaluate(&config, ctx, now).await;

        match result.reason {
            Some(reason) if reason.is_hard_limit() => warn!(
                tool = %ctx.tool_name,
                symbol = ctx.symbol.as_deref().unwrap_or("-"),
                reason = %reason,
                "Operation denied: {}",
                result.detail.as_deref().unwrap_or("")
            ),
            Some(_) => info!(
                tool = %ctx.tool_name,
                request_id = result.request_id.as_deref().unwrap_or("-"),
                "Operation awaiting approval"
            ),
            None => debug!(tool = %ctx.tool_name, "Operation allowed"),
        }

        result
    }

    async fn evaluate(
        &self,
        config: &RiskConfig,
        ctx: &OperationContext,
        now: DateTime<Utc>,
    ) -> RiskCheckResult {
        let mut warnings = Vec::new();

        // 1. Symbol blacklist
        if let Some(symbol) = ctx.symbol.as_deref() {
            if config.is_blacklisted(symbol) {
                return RiskCheckResult::deny(
                    DenyReason::BlacklistedSymbol,
                    format!("{} is blacklisted", symbol),
                );
            }
        }

        // 2. Position size
        if let Some(notional) = ctx.notional_usd {
            if notional.abs() > config.max_position_size_usd {
                return RiskCheckResult::deny(
                    DenyReason::PositionSizeExceeded,
                    format!(
                        "Position ${} exceeds limit ${}",
                        notional.abs(),
                        config.max_position_size_usd
                    ),
                );
            }
            if notional.abs() >= config.max_position_size_usd * config.size_warning_ratio {
                warnings.push(format!(
                    "Position ${} is close to the ${} size limit",
                    notional.abs(),
                    config.max_position_size_usd
                ));
            }
        }

        if !ctx.is_high_risk() {
            return RiskCheckResult::allow(warnings);
        }

        {
            let mut ledger = self.ledger.lock().await;

            // 3. Daily loss budget
            let daily_loss = ledger.daily.current_at(now);
            if daily_loss >= config.max_daily_loss_usd {
                return RiskCheckResult::deny(
                    DenyReason::DailyLossLimit,
                    format!(
                        "Daily loss ${} reached limit ${}",
                        daily_loss, config.max_daily_loss_usd
                    ),
                );
            }
            if daily_loss >= config.max_daily_loss_usd * config.size_warning_ratio {
                warnings.push(format!(
                    "Daily loss ${} is close to the ${} limit",
                    daily_loss, config.max_daily_loss_usd
                ));
            }

            // 4. Open position cap
            if ctx.kind.opens_exposure() {
                if ctx.open_position_count >= config.max_open_positions {
                    return RiskCheckResult::deny(
                        DenyReason::PositionCapExceeded,
                        format!(
                            "{} open positions (max {})",
                            ctx.open_position_count, config.max_open_positions
                        ),
                    );
                }
                if ctx.open_position_count + 1 == config.max_open_positions {
                    warnings.push(format!(
                        "This uses the last of {} open position slots",
                        config.max_open_positions
                    ));
                }
            }

            // 5. Circuit breaker
            match ledger.breaker.check_at(now) {
                BreakerCheck::Blocked { remaining_secs } => {
                    let why = ledger
                        .breaker
                        .state()
                        .last_trip_reason
                        .as_ref()
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "tripped".to_string());
                    return RiskCheckResult::deny(
                        DenyReason::CircuitBreakerTripped,
                        format!("Circuit breaker {}, {}s until cooldown ends", why, remaining_secs),
                    );
                }
                BreakerCheck::Recovered | BreakerCheck::Clear => {}
            }

            let losses = ledger.breaker.consecutive_losses();
            if losses > 0 && losses + 1 >= ledger.breaker.loss_threshold() {
                warnings.push(format!(
                    "{} consecutive losses; one more trips the circuit breaker",
                    losses
                ));
            }
        }

        // 6. Confirmation gate
        if config.require_confirmation {
            let request = self.approvals.lock().await.create_at(
                ctx.clone(),
                config.approval_ttl_seconds,
                now,
            );
            return RiskCheckResult::awaiting(&request, warnings);
        }

        // 7. Allowed
        RiskCheckResult::allow(warnings)
    }

    // ==================== Post-Trade Updates ====================

    /// Feed an executed operation's outcome back into the counters.
    ///
    /// Returns the trip reason when this outcome tripped the breaker.
    pub async fn post_check(
        &self,
        ctx: &OperationContext,
        outcome: &TradeOutcome,
    ) -> Option<TripReason> {
        self.post_check_at(ctx, outcome, Utc::now()).await
    }

    pub async fn post_check_at(
        &self,
        ctx: &OperationContext,
        outcome: &TradeOutcome,
        now: DateTime<Utc>,
    ) -> Option<TripReason> {
        let config = self.config().await;
        let mut ledger = self.ledger.lock().await;

        if !outcome.is_loss() {
            ledger.breaker.record_win();
            // Keep the day current even on wins
            ledger.daily.current_at(now);
            debug!(
                tool = %ctx.tool_name,
                pnl = %outcome.realized_pnl,
                "Winning outcome recorded"
            );
            return None;
        }

        let daily_loss = ledger.daily.add_loss_at(outcome.realized_pnl, now);
        info!(
            tool = %ctx.tool_name,
            pnl = %outcome.realized_pnl,
            "Loss recorded. Daily total: ${} / ${}",
            daily_loss,
            config.max_daily_loss_usd
        );

        let mut tripped = ledger.breaker.record_loss_at(now);

        if daily_loss > config.max_daily_loss_usd {
            let reason = TripReason::DailyLossLimit(daily_loss);
            if ledger.breaker.trip_at(reason.clone(), now) {
                tripped = Some(reason);
            }
        }

        tripped
    }

    // ==================== Circuit Breaker Control ====================

    /// Operator override; always succeeds
    pub async fn reset_circuit_breaker(&self) {
        let mut ledger = self.ledger.lock().await;
        let was_tripped = ledger.breaker.is_tripped();
        ledger.breaker.reset();
        warn!(was_tripped, "Circuit breaker manually reset (privileged action)");
    }

    /// Operator-initiated trip
    pub async fn trip_circuit_breaker(&self, reason: &str) -> bool {
        self.ledger
            .lock()
            .await
            .breaker
            .trip_at(TripReason::Manual(reason.to_string()), Utc::now())
    }

    /// Copy of breaker state, for persistence
    pub async fn breaker_state(&self) -> CircuitBreakerState {
        self.ledger.lock().await.breaker.state().clone()
    }

    /// Restore breaker state persisted by a previous process
    pub async fn restore_breaker_state(&self, state: CircuitBreakerState) {
        info!(
            tripped = state.tripped,
            consecutive_losses = state.consecutive_losses,
            "Restoring circuit breaker state"
        );
        self.ledger.lock().await.breaker.restore(state);
    }

    // ==================== Approvals ====================

    pub async fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.pending_approvals_at(Utc::now()).await
    }

    pub async fn pending_approvals_at(&self, now: DateTime<Utc>) -> Vec<ApprovalRequest> {
        self.approvals.lock().await.pending_at(now)
    }

    /// Look up a request in any status
    pub async fn get_approval(&self, id: &str) -> Option<ApprovalRequest> {
        self.approvals.lock().await.get_at(id, Utc::now())
    }

    pub async fn approve_request(
        &self,
        id: &str,
    ) -> std::result::Result<ApprovalRequest, ApprovalError> {
        self.approve_request_at(id, Utc::now()).await
    }

    pub async fn approve_request_at(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<ApprovalRequest, ApprovalError> {
        self.resolve(id, ApprovalDecision::Approve, now).await
    }

    pub async fn reject_request(
        &self,
        id: &str,
    ) -> std::result::Result<ApprovalRequest, ApprovalError> {
        self.reject_request_at(id, Utc::now()).await
    }

    pub async fn reject_request_at(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<ApprovalRequest, ApprovalError> {
        self.resolve(id, ApprovalDecision::Reject, now).await
    }

    async fn resolve(
        &self,
        id: &str,
        decision: ApprovalDecision,
        now: DateTime<Utc>,
    ) -> std::result::Result<ApprovalRequest, ApprovalError> {
        let result = self.approvals.lock().await.resolve_at(id, decision, now);
        if let Err(ref e) = result {
            warn!("Approval {:?} for {} failed: {}", decision, id, e);
        }
        result
    }

    // ==================== Metrics ====================

    pub async fn risk_metrics(&self) -> RiskMetrics {
        self.risk_metrics_at(Utc::now()).await
    }

    /// Snapshot for display; does not roll the day or expire approvals
    pub async fn risk_metrics_at(&self, now: DateTime<Utc>) -> RiskMetrics {
        let config = self.config().await;
        let (daily_loss_usd, breaker, cooldown_remaining_secs) = {
            let ledger = self.ledger.lock().await;
            (
                ledger.daily.peek_at(now),
                ledger.breaker.state().clone(),
                ledger.breaker.cooldown_remaining_at(now),
            )
        };
        let pending_approvals = self.approvals.lock().await.live_pending_count(now);

        RiskMetrics {
            daily_loss_remaining_usd: (config.max_daily_loss_usd - daily_loss_usd)
                .max(Decimal::ZERO),
            config: config.as_ref().clone(),
            daily_loss_usd,
            breaker,
            cooldown_remaining_secs,
            pending_approvals,
            as_of: now,
        }
    }
}

//! Loss Circuit Breaker
//!
//! Fail-closed state machine that halts high-risk operations after a run of
//! losing outcomes or a breach of the daily loss budget. It stays tripped
//! until its cooldown elapses (checked lazily by the next pre-check) or an
//! operator resets it.
//!
//! The breaker itself holds no locks; the governor serializes access.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Ok,
    /// High-risk operations blocked
    Tripped,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Ok => write!(f, "ok"),
            CircuitState::Tripped => write!(f, "tripped"),
        }
    }
}

/// Why the breaker tripped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TripReason {
    ConsecutiveLosses(u32),
    DailyLossLimit(Decimal),
    Manual(String),
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::ConsecutiveLosses(n) => write!(f, "{} consecutive losses", n),
            TripReason::DailyLossLimit(loss) => write!(f, "daily loss ${}", loss),
            TripReason::Manual(reason) => write!(f, "manual: {}", reason),
        }
    }
}

/// Persistable breaker state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub tripped: bool,
    pub consecutive_losses: u32,
    pub tripped_at: Option<DateTime<Utc>>,
    /// Cooldown captured when the breaker tripped
    pub cooldown_minutes: u64,
    #[serde(default)]
    pub last_trip_reason: Option<TripReason>,
    #[serde(default)]
    pub total_trips: u64,
}

impl CircuitBreakerState {
    pub fn circuit_state(&self) -> CircuitState {
        if self.tripped {
            CircuitState::Tripped
        } else {
            CircuitState::Ok
        }
    }
}

/// Result of evaluating the breaker for a pre-check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    /// Not tripped
    Clear,
    /// Was tripped, cooldown has elapsed and the breaker closed
    Recovered,
    /// Tripped; seconds until the cooldown ends
    Blocked { remaining_secs: u64 },
}

/// Consecutive-loss circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitBreakerState,
    loss_threshold: u32,
    cooldown_minutes: u64,
}

impl CircuitBreaker {
    pub fn new(loss_threshold: u32, cooldown_minutes: u64) -> Self {
        Self {
            state: CircuitBreakerState {
                tripped: false,
                consecutive_losses: 0,
                tripped_at: None,
                cooldown_minutes,
                last_trip_reason: None,
                total_trips: 0,
            },
            loss_threshold,
            cooldown_minutes,
        }
    }

    /// Apply reloaded limits. A trip already in progress keeps its cooldown.
    pub fn set_limits(&mut self, loss_threshold: u32, cooldown_minutes: u64) {
        self.loss_threshold = loss_threshold;
        self.cooldown_minutes = cooldown_minutes;
        if !self.state.tripped {
            self.state.cooldown_minutes = cooldown_minutes;
        }
    }

    pub fn state(&self) -> &CircuitBreakerState {
        &self.state
    }

    pub fn is_tripped(&self) -> bool {
        self.state.tripped
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.state.consecutive_losses
    }

    pub fn loss_threshold(&self) -> u32 {
        self.loss_threshold
    }

    /// Evaluate the breaker, closing it if its cooldown has elapsed
    pub fn check_at(&mut self, now: DateTime<Utc>) -> BreakerCheck {
        if !self.state.tripped {
            return BreakerCheck::Clear;
        }

        match self.cooldown_remaining_at(now) {
            Some(0) => {
                self.close();
                info!("Circuit breaker cooldown elapsed, trading resumed");
                BreakerCheck::Recovered
            }
            Some(remaining_secs) => BreakerCheck::Blocked { remaining_secs },
            // Tripped without a timestamp (restored state): only a reset clears it
            None => BreakerCheck::Blocked {
                remaining_secs: self.state.cooldown_minutes.saturating_mul(60),
            },
        }
    }

    /// Seconds left in the cooldown, without changing state
    pub fn cooldown_remaining_at(&self, now: DateTime<Utc>) -> Option<u64> {
        if !self.state.tripped {
            return None;
        }
        let tripped_at = self.state.tripped_at?;
        let until = i64::try_from(self.state.cooldown_minutes)
            .ok()
            .and_then(Duration::try_minutes)
            .and_then(|cooldown| tripped_at.checked_add_signed(cooldown));
        match until {
            Some(until) => Some(until.signed_duration_since(now).num_seconds().max(0) as u64),
            // Cooldown ends past the calendar range: stays tripped
            None => Some(u64::MAX),
        }
    }

    /// Record a losing outcome; returns the reason if this trips the breaker
    pub fn record_loss_at(&mut self, now: DateTime<Utc>) -> Option<TripReason> {
        self.state.consecutive_losses = self.state.consecutive_losses.saturating_add(1);
        let losses = self.state.consecutive_losses;

        warn!(
            "Losing outcome recorded. Consecutive losses: {}/{}",
            losses, self.loss_threshold
        );

        if losses >= self.loss_threshold {
            let reason = TripReason::ConsecutiveLosses(losses);
            if self.trip_at(reason.clone(), now) {
                return Some(reason);
            }
        }
        None
    }

    /// Record a winning or flat outcome
    pub fn record_win(&mut self) {
        self.state.consecutive_losses = 0;
    }

    /// Trip the breaker; returns false if it was already tripped
    pub fn trip_at(&mut self, reason: TripReason, now: DateTime<Utc>) -> bool {
        if self.state.tripped {
            return false;
        }

        self.state.tripped = true;
        self.state.tripped_at = Some(now);
        self.state.cooldown_minutes = self.cooldown_minutes;
        self.state.last_trip_reason = Some(reason.clone());
        self.state.total_trips += 1;

        warn!(
            "Circuit breaker TRIPPED: {} (cooldown {}m)",
            reason, self.state.cooldown_minutes
        );
        true
    }

    /// Manual reset: clears trip and loss counter
    pub fn reset(&mut self) {
        self.close();
        self.state.last_trip_reason = None;
    }

    /// Replace state with a persisted copy
    pub fn restore(&mut self, state: CircuitBreakerState) {
        self.state = state;
    }

    fn close(&mut self) {
        self.state.tripped = false;
        self.state.tripped_at = None;
        self.state.consecutive_losses = 0;
    }
}

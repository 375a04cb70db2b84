//! Approval registry for high-risk operations
//!
//! Each request moves `pending -> approved | rejected | expired` exactly once.
//! There are no timers: every read or write sweeps overdue requests first, so
//! an expiry and an explicit decision can never both win.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::OperationContext;
use crate::error::ApprovalError;

/// Approval lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    /// Check if this status can transition to another status
    pub fn can_transition_to(&self, target: ApprovalStatus) -> bool {
        use ApprovalStatus::*;

        matches!(
            (self, target),
            (Pending, Approved) | (Pending, Rejected) | (Pending, Expired)
        )
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Explicit operator decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl ApprovalDecision {
    fn target(&self) -> ApprovalStatus {
        match self {
            ApprovalDecision::Approve => ApprovalStatus::Approved,
            ApprovalDecision::Reject => ApprovalStatus::Rejected,
        }
    }
}

/// Pending authorization for one high-risk operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub tool_name: String,
    pub params: serde_json::Value,
    /// Operation as it was pre-checked; handed back on approval
    pub context: OperationContext,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub status: ApprovalStatus,
}

impl ApprovalRequest {
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && now >= self.expires_at
    }

    fn transition(&mut self, target: ApprovalStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(target) {
            return false;
        }
        self.status = target;
        self.resolved_at = Some(at);
        true
    }
}

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub purged: usize,
}

/// Purged ids remembered so late duplicate decisions still see their status
const MAX_TOMBSTONES: usize = 10_000;

/// `None` when the span does not fit a `Duration`
fn span_secs(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

/// Owns outstanding and recently-resolved approval requests
#[derive(Debug)]
pub struct ApprovalRegistry {
    requests: HashMap<String, ApprovalRequest>,
    /// How long resolved requests stay queryable; `None` keeps them
    retention: Option<Duration>,
    tombstones: HashMap<String, ApprovalStatus>,
    tombstone_order: VecDeque<String>,
}

impl ApprovalRegistry {
    pub fn new(retention_secs: u64) -> Self {
        Self {
            requests: HashMap::new(),
            retention: span_secs(retention_secs),
            tombstones: HashMap::new(),
            tombstone_order: VecDeque::new(),
        }
    }

    pub fn set_retention(&mut self, retention_secs: u64) {
        self.retention = span_secs(retention_secs);
    }

    /// Register a new pending request
    pub fn create_at(
        &mut self,
        context: OperationContext,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> ApprovalRequest {
        self.sweep_at(now);

        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            tool_name: context.tool_name.clone(),
            params: context.params.clone(),
            context,
            created_at: now,
            // A TTL past the calendar range never expires
            expires_at: span_secs(ttl_secs)
                .and_then(|ttl| now.checked_add_signed(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            resolved_at: None,
            status: ApprovalStatus::Pending,
        };

        info!(
            "Approval request {} created for {} (expires {})",
            request.id,
            request.tool_name,
            request.expires_at.format("%H:%M:%S UTC")
        );

        self.requests.insert(request.id.clone(), request.clone());
        request
    }

    /// Expire overdue requests and purge resolved ones past retention
    pub fn sweep_at(&mut self, now: DateTime<Utc>) -> SweepStats {
        let mut stats = SweepStats::default();

        for request in self.requests.values_mut() {
            if request.is_overdue_at(now) {
                // Expiry is stamped at the deadline, not at sweep time
                let expires_at = request.expires_at;
                if request.transition(ApprovalStatus::Expired, expires_at) {
                    stats.expired += 1;
                    info!("Approval request {} expired", request.id);
                }
            }
        }

        let retention = self.retention;
        let purgeable: Vec<String> = self
            .requests
            .values()
            .filter(|r| match (r.resolved_at, retention) {
                (Some(at), Some(keep)) if r.status.is_terminal() => at
                    .checked_add_signed(keep)
                    .map_or(false, |deadline| now >= deadline),
                _ => false,
            })
            .map(|r| r.id.clone())
            .collect();

        for id in purgeable {
            if let Some(request) = self.requests.remove(&id) {
                self.remember(request.id, request.status);
                stats.purged += 1;
            }
        }

        if stats.purged > 0 {
            debug!("Purged {} resolved approval requests", stats.purged);
        }
        stats
    }

    fn remember(&mut self, id: String, status: ApprovalStatus) {
        if self.tombstone_order.len() >= MAX_TOMBSTONES {
            if let Some(oldest) = self.tombstone_order.pop_front() {
                self.tombstones.remove(&oldest);
            }
        }
        self.tombstone_order.push_back(id.clone());
        self.tombstones.insert(id, status);
    }

    /// Requests still pending, oldest first
    pub fn pending_at(&mut self, now: DateTime<Utc>) -> Vec<ApprovalRequest> {
        self.sweep_at(now);
        let mut pending: Vec<ApprovalRequest> = self
            .requests
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// Count of pending requests that have not yet passed their deadline,
    /// without sweeping
    pub fn live_pending_count(&self, now: DateTime<Utc>) -> usize {
        self.requests
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending && now < r.expires_at)
            .count()
    }

    pub fn get_at(&mut self, id: &str, now: DateTime<Utc>) -> Option<ApprovalRequest> {
        self.sweep_at(now);
        self.requests.get(id).cloned()
    }

    /// Atomic check-and-set for an explicit decision
    pub fn resolve_at(
        &mut self,
        id: &str,
        decision: ApprovalDecision,
        now: DateTime<Utc>,
    ) -> std::result::Result<ApprovalRequest, ApprovalError> {
        self.sweep_at(now);

        let Some(request) = self.requests.get_mut(id) else {
            return Err(match self.tombstones.get(id) {
                Some(status) => ApprovalError::AlreadyResolved {
                    id: id.to_string(),
                    status: *status,
                },
                None => ApprovalError::NotFound { id: id.to_string() },
            });
        };

        if !request.transition(decision.target(), now) {
            return Err(ApprovalError::AlreadyResolved {
                id: id.to_string(),
                status: request.status,
            });
        }

        info!("Approval request {} {}", request.id, request.status);
        Ok(request.clone())
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

//! Governance Layer
//!
//! Everything that decides whether a mutating operation may reach the backend:
//! - Risk governor (ordered hard limits, outcome feedback)
//! - Circuit breaker for consecutive losses and daily budget breaches
//! - Daily loss accumulator with UTC date rollover
//! - Approval registry with lazy TTL expiry

pub mod approval;
pub mod circuit_breaker;
pub mod daily_loss;
pub mod governor;

pub use approval::{ApprovalDecision, ApprovalRegistry, ApprovalRequest, ApprovalStatus, SweepStats};
pub use circuit_breaker::{
    BreakerCheck, CircuitBreaker, CircuitBreakerState, CircuitState, TripReason,
};
pub use daily_loss::DailyLossAccumulator;
pub use governor::{DenyReason, RiskCheckResult, RiskGovernor, RiskMetrics};

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod governance;
pub mod monitor;
pub mod supervisor;

pub use config::{AppConfig, LoggingConfig, MonitorConfig, RiskConfig};
pub use domain::{
    BackendPosition, OperationContext, OperationKind, PositionSide, PositionSnapshot,
    TradeOutcome,
};
pub use error::{ApprovalError, GuardError, Result};
pub use exchange::{ExecutionBackend, JsonFileBackend};
pub use governance::{
    ApprovalDecision, ApprovalRequest, ApprovalStatus, CircuitBreakerState, CircuitState,
    DenyReason, RiskCheckResult, RiskGovernor, RiskMetrics, TripReason,
};
pub use monitor::{AlertThresholds, MonitorConfigUpdate, MonitorStatus, PositionTelemetryMonitor};
pub use supervisor::{Alert, AlertLevel, AlertManager, AlertManagerConfig, AlertMetric, AlertSink};

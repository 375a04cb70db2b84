//! Supervisor Layer
//!
//! Alert routing for the telemetry monitor:
//! - Alert records and the sink trait for external notification channels
//! - Alert manager with logging, local broadcast and rate-limited forwarding

pub mod alert_manager;

pub use alert_manager::{
    Alert, AlertLevel, AlertManager, AlertManagerConfig, AlertMetric, AlertSink,
};

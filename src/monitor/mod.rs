//! Position telemetry
//!
//! Independent polling of open positions with edge-triggered threshold alerts.

pub mod position_monitor;
pub mod thresholds;

pub use position_monitor::{MonitorConfigUpdate, MonitorStatus, PositionTelemetryMonitor};
pub use thresholds::{AlertThresholds, ThresholdTracker};

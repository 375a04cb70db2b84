//! Alert Manager
//!
//! Alerts are structured records handed to an external notification sink.
//! The manager logs every alert, broadcasts it to local subscribers and
//! forwards it to downstream sinks, rate limiting repeated forwards per
//! symbol and metric to prevent alert storms on the delivery channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Measured quantity that crossed a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    /// Distance from current price to liquidation price, percent
    LiquidationDistance,
    /// Move in unrealized P&L percent since the last baseline
    PnlChange,
}

impl AlertMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMetric::LiquidationDistance => "liquidation_distance_pct",
            AlertMetric::PnlChange => "pnl_change_pct",
        }
    }
}

impl std::fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertLevel,
    pub message: String,
    pub symbol: String,
    pub metric: AlertMetric,
    pub value: Decimal,
    pub threshold: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        severity: AlertLevel,
        symbol: &str,
        metric: AlertMetric,
        value: Decimal,
        threshold: Decimal,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            message: message.into(),
            symbol: symbol.to_string(),
            metric,
            value,
            threshold,
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Plain-text rendering for chat-style channels
    pub fn format_text(&self) -> String {
        format!(
            "[{}] {} {}: {} (value {}, threshold {})\n{}",
            self.severity.as_str().to_uppercase(),
            self.symbol,
            self.metric,
            self.message,
            self.value,
            self.threshold,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        )
    }
}

/// External notification channel
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Configuration for alert manager
#[derive(Debug, Clone)]
pub struct AlertManagerConfig {
    /// Minimum interval between forwards of the same symbol/metric/severity (default: 60s)
    pub rate_limit_secs: u64,
    /// Whether to forward info level alerts (default: false)
    pub forward_info: bool,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 60,
            forward_info: false,
        }
    }
}

/// Rate limiter state for an alert key
#[derive(Debug)]
struct RateLimitState {
    last_sent: DateTime<Utc>,
    suppressed_count: u32,
}

/// Routes alerts to logs, local subscribers and downstream sinks
pub struct AlertManager {
    config: AlertManagerConfig,
    sinks: Vec<Arc<dyn AlertSink>>,
    rate_limits: Arc<RwLock<HashMap<String, RateLimitState>>>,
    event_tx: broadcast::Sender<Alert>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config,
            sinks: Vec::new(),
            rate_limits: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AlertManagerConfig::default())
    }

    /// Add a downstream delivery sink
    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Subscribe to every alert, unthrottled
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.event_tx.subscribe()
    }

    fn rate_limit_key(alert: &Alert) -> String {
        format!("{}:{}:{}", alert.symbol, alert.metric, alert.severity)
    }

    async fn should_rate_limit(&self, alert: &Alert) -> bool {
        if self.config.rate_limit_secs == 0 {
            return false;
        }

        let key = Self::rate_limit_key(alert);
        let now = alert.timestamp;
        let mut limits = self.rate_limits.write().await;

        if let Some(state) = limits.get_mut(&key) {
            let elapsed = now.signed_duration_since(state.last_sent).num_seconds();
            let window = i64::try_from(self.config.rate_limit_secs).unwrap_or(i64::MAX);
            if elapsed < window {
                state.suppressed_count += 1;
                debug!(
                    "Rate limiting alert '{}' ({} suppressed)",
                    key, state.suppressed_count
                );
                return true;
            }

            state.last_sent = now;
            state.suppressed_count = 0;
        } else {
            limits.insert(
                key,
                RateLimitState {
                    last_sent: now,
                    suppressed_count: 0,
                },
            );
        }

        false
    }

    /// Get suppressed alert counts
    pub async fn suppressed_counts(&self) -> HashMap<String, u32> {
        let limits = self.rate_limits.read().await;
        limits
            .iter()
            .filter(|(_, state)| state.suppressed_count > 0)
            .map(|(key, state)| (key.clone(), state.suppressed_count))
            .collect()
    }

    /// Reset rate limits
    pub async fn reset_rate_limits(&self) {
        self.rate_limits.write().await.clear();
        debug!("Alert rate limits reset");
    }
}

#[async_trait]
impl AlertSink for AlertManager {
    async fn send(&self, alert: &Alert) -> Result<()> {
        // Always broadcast locally
        let _ = self.event_tx.send(alert.clone());

        match alert.severity {
            AlertLevel::Info => info!(
                symbol = %alert.symbol,
                metric = %alert.metric,
                "{}", alert.message
            ),
            AlertLevel::Warning => warn!(
                symbol = %alert.symbol,
                metric = %alert.metric,
                "{}", alert.message
            ),
            AlertLevel::Critical => error!(
                symbol = %alert.symbol,
                metric = %alert.metric,
                "CRITICAL {}", alert.message
            ),
        }

        if alert.severity == AlertLevel::Info && !self.config.forward_info {
            return Ok(());
        }
        if self.sinks.is_empty() || self.should_rate_limit(alert).await {
            return Ok(());
        }

        for sink in &self.sinks {
            if let Err(e) = sink.send(alert).await {
                error!("Failed to deliver alert for {}: {}", alert.symbol, e);
            }
        }
        Ok(())
    }
}

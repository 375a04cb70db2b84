use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{GuardError, Result};
use crate::monitor::AlertThresholds;

/// Environment variable prefix (`TRADEGUARD_RISK__MAX_DAILY_LOSS_USD`, ...)
pub const ENV_PREFIX: &str = "TRADEGUARD";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hard limits enforced by the risk governor.
///
/// A governor evaluates each pre-check against one immutable snapshot of this
/// struct; replacing it only affects later evaluations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum notional of a single operation in USD
    #[serde(default = "default_max_position_size_usd")]
    pub max_position_size_usd: Decimal,
    /// Realized loss budget per UTC day in USD (absolute value)
    #[serde(default = "default_max_daily_loss_usd")]
    pub max_daily_loss_usd: Decimal,
    /// Maximum concurrently open positions
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    /// Gate high-risk operations behind an approval request
    #[serde(default = "default_require_confirmation")]
    pub require_confirmation: bool,
    /// Symbols that may never be traded (matched case-insensitively)
    #[serde(default)]
    pub blacklisted_symbols: BTreeSet<String>,
    /// Consecutive losing outcomes that trip the circuit breaker
    #[serde(default = "default_consecutive_loss_threshold")]
    pub consecutive_loss_threshold: u32,
    /// Minutes a tripped breaker stays tripped
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,
    /// Seconds before a pending approval expires
    #[serde(default = "default_approval_ttl_seconds")]
    pub approval_ttl_seconds: u64,
    /// Fraction of a limit at which a non-fatal warning is attached (e.g. 0.8)
    #[serde(default = "default_size_warning_ratio")]
    pub size_warning_ratio: Decimal,
    /// Seconds a resolved approval stays queryable before it is purged
    #[serde(default = "default_approval_retention_seconds")]
    pub approval_retention_seconds: u64,
}

fn default_max_position_size_usd() -> Decimal {
    dec!(1000)
}

fn default_max_daily_loss_usd() -> Decimal {
    dec!(500)
}

fn default_max_open_positions() -> u32 {
    5
}

fn default_require_confirmation() -> bool {
    true
}

fn default_consecutive_loss_threshold() -> u32 {
    3
}

/// Longest accepted breaker cooldown (one year)
pub const MAX_COOLDOWN_MINUTES: u64 = 525_600;
/// Longest accepted approval TTL or retention (30 days)
pub const MAX_APPROVAL_WINDOW_SECONDS: u64 = 30 * 86_400;

fn default_cooldown_minutes() -> u64 {
    60
}

fn default_approval_ttl_seconds() -> u64 {
    300
}

fn default_size_warning_ratio() -> Decimal {
    dec!(0.8)
}

fn default_approval_retention_seconds() -> u64 {
    3600
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size_usd: default_max_position_size_usd(),
            max_daily_loss_usd: default_max_daily_loss_usd(),
            max_open_positions: default_max_open_positions(),
            require_confirmation: default_require_confirmation(),
            blacklisted_symbols: BTreeSet::new(),
            consecutive_loss_threshold: default_consecutive_loss_threshold(),
            cooldown_minutes: default_cooldown_minutes(),
            approval_ttl_seconds: default_approval_ttl_seconds(),
            size_warning_ratio: default_size_warning_ratio(),
            approval_retention_seconds: default_approval_retention_seconds(),
        }
    }
}

impl RiskConfig {
    /// Check a symbol against the blacklist
    pub fn is_blacklisted(&self, symbol: &str) -> bool {
        let symbol = symbol.trim();
        self.blacklisted_symbols
            .iter()
            .any(|s| s.trim().eq_ignore_ascii_case(symbol))
    }

    /// Validate limit values, collecting every violation
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_position_size_usd <= Decimal::ZERO {
            errors.push("risk.max_position_size_usd must be positive".to_string());
        }
        if self.max_daily_loss_usd <= Decimal::ZERO {
            errors.push("risk.max_daily_loss_usd must be positive".to_string());
        }
        if self.max_open_positions == 0 {
            errors.push("risk.max_open_positions must be at least 1".to_string());
        }
        if self.consecutive_loss_threshold == 0 {
            errors.push("risk.consecutive_loss_threshold must be at least 1".to_string());
        }
        if self.cooldown_minutes > MAX_COOLDOWN_MINUTES {
            errors.push(format!(
                "risk.cooldown_minutes must be at most {}",
                MAX_COOLDOWN_MINUTES
            ));
        }
        if self.approval_ttl_seconds == 0
            || self.approval_ttl_seconds > MAX_APPROVAL_WINDOW_SECONDS
        {
            errors.push(format!(
                "risk.approval_ttl_seconds must be in 1..={}",
                MAX_APPROVAL_WINDOW_SECONDS
            ));
        }
        if self.approval_retention_seconds > MAX_APPROVAL_WINDOW_SECONDS {
            errors.push(format!(
                "risk.approval_retention_seconds must be at most {}",
                MAX_APPROVAL_WINDOW_SECONDS
            ));
        }
        if self.size_warning_ratio <= Decimal::ZERO || self.size_warning_ratio > Decimal::ONE {
            errors.push("risk.size_warning_ratio must be in (0, 1]".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Position telemetry monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Delay between the end of one poll tick and the start of the next
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Alert when price is within this percentage of the liquidation price
    #[serde(default = "default_liquidation_warning_pct")]
    pub liquidation_warning_pct: Decimal,
    /// Alert when unrealized P&L % moves this far from its baseline
    #[serde(default = "default_pnl_change_alert_pct")]
    pub pnl_change_alert_pct: Decimal,
    #[serde(default = "default_enable_alerts")]
    pub enable_alerts: bool,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_liquidation_warning_pct() -> Decimal {
    dec!(10)
}

fn default_pnl_change_alert_pct() -> Decimal {
    dec!(5)
}

fn default_enable_alerts() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            liquidation_warning_pct: default_liquidation_warning_pct(),
            pnl_change_alert_pct: default_pnl_change_alert_pct(),
            enable_alerts: default_enable_alerts(),
        }
    }
}

impl MonitorConfig {
    pub fn thresholds(&self) -> AlertThresholds {
        AlertThresholds {
            liquidation_warning_pct: self.liquidation_warning_pct,
            pnl_change_alert_pct: self.pnl_change_alert_pct,
            enable_alerts: self.enable_alerts,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.poll_interval_ms == 0 {
            errors.push("monitor.poll_interval_ms must be at least 1".to_string());
        }
        if self.liquidation_warning_pct < Decimal::ZERO {
            errors.push("monitor.liquidation_warning_pct must not be negative".to_string());
        }
        if self.pnl_change_alert_pct <= Decimal::ZERO {
            errors.push("monitor.pnl_change_alert_pct must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        Self::load_with_overrides(config_dir, &[])
    }

    /// Load configuration with explicit overrides applied last.
    ///
    /// Layers, lowest precedence first: built-in defaults, `default.toml`,
    /// `$TRADEGUARD_ENV.toml` (default `development`), `TRADEGUARD_*`
    /// environment variables, then `overrides` (dotted keys such as
    /// `risk.max_daily_loss_usd`). List values are comma separated.
    pub fn load_with_overrides<P: AsRef<Path>>(
        config_dir: P,
        overrides: &[(&str, &str)],
    ) -> Result<Self> {
        let config_dir = config_dir.as_ref();
        let profile =
            std::env::var("TRADEGUARD_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = Self::with_defaults(Config::builder())?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(File::from(config_dir.join(profile)).required(false));

        Self::finish(builder, overrides)
    }

    /// Load configuration from a single explicit file (plus environment and overrides)
    pub fn load_file<P: AsRef<Path>>(path: P, overrides: &[(&str, &str)]) -> Result<Self> {
        let builder = Self::with_defaults(Config::builder())?
            .add_source(File::from(path.as_ref()).required(true));

        Self::finish(builder, overrides)
    }

    fn with_defaults(
        builder: ConfigBuilder<DefaultState>,
    ) -> std::result::Result<ConfigBuilder<DefaultState>, ConfigError> {
        let risk = RiskConfig::default();
        let monitor = MonitorConfig::default();

        builder
            .set_default("risk.max_position_size_usd", risk.max_position_size_usd.to_string())?
            .set_default("risk.max_daily_loss_usd", risk.max_daily_loss_usd.to_string())?
            .set_default("risk.max_open_positions", risk.max_open_positions as i64)?
            .set_default("risk.require_confirmation", risk.require_confirmation)?
            .set_default("risk.blacklisted_symbols", Vec::<String>::new())?
            .set_default(
                "risk.consecutive_loss_threshold",
                risk.consecutive_loss_threshold as i64,
            )?
            .set_default("risk.cooldown_minutes", risk.cooldown_minutes as i64)?
            .set_default("risk.approval_ttl_seconds", risk.approval_ttl_seconds as i64)?
            .set_default("risk.size_warning_ratio", risk.size_warning_ratio.to_string())?
            .set_default(
                "risk.approval_retention_seconds",
                risk.approval_retention_seconds as i64,
            )?
            .set_default("monitor.poll_interval_ms", monitor.poll_interval_ms as i64)?
            .set_default(
                "monitor.liquidation_warning_pct",
                monitor.liquidation_warning_pct.to_string(),
            )?
            .set_default(
                "monitor.pnl_change_alert_pct",
                monitor.pnl_change_alert_pct.to_string(),
            )?
            .set_default("monitor.enable_alerts", monitor.enable_alerts)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)
    }

    fn finish(
        builder: ConfigBuilder<DefaultState>,
        overrides: &[(&str, &str)],
    ) -> Result<Self> {
        // Override with environment variables (TRADEGUARD_RISK__MAX_DAILY_LOSS_USD, etc.)
        let mut builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("risk.blacklisted_symbols")
                .try_parsing(true),
        );

        for (key, value) in overrides {
            builder = if *key == "risk.blacklisted_symbols" {
                let symbols: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                builder.set_override(*key, symbols)?
            } else {
                builder.set_override(*key, *value)?
            };
        }

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate().map_err(GuardError::InvalidConfig)?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(mut e) = self.risk.validate() {
            errors.append(&mut e);
        }
        if let Err(mut e) = self.monitor.validate() {
            errors.append(&mut e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

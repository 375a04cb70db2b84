use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::domain::{OperationContext, OperationKind, PositionSide, PositionSnapshot};
use crate::error::{GuardError, Result};
use crate::exchange::JsonFileBackend;
use crate::governance::{RiskCheckResult, RiskGovernor};
use crate::monitor::{MonitorStatus, PositionTelemetryMonitor};
use crate::supervisor::AlertManager;

#[derive(Parser, Debug)]
#[command(name = "tradeguard")]
#[command(version)]
#[command(about = "Risk limits, approval gating and position telemetry for trading backends", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and per-environment files
    #[arg(long, default_value = "config", env = "TRADEGUARD_CONFIG_DIR")]
    pub config_dir: PathBuf,

    /// Single config file; replaces the directory lookup
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override a setting, e.g. `--set risk.max_daily_loss_usd=250`
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective configuration after all layers are applied
    Config {
        #[arg(long, value_enum, default_value_t = OutputFormat::Toml)]
        format: OutputFormat,
    },
    /// Run a pre-check for one operation against a fresh governor
    Check {
        /// Tool or command name (classifies the operation kind)
        tool: String,
        /// Explicit operation kind, overriding classification
        #[arg(long)]
        kind: Option<OperationKind>,
        #[arg(short, long)]
        symbol: Option<String>,
        /// long / short (buy / sell accepted)
        #[arg(long)]
        side: Option<PositionSide>,
        /// Notional size in USD
        #[arg(short, long)]
        notional: Option<Decimal>,
        /// Positions already open
        #[arg(long, default_value_t = 0)]
        open_positions: u32,
    },
    /// Watch positions exported to a JSON file
    Monitor {
        /// JSON array of open positions, re-read on every poll
        #[arg(short, long)]
        positions: PathBuf,
        /// Poll once, print status and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Toml,
    Json,
}

impl Cli {
    /// Resolve configuration from the global flags
    pub fn load_config(&self) -> Result<AppConfig> {
        let parsed = self
            .overrides
            .iter()
            .map(|raw| parse_override(raw))
            .collect::<Result<Vec<_>>>()?;
        let overrides: Vec<(&str, &str)> = parsed
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        match &self.config {
            Some(path) => AppConfig::load_file(path, &overrides),
            None => AppConfig::load_with_overrides(&self.config_dir, &overrides),
        }
    }
}

/// Split `key=value`; the key must be a dotted config path
pub fn parse_override(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| GuardError::Validation(format!("override '{}' is not KEY=VALUE", raw)))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(GuardError::Validation(format!("override '{}' has an empty key", raw)));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

#[derive(Serialize)]
struct MonitorReport {
    status: MonitorStatus,
    positions: Vec<PositionSnapshot>,
}

pub async fn run(command: &Commands, config: AppConfig) -> Result<()> {
    match command {
        Commands::Config { format } => {
            let rendered = match format {
                OutputFormat::Toml => toml::to_string_pretty(&config)
                    .map_err(|e| GuardError::Internal(format!("toml render failed: {}", e)))?,
                OutputFormat::Json => serde_json::to_string_pretty(&config)?,
            };
            println!("{}", rendered);
        }
        Commands::Check {
            tool,
            kind,
            symbol,
            side,
            notional,
            open_positions,
        } => {
            let result = check_operation(
                &config,
                tool,
                *kind,
                symbol.as_deref(),
                *side,
                *notional,
                *open_positions,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Monitor { positions, once } => {
            let monitor = PositionTelemetryMonitor::new(
                Arc::new(JsonFileBackend::new(positions.clone())),
                Arc::new(AlertManager::with_defaults()),
                config.monitor.clone(),
            );

            if *once {
                monitor.poll_once().await?;
            } else {
                monitor.start(config.monitor.clone()).await?;
                tokio::signal::ctrl_c().await?;
                info!("Shutdown signal received");
                monitor.stop();
            }

            let report = MonitorReport {
                status: monitor.status(),
                positions: monitor.all_positions(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

/// Build the operation from flags and pre-check it
pub async fn check_operation(
    config: &AppConfig,
    tool: &str,
    kind: Option<OperationKind>,
    symbol: Option<&str>,
    side: Option<PositionSide>,
    notional: Option<Decimal>,
    open_positions: u32,
) -> Result<RiskCheckResult> {
    let governor = RiskGovernor::new(config.risk.clone())?;

    let mut ctx = OperationContext::new(tool)
        .with_open_positions(open_positions)
        .requested_by("cli");
    if let Some(kind) = kind {
        ctx = ctx.with_kind(kind);
    }
    if let Some(symbol) = symbol {
        ctx = ctx.with_symbol(symbol);
    }
    if let Some(side) = side {
        ctx = ctx.with_side(side);
    }
    if let Some(notional) = notional {
        ctx = ctx.with_notional(notional);
    }

    Ok(governor.pre_check(&ctx).await)
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{GuardError, Result};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    fn sign(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" | "bid" => Ok(Self::Long),
            "short" | "sell" | "ask" => Ok(Self::Short),
            other => Err(format!("invalid position side: {other}")),
        }
    }
}

/// Open position as reported by the execution backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    /// Mark price at the time of the read
    pub current_price: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    /// Isolated margin posted; zero when the backend does not report it
    #[serde(default)]
    pub margin: Decimal,
    #[serde(default)]
    pub liquidation_price: Option<Decimal>,
    /// Backend identifier distinguishing rows with the same symbol and side
    /// (sub-accounts, hedge legs)
    #[serde(default)]
    pub position_id: Option<String>,
}

fn default_leverage() -> Decimal {
    Decimal::ONE
}

/// Risk view of one open position, recomputed from a backend read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub leverage: Decimal,
    pub margin: Decimal,
    pub liquidation_price: Option<Decimal>,
    pub unrealized_pnl: Decimal,
    /// Unrealized P&L relative to margin, in percent
    pub unrealized_pnl_pct: Decimal,
    /// Distance from current price to liquidation, in percent of current price.
    /// Zero once the price is at or beyond liquidation.
    pub liquidation_distance_pct: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PositionSnapshot {
    /// Build a snapshot from a backend read.
    ///
    /// Fails with `GuardError::Backend` when the row's values overflow the
    /// P&L or distance arithmetic.
    pub fn from_backend(raw: &BackendPosition, now: DateTime<Utc>) -> Result<Self> {
        let overflow = || {
            GuardError::Backend(format!(
                "{} {}: values out of range for P&L calculation",
                raw.symbol, raw.side
            ))
        };

        let unrealized_pnl = raw
            .current_price
            .checked_sub(raw.entry_price)
            .and_then(|d| d.checked_mul(raw.quantity.abs()))
            .map(|pnl| pnl * raw.side.sign())
            .ok_or_else(overflow)?;

        let basis = Self::margin_basis(raw).ok_or_else(overflow)?;
        let unrealized_pnl_pct = if basis > Decimal::ZERO {
            unrealized_pnl
                .checked_div(basis)
                .and_then(|r| r.checked_mul(HUNDRED))
                .ok_or_else(overflow)?
                .round_dp(4)
        } else {
            Decimal::ZERO
        };

        let liquidation_distance_pct = match raw.liquidation_price {
            Some(_) => Self::liquidation_distance(raw).ok_or_else(overflow)?,
            None => None,
        };

        Ok(Self {
            symbol: raw.symbol.clone(),
            side: raw.side,
            quantity: raw.quantity,
            entry_price: raw.entry_price,
            current_price: raw.current_price,
            leverage: raw.leverage,
            margin: raw.margin,
            liquidation_price: raw.liquidation_price,
            unrealized_pnl,
            unrealized_pnl_pct,
            liquidation_distance_pct,
            position_id: raw.position_id.clone(),
            updated_at: now,
        })
    }

    /// Posted margin, or entry notional / leverage when not reported
    fn margin_basis(raw: &BackendPosition) -> Option<Decimal> {
        if raw.margin > Decimal::ZERO {
            return Some(raw.margin);
        }
        let notional = raw.entry_price.checked_mul(raw.quantity.abs())?;
        let leverage = if raw.leverage > Decimal::ZERO {
            raw.leverage
        } else {
            Decimal::ONE
        };
        notional.checked_div(leverage)
    }

    /// Outer `None` on overflow; inner `None` when there is no usable price
    fn liquidation_distance(raw: &BackendPosition) -> Option<Option<Decimal>> {
        let liq = match raw.liquidation_price.filter(|p| *p > Decimal::ZERO) {
            Some(liq) => liq,
            None => return Some(None),
        };
        if raw.current_price <= Decimal::ZERO {
            return Some(None);
        }

        let gap = match raw.side {
            PositionSide::Long => raw.current_price.checked_sub(liq)?,
            PositionSide::Short => liq.checked_sub(raw.current_price)?,
        };
        let pct = gap.checked_div(raw.current_price)?.checked_mul(HUNDRED)?;
        Some(Some(pct.max(Decimal::ZERO).round_dp(4)))
    }

    /// Key identifying the position across polls.
    ///
    /// Rows without a `position_id` are keyed on symbol and side alone, so
    /// two such rows for the same market share alert state.
    pub fn key(&self) -> String {
        match &self.position_id {
            Some(id) => format!("{}:{}:{}", self.symbol, self.side, id),
            None => format!("{}:{}", self.symbol, self.side),
        }
    }

    pub fn notional(&self) -> Decimal {
        self.current_price.saturating_mul(self.quantity.abs())
    }
}

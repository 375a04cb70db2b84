use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::PositionSide;

/// What an operation does to the execution backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Read-only query (balances, positions, quotes)
    Query,
    /// Open or increase a position
    OpenPosition,
    /// Reduce or close a position
    ClosePosition,
    /// Place a new order
    PlaceOrder,
    /// Cancel a resting order
    CancelOrder,
    /// Change leverage or margin on an existing position
    ModifyPosition,
    /// Unrecognized tool; treated as the riskiest kind
    Unknown,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::OpenPosition => "open_position",
            OperationKind::ClosePosition => "close_position",
            OperationKind::PlaceOrder => "place_order",
            OperationKind::CancelOrder => "cancel_order",
            OperationKind::ModifyPosition => "modify_position",
            OperationKind::Unknown => "unknown",
        }
    }

    /// Mutates real positions or orders on the backend
    pub fn is_high_risk(&self) -> bool {
        !matches!(self, OperationKind::Query)
    }

    /// May add a new open position (subject to the open-position cap)
    pub fn opens_exposure(&self) -> bool {
        matches!(
            self,
            OperationKind::OpenPosition | OperationKind::PlaceOrder | OperationKind::Unknown
        )
    }

    /// Classify a tool / command name.
    ///
    /// Names that match nothing are `Unknown`, which is high-risk.
    pub fn classify(tool_name: &str) -> Self {
        let name = tool_name.trim().to_ascii_lowercase();
        let has = |needle: &str| name.contains(needle);

        if ["get", "list", "fetch", "show", "query", "status", "quote", "balance"]
            .iter()
            .any(|p| name.starts_with(p))
        {
            OperationKind::Query
        } else if has("cancel") {
            OperationKind::CancelOrder
        } else if has("close") || has("reduce") || has("exit") {
            OperationKind::ClosePosition
        } else if has("leverage") || has("margin") || has("modify") {
            OperationKind::ModifyPosition
        } else if has("open") || has("long") || has("short") || has("buy") || has("sell") {
            OperationKind::OpenPosition
        } else if has("order") || has("trade") {
            OperationKind::PlaceOrder
        } else {
            OperationKind::Unknown
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "query" => Ok(Self::Query),
            "open_position" | "open" => Ok(Self::OpenPosition),
            "close_position" | "close" => Ok(Self::ClosePosition),
            "place_order" | "order" => Ok(Self::PlaceOrder),
            "cancel_order" | "cancel" => Ok(Self::CancelOrder),
            "modify_position" | "modify" => Ok(Self::ModifyPosition),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("invalid operation kind: {other}")),
        }
    }
}

/// Everything the governor needs to judge one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    /// Tool or command that will run against the backend
    pub tool_name: String,
    pub kind: OperationKind,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<PositionSide>,
    /// Notional size in USD, when the operation carries one
    #[serde(default)]
    pub notional_usd: Option<Decimal>,
    /// Open positions at the time of the request, as seen by the caller
    #[serde(default)]
    pub open_position_count: u32,
    /// Raw tool parameters, carried through approvals untouched
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub requested_by: Option<String>,
}

impl OperationContext {
    /// Create a context, classifying the kind from the tool name
    pub fn new(tool_name: impl Into<String>) -> Self {
        let tool_name = tool_name.into();
        Self {
            kind: OperationKind::classify(&tool_name),
            tool_name,
            symbol: None,
            side: None,
            notional_usd: None,
            open_position_count: 0,
            params: serde_json::Value::Null,
            requested_by: None,
        }
    }

    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_side(mut self, side: PositionSide) -> Self {
        self.side = Some(side);
        self
    }

    pub fn with_notional(mut self, notional_usd: Decimal) -> Self {
        self.notional_usd = Some(notional_usd);
        self
    }

    pub fn with_open_positions(mut self, count: u32) -> Self {
        self.open_position_count = count;
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn requested_by(mut self, caller: impl Into<String>) -> Self {
        self.requested_by = Some(caller.into());
        self
    }

    pub fn is_high_risk(&self) -> bool {
        self.kind.is_high_risk()
    }
}

/// Result of an executed operation, reported back to the governor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    /// Realized P&L in USD (negative = loss)
    pub realized_pnl: Decimal,
    #[serde(default)]
    pub symbol: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl TradeOutcome {
    pub fn new(realized_pnl: Decimal) -> Self {
        Self {
            realized_pnl,
            symbol: None,
            executed_at: Utc::now(),
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn is_loss(&self) -> bool {
        self.realized_pnl < Decimal::ZERO
    }
}

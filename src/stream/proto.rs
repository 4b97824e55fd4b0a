//! Wire model for dashboard stream updates.
//!
//! Each event-stream message carries one JSON object:
//! `{"type": "update" | "error", "data": {...}?, "message": "..."?}`.
//! Every payload fragment is independently optional and unknown fields are
//! ignored at every level.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Update,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamUpdate {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<UpdatePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Union of optional dashboard fragments carried by an update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<TradeStatsMsg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pl: Option<PlSummaryMsg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions: Option<Vec<PositionMsg>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pl_history: Option<Vec<PlHistoryPointMsg>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker_pl: Option<Vec<TickerPlMsg>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeStatsMsg {
    pub total_trades: u64,
    pub bought_trades: u64,
    pub sold_trades: u64,
    pub realized_pl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlSummaryMsg {
    pub realized: f64,
    pub unrealized: f64,
    pub realized_pl: Vec<RealizedPlMsg>,
    pub unrealized_pl: Vec<UnrealizedPlMsg>,
}

/// One closed round trip: a sell matched against an earlier buy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealizedPlMsg {
    pub ticker: String,
    pub strike: f64,
    pub option_type: String,
    pub contracts: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pl: f64,
}

/// Mark-to-market P/L of an open position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnrealizedPlMsg {
    pub ticker: String,
    pub strike: f64,
    pub option_type: String,
    pub quantity: i64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub unrealized_pl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionMsg {
    pub ticker: String,
    pub strike: f64,
    pub option_type: String,
    pub quantity: i64,
    /// `null` on the wire when the entry fill price was never recorded.
    pub avg_entry_price: Option<f64>,
    pub last_updated: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlHistoryPointMsg {
    pub date: String,
    pub daily_pl: f64,
    pub cumulative_pl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickerPlMsg {
    pub ticker: String,
    pub pl: f64,
}

/// Raised when an inbound message body is not a well-formed update.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed stream update: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parses one raw event payload into a [`StreamUpdate`].
///
/// Parsing is structural only: business values are not validated.
pub fn decode(raw: &str) -> Result<StreamUpdate, DecodeError> {
    Ok(serde_json::from_str(raw)?)
}

impl StreamUpdate {
    pub fn from_text(text: &str) -> Result<Self, DecodeError> {
        decode(text)
    }

    pub fn is_error(&self) -> bool {
        self.kind == UpdateKind::Error
    }
}

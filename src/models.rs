use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A single minute bar of OHLCV market data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    /// Per-bar cap on executable quantity; `None` means uncapped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tradeable_volume: Option<f64>,
}

impl Bar {
    /// Quantity cap usable by the execution pipeline. Uncapped bars trade
    /// without a volume limit.
    pub fn tradeable_quantity(&self) -> f64 {
        self.max_tradeable_volume.unwrap_or(f64::INFINITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
    Short,
    Cover,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Short => "SHORT",
            TradeAction::Cover => "COVER",
        }
    }

    /// Buy-side actions pay cash and cross the spread upward.
    pub fn is_buy_side(&self) -> bool {
        matches!(self, TradeAction::Buy | TradeAction::Cover)
    }

    /// Entry actions open lots; exit actions consume them oldest-first.
    pub fn is_entry(&self) -> bool {
        matches!(self, TradeAction::Buy | TradeAction::Short)
    }
}

impl FromStr for TradeAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(TradeAction::Buy),
            "SELL" => Ok(TradeAction::Sell),
            "SHORT" => Ok(TradeAction::Short),
            "COVER" => Ok(TradeAction::Cover),
            _ => Err(anyhow!("Invalid trade action: {}", s)),
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directional intent emitted by a strategy. `Buy` covers shorts or opens
/// longs, `Sell` closes longs or opens shorts, `Hold` is an explicit no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Hold => "HOLD",
        }
    }
}

/// One executed trade in the append-only audit sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub trade_id: String,
    /// Stable id for the position episode this trade belongs to; increments
    /// each time the portfolio transitions from flat to non-flat.
    pub position_id: u64,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub action: TradeAction,
    pub quantity: i64,
    pub executed_price: f64,
    pub gross_value: f64,
    pub fees: f64,
    /// Realized profit net of prorated entry fees and exit fees. `None` for
    /// position-opening trades.
    pub net_profit: Option<f64>,
    pub reason: String,
}

pub fn generate_trade_id() -> String {
    Uuid::new_v4().to_string()
}

/// End-of-bar portfolio valuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cash: f64,
    pub holdings_value: f64,
    pub total_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub annualized_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub max_drawdown_start: Option<DateTime<Utc>>,
    pub max_drawdown_end: Option<DateTime<Utc>>,
    pub win_rate_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub profit_factor: f64,
    pub total_trades: usize,
    pub avg_trade_duration_minutes: f64,
}

impl MetricsReport {
    pub fn empty() -> Self {
        Self {
            annualized_return_pct: 0.0,
            max_drawdown_pct: 0.0,
            max_drawdown_start: None,
            max_drawdown_end: None,
            win_rate_pct: 0.0,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            calmar_ratio: 0.0,
            profit_factor: 0.0,
            total_trades: 0,
            avg_trade_duration_minutes: 0.0,
        }
    }
}

/// Complete output of one backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestSummary {
    pub run_id: String,
    pub symbol: String,
    pub strategy: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub initial_cash: f64,
    pub final_cash: f64,
    pub final_holdings: i64,
    pub final_value: f64,
    pub skipped_trades: u32,
    pub trades: Vec<TradeRecord>,
    pub valuations: Vec<ValuationSnapshot>,
    pub metrics: MetricsReport,
}

/// One evaluated parameter combination from a grid search.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationRecord {
    pub parameters: HashMap<String, f64>,
    pub metrics: MetricsReport,
    pub final_value: f64,
    pub skipped_trades: u32,
}

/// Parse a JSON object of numeric parameters into the flat map the engine
/// and strategies consume. Booleans coerce to 0/1; anything else is an error.
pub fn parse_parameter_map_from_json(raw: &str) -> Result<HashMap<String, f64>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| anyhow!("Invalid parameter JSON: {}", e))?;
    let object = value
        .as_object()
        .ok_or_else(|| anyhow!("Parameter JSON must be an object"))?;

    let mut params = HashMap::new();
    for (key, entry) in object {
        let number = match entry {
            serde_json::Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| anyhow!("Parameter {} is not a finite number", key))?,
            serde_json::Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            other => {
                return Err(anyhow!(
                    "Parameter {} must be numeric (found: {})",
                    key,
                    other
                ))
            }
        };
        params.insert(key.clone(), number);
    }
    Ok(params)
}

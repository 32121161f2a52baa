pub mod config;
pub mod data;
pub mod fees;
pub mod indicators;
pub mod ledger;
pub mod logger;
pub mod metrics;
pub mod models;
pub mod optimizer;
pub mod param_utils;
pub mod portfolio;
pub mod slippage;
pub mod strategies;
pub mod strategy;
pub mod stress;

pub use config::{EngineConfig, FeeConfig};
pub use data::MarketData;
pub use ledger::{LedgerError, PositionLedger};
pub use metrics::MetricsEngine;
pub use models::{
    BacktestSummary, Bar, MetricsReport, SignalAction, TradeAction, TradeRecord,
    ValuationSnapshot,
};
pub use portfolio::PortfolioEngine;
pub use strategy::{Strategy, StrategyRegistry};

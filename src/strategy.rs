use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::data::MarketData;
use crate::models::SignalAction;

/// Read-only portfolio state handed to strategies at signal time.
#[derive(Debug, Clone, Copy)]
pub struct PortfolioView {
    pub cash: f64,
    pub net_quantity: i64,
    pub last_trade_timestamp: Option<DateTime<Utc>>,
}

impl PortfolioView {
    pub fn is_flat(&self) -> bool {
        self.net_quantity == 0
    }
}

pub trait Strategy: Send {
    fn template_id(&self) -> &'static str;

    /// Emit the directional intent for the bar at `index`, whose close is the
    /// decision price. Bars after `index` must never influence the signal.
    fn generate_signal(
        &mut self,
        timestamp: DateTime<Utc>,
        data: &MarketData,
        index: usize,
        portfolio: &PortfolioView,
    ) -> Option<SignalAction>;

    /// Bars of warmup required before the first meaningful signal.
    fn min_data_points(&self) -> usize {
        0
    }

    /// Minimum minutes between executed trades; the engine suppresses
    /// signals arriving inside the window.
    fn cooldown_minutes(&self) -> Option<i64> {
        None
    }
}

pub type StrategyFactory = fn(&HashMap<String, f64>) -> Box<dyn Strategy>;

/// Explicit strategy lookup table. Built once at process start and passed
/// wherever strategies are instantiated; there is no global registry.
#[derive(Default)]
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the bundled strategies.
    pub fn with_bundled() -> Self {
        let mut registry = Self::new();
        registry.register("rsi", crate::strategies::rsi::create);
        registry.register("macd", crate::strategies::macd::create);
        registry
    }

    pub fn register(&mut self, name: &str, factory: StrategyFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn factory(&self, name: &str) -> Result<StrategyFactory> {
        self.factories.get(name).copied().ok_or_else(|| {
            anyhow!(
                "Unknown strategy: {} (registered: {})",
                name,
                self.names().join(", ")
            )
        })
    }

    pub fn create(&self, name: &str, params: &HashMap<String, f64>) -> Result<Box<dyn Strategy>> {
        Ok(self.factory(name)?(params))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

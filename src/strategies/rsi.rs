use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::data::MarketData;
use crate::indicators;
use crate::models::SignalAction;
use crate::param_utils::{get_param, get_param_f64_clamped, get_param_usize_rounded_clamped};
use crate::strategy::{PortfolioView, Strategy};

/// Mean-reversion on the relative strength index: buy when oversold, sell
/// when overbought. Long-only unless `allowShort` is set.
pub struct RsiStrategy {
    period: usize,
    oversold_level: f64,
    overbought_level: f64,
    allow_short: bool,
    cooldown_minutes: i64,
}

pub fn create(params: &HashMap<String, f64>) -> Box<dyn Strategy> {
    Box::new(RsiStrategy::new(params))
}

impl RsiStrategy {
    pub fn new(params: &HashMap<String, f64>) -> Self {
        let period = get_param_usize_rounded_clamped(params, "period", 14, 2, 500);
        let oversold_level = get_param_f64_clamped(params, "oversoldLevel", 30.0, 0.0, 100.0);
        let overbought_level = get_param_f64_clamped(params, "overboughtLevel", 70.0, 0.0, 100.0);
        let allow_short = get_param(params, "allowShort", 0.0) >= 0.5;
        let cooldown_minutes = get_param(params, "cooldownMinutes", 0.0).max(0.0).round() as i64;
        Self {
            period,
            oversold_level,
            overbought_level,
            allow_short,
            cooldown_minutes,
        }
    }
}

impl Strategy for RsiStrategy {
    fn template_id(&self) -> &'static str {
        "rsi"
    }

    fn generate_signal(
        &mut self,
        _timestamp: DateTime<Utc>,
        data: &MarketData,
        index: usize,
        portfolio: &PortfolioView,
    ) -> Option<SignalAction> {
        let bars = data.bars();
        if index < self.period || index >= bars.len() {
            return None;
        }
        let rsi = indicators::calculate_rsi_at(&bars[..=index], self.period, index)?;

        if rsi < self.oversold_level && portfolio.net_quantity <= 0 {
            return Some(SignalAction::Buy);
        }
        if rsi > self.overbought_level && portfolio.net_quantity >= 0 {
            if portfolio.is_flat() && !self.allow_short {
                return None;
            }
            return Some(SignalAction::Sell);
        }
        None
    }

    fn min_data_points(&self) -> usize {
        self.period + 1
    }

    fn cooldown_minutes(&self) -> Option<i64> {
        if self.cooldown_minutes > 0 {
            Some(self.cooldown_minutes)
        } else {
            None
        }
    }
}

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::data::MarketData;
use crate::models::SignalAction;
use crate::param_utils::{get_param, get_param_usize_rounded_clamped};
use crate::strategy::{PortfolioView, Strategy};

/// MACD crossover follower with incrementally maintained EMA state. A
/// bullish cross of the MACD line over its signal line buys, a bearish
/// cross sells. Carries a trade cooldown so whipsaws around the signal
/// line do not churn the portfolio.
pub struct MacdStrategy {
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
    allow_short: bool,
    cooldown_minutes: i64,
    min_data_points: usize,
    // EMA state advanced one bar at a time
    next_index: usize,
    fast_ema: Option<f64>,
    slow_ema: Option<f64>,
    signal_ema: Option<f64>,
    previous: Option<(f64, f64)>,
    current: Option<(f64, f64)>,
}

pub fn create(params: &HashMap<String, f64>) -> Box<dyn Strategy> {
    Box::new(MacdStrategy::new(params))
}

fn ema_step(previous: Option<f64>, value: f64, period: usize) -> f64 {
    let multiplier = 2.0 / (period as f64 + 1.0);
    match previous {
        None => value,
        Some(prev) => value * multiplier + prev * (1.0 - multiplier),
    }
}

impl MacdStrategy {
    pub fn new(params: &HashMap<String, f64>) -> Self {
        let fast_period = get_param_usize_rounded_clamped(params, "fastPeriod", 12, 1, 500);
        let slow_period = get_param_usize_rounded_clamped(params, "slowPeriod", 26, 2, 1000);
        let signal_period = get_param_usize_rounded_clamped(params, "signalPeriod", 9, 1, 500);
        let allow_short = get_param(params, "allowShort", 0.0) >= 0.5;
        let cooldown_minutes = get_param(params, "cooldownMinutes", 30.0).max(0.0).round() as i64;
        let min_data_points = slow_period + signal_period;
        Self {
            fast_period,
            slow_period,
            signal_period,
            allow_short,
            cooldown_minutes,
            min_data_points,
            next_index: 0,
            fast_ema: None,
            slow_ema: None,
            signal_ema: None,
            previous: None,
            current: None,
        }
    }

    fn advance_to(&mut self, data: &MarketData, index: usize) {
        let bars = data.bars();
        while self.next_index <= index {
            let close = bars[self.next_index].close;
            let fast = ema_step(self.fast_ema, close, self.fast_period);
            let slow = ema_step(self.slow_ema, close, self.slow_period);
            let macd = fast - slow;
            let signal = ema_step(self.signal_ema, macd, self.signal_period);

            self.fast_ema = Some(fast);
            self.slow_ema = Some(slow);
            self.signal_ema = Some(signal);
            self.previous = self.current;
            self.current = Some((macd, signal));
            self.next_index += 1;
        }
    }
}

impl Strategy for MacdStrategy {
    fn template_id(&self) -> &'static str {
        "macd"
    }

    fn generate_signal(
        &mut self,
        _timestamp: DateTime<Utc>,
        data: &MarketData,
        index: usize,
        portfolio: &PortfolioView,
    ) -> Option<SignalAction> {
        if index >= data.len() || index < self.next_index.saturating_sub(1) {
            return None;
        }
        self.advance_to(data, index);

        if index + 1 < self.min_data_points {
            return None;
        }
        let (prev_macd, prev_signal) = self.previous?;
        let (macd, signal) = self.current?;

        if prev_macd <= prev_signal && macd > signal && portfolio.net_quantity <= 0 {
            return Some(SignalAction::Buy);
        }
        if prev_macd >= prev_signal && macd < signal && portfolio.net_quantity >= 0 {
            if portfolio.is_flat() && !self.allow_short {
                return None;
            }
            return Some(SignalAction::Sell);
        }
        None
    }

    fn min_data_points(&self) -> usize {
        self.min_data_points
    }

    fn cooldown_minutes(&self) -> Option<i64> {
        if self.cooldown_minutes > 0 {
            Some(self.cooldown_minutes)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SessionConfig;
    use crate::indicators;
    use crate::models::Bar;
    use chrono::{Duration, TimeZone};

    fn flat_view() -> PortfolioView {
        PortfolioView {
            cash: 100_000.0,
            net_quantity: 0,
            last_trade_timestamp: None,
        }
    }

    fn series(closes: &[f64]) -> MarketData {
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 9, 15, 0).unwrap();
        let bars: Vec<Bar> = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                timestamp: start + Duration::minutes(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1000,
                max_tradeable_volume: None,
            })
            .collect();
        MarketData::from_bars("TEST", bars, SessionConfig::default()).unwrap()
    }

    fn v_shape() -> Vec<f64> {
        let mut closes: Vec<f64> = (0..80).map(|i| 140.0 - i as f64 * 0.5).collect();
        closes.extend((0..80).map(|i| 100.0 + i as f64 * 0.5));
        closes
    }

    #[test]
    fn test_incremental_state_matches_series_computation() {
        let closes = v_shape();
        let data = series(&closes);
        let mut strategy = MacdStrategy::new(&HashMap::new());
        strategy.advance_to(&data, data.len() - 1);

        let (macd_line, signal_line, _) = indicators::calculate_macd(&closes, 12, 26, 9);
        let (macd, signal) = strategy.current.unwrap();
        assert!((macd - macd_line[closes.len() - 1]).abs() < 1e-9);
        assert!((signal - signal_line[closes.len() - 1]).abs() < 1e-9);
    }

    #[test]
    fn test_bullish_cross_emits_buy_exactly_once() {
        let closes = v_shape();
        let data = series(&closes);
        let mut strategy = MacdStrategy::new(&HashMap::new());
        let view = flat_view();

        let mut buys = Vec::new();
        for index in 0..data.len() {
            let signal = strategy.generate_signal(
                data.bars()[index].timestamp,
                &data,
                index,
                &view,
            );
            if signal == Some(SignalAction::Buy) {
                buys.push(index);
            }
        }
        assert_eq!(buys.len(), 1);
        // the cross happens after the trend reversal at index 80
        assert!(buys[0] > 80);
    }

    #[test]
    fn test_bearish_cross_sells_an_open_long() {
        let mut closes: Vec<f64> = (0..80).map(|i| 100.0 + i as f64 * 0.5).collect();
        closes.extend((0..80).map(|i| 140.0 - i as f64 * 0.5));
        let data = series(&closes);
        let mut strategy = MacdStrategy::new(&HashMap::new());
        let view = PortfolioView {
            net_quantity: 10,
            ..flat_view()
        };

        let mut sells = 0;
        for index in 0..data.len() {
            if strategy.generate_signal(data.bars()[index].timestamp, &data, index, &view)
                == Some(SignalAction::Sell)
            {
                sells += 1;
            }
        }
        assert_eq!(sells, 1);
    }

    #[test]
    fn test_default_cooldown_is_thirty_minutes() {
        let strategy = MacdStrategy::new(&HashMap::new());
        assert_eq!(strategy.cooldown_minutes(), Some(30));

        let mut params = HashMap::new();
        params.insert("cooldownMinutes".to_string(), 0.0);
        let strategy = MacdStrategy::new(&params);
        assert_eq!(strategy.cooldown_minutes(), None);
    }
}

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::data::MarketData;
use crate::fees::FeeModel;
use crate::ledger::{LedgerError, PositionLedger};
use crate::metrics::MetricsEngine;
use crate::models::{
    generate_trade_id, BacktestSummary, Bar, SignalAction, TradeAction, TradeRecord,
    ValuationSnapshot,
};
use crate::slippage::SlippageModel;
use crate::strategy::{PortfolioView, Strategy};

/// Outcome of a single execution attempt. Rejections are ordinary control
/// flow; only ledger exhaustion escalates to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeOutcome {
    Executed,
    Skipped { reason: &'static str },
}

/// Sequential portfolio simulator: turns strategy signals into cash and
/// position changes bar by bar, with fees, slippage, FIFO profit
/// attribution, and the risk overlay applied in a fixed order.
pub struct PortfolioEngine {
    config: EngineConfig,
    fee_model: FeeModel,
    slippage: SlippageModel,
    symbol: String,
    cash: f64,
    net_quantity: i64,
    ledger: PositionLedger,
    current_position_id: u64,
    last_trade_timestamp: Option<DateTime<Utc>>,
    skipped_trades: u32,
    trades: Vec<TradeRecord>,
    valuations: Vec<ValuationSnapshot>,
}

impl PortfolioEngine {
    pub fn new(symbol: &str, config: EngineConfig) -> Self {
        let fee_model = FeeModel::new(config.fees.clone());
        let slippage = SlippageModel::new(config.slippage_pct);
        let cash = config.initial_cash;
        Self {
            config,
            fee_model,
            slippage,
            symbol: symbol.to_string(),
            cash,
            net_quantity: 0,
            ledger: PositionLedger::new(),
            current_position_id: 0,
            last_trade_timestamp: None,
            skipped_trades: 0,
            trades: Vec::new(),
            valuations: Vec::new(),
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn net_quantity(&self) -> i64 {
        self.net_quantity
    }

    pub fn skipped_trades(&self) -> u32 {
        self.skipped_trades
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn valuations(&self) -> &[ValuationSnapshot] {
        &self.valuations
    }

    pub fn view(&self) -> PortfolioView {
        PortfolioView {
            cash: self.cash,
            net_quantity: self.net_quantity,
            last_trade_timestamp: self.last_trade_timestamp,
        }
    }

    fn reject(&mut self, reason: &'static str, details: String) -> TradeOutcome {
        warn!("Trade rejected ({reason}): {details}");
        self.skipped_trades += 1;
        TradeOutcome::Skipped { reason }
    }

    /// Execute one whole-share market order against the current bar's quote.
    /// `quantity` is signed by convention (positive for Buy/Cover, negative
    /// for Sell/Short); only its magnitude and the action drive the effect.
    /// `max_tradeable_quantity` caps the fill, `f64::INFINITY` meaning
    /// uncapped. With `force` set, affordability checks are waived for
    /// mandatory closes.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_trade(
        &mut self,
        timestamp: DateTime<Utc>,
        quoted_price: f64,
        quantity: i64,
        action: TradeAction,
        reason: &str,
        max_tradeable_quantity: f64,
        force: bool,
    ) -> Result<TradeOutcome, LedgerError> {
        if quantity == 0 {
            return Ok(self.reject("zero quantity", format!("{action} at {timestamp}")));
        }
        if !quoted_price.is_finite() || quoted_price <= 0.0 {
            return Ok(self.reject(
                "invalid price",
                format!("{action} at {timestamp}: quoted {quoted_price}"),
            ));
        }
        if max_tradeable_quantity.is_nan() || max_tradeable_quantity < 0.0 {
            return Ok(self.reject(
                "invalid volume cap",
                format!("{action} at {timestamp}: cap {max_tradeable_quantity}"),
            ));
        }

        let execution_price = self.slippage.execution_price(quoted_price, action);
        let mut fill_quantity = quantity.abs();
        if max_tradeable_quantity.is_finite() {
            let cap = max_tradeable_quantity.floor() as i64;
            if fill_quantity > cap {
                debug!(
                    "Capping {action} at {timestamp} from {fill_quantity} to {cap} by tradeable volume"
                );
                fill_quantity = cap;
            }
        }
        if fill_quantity == 0 {
            return Ok(self.reject(
                "volume cap leaves nothing to fill",
                format!("{action} at {timestamp}"),
            ));
        }

        let value = execution_price * fill_quantity as f64;
        let fees = self.fee_model.calculate(value, action);

        let new_cash = match action {
            TradeAction::Buy | TradeAction::Cover => {
                let required = value + fees;
                if !force && required > self.cash {
                    return Ok(self.reject(
                        "insufficient cash",
                        format!(
                            "{action} at {timestamp}: needs {required:.2}, available {:.2}",
                            self.cash
                        ),
                    ));
                }
                self.cash - required
            }
            TradeAction::Short => {
                if !force && fees > self.cash {
                    return Ok(self.reject(
                        "insufficient cash",
                        format!(
                            "{action} at {timestamp}: entry fees {fees:.2} exceed cash {:.2}",
                            self.cash
                        ),
                    ));
                }
                self.cash + value - fees
            }
            TradeAction::Sell => self.cash + value - fees,
        };
        if !force && new_cash < 0.0 {
            return Ok(self.reject(
                "would leave cash negative",
                format!("{action} at {timestamp}: resulting cash {new_cash:.2}"),
            ));
        }

        let net_profit = if action.is_entry() {
            let lot_quantity = if action == TradeAction::Buy {
                fill_quantity
            } else {
                -fill_quantity
            };
            let was_flat = self.net_quantity == 0;
            self.ledger.open(lot_quantity, execution_price, fees);
            self.net_quantity += lot_quantity;
            if was_flat && self.net_quantity != 0 {
                self.current_position_id += 1;
            }
            None
        } else {
            let profit =
                self.ledger
                    .close(action, fill_quantity, execution_price, fees, timestamp)?;
            self.net_quantity += if action == TradeAction::Cover {
                fill_quantity
            } else {
                -fill_quantity
            };
            Some(profit)
        };

        self.cash = new_cash;
        if force && self.cash < 0.0 {
            error!(
                "Cash is negative ({:.2}) after forced {action} at {timestamp}",
                self.cash
            );
        }
        if !self.ledger.validate(self.net_quantity) {
            self.skipped_trades += 1;
        }
        self.last_trade_timestamp = Some(timestamp);

        let record = TradeRecord {
            trade_id: generate_trade_id(),
            position_id: self.current_position_id,
            timestamp,
            symbol: self.symbol.clone(),
            action,
            quantity: fill_quantity,
            executed_price: execution_price,
            gross_value: value,
            fees,
            net_profit,
            reason: reason.to_string(),
        };
        info!(
            "{} {} {} @ {:.2} ({}), fees {:.2}, cash {:.2}, net position {}",
            record.action,
            record.quantity,
            self.symbol,
            record.executed_price,
            record.reason,
            record.fees,
            self.cash,
            self.net_quantity
        );
        self.trades.push(record);
        Ok(TradeOutcome::Executed)
    }

    /// Largest whole-share quantity whose value plus fees fits the budget.
    /// The brokerage floor makes a closed form awkward, so shrink the
    /// candidate by the overshoot until it fits.
    fn affordable_quantity(&self, budget: f64, execution_price: f64, action: TradeAction) -> i64 {
        if budget <= 0.0 || execution_price <= 0.0 {
            return 0;
        }
        let mut quantity = (budget / execution_price).floor() as i64;
        while quantity > 0 {
            let value = execution_price * quantity as f64;
            let required = value + self.fee_model.calculate(value, action);
            if required <= budget {
                break;
            }
            let overshoot = ((required - budget) / execution_price).ceil().max(1.0) as i64;
            quantity -= overshoot;
        }
        quantity.max(0)
    }

    fn close_position(
        &mut self,
        bar: &Bar,
        reason: &str,
        force: bool,
    ) -> Result<TradeOutcome, LedgerError> {
        let (action, quantity) = if self.net_quantity > 0 {
            (TradeAction::Sell, -self.net_quantity)
        } else {
            (TradeAction::Cover, -self.net_quantity)
        };
        let cap = if force {
            f64::INFINITY
        } else {
            bar.tradeable_quantity()
        };
        self.execute_trade(bar.timestamp, bar.close, quantity, action, reason, cap, force)
    }

    /// Stop-loss / take-profit check against the volume-weighted entry
    /// price. Runs before the strategy sees the bar, so a risk exit and a
    /// fresh entry can share a bar.
    fn apply_risk_overlay(&mut self, bar: &Bar) -> Result<(), LedgerError> {
        if self.net_quantity == 0 {
            return Ok(());
        }
        let Some(entry_price) = self.ledger.volume_weighted_entry_price() else {
            return Ok(());
        };
        let move_pct = (bar.close - entry_price) / entry_price;
        let adverse = if self.net_quantity > 0 {
            -move_pct
        } else {
            move_pct
        };

        if let Some(stop) = self.config.stop_loss_pct {
            if adverse >= stop {
                info!(
                    "Stop-loss hit at {}: entry {:.2}, close {:.2}",
                    bar.timestamp, entry_price, bar.close
                );
                self.close_position(bar, "stop-loss", false)?;
                return Ok(());
            }
        }
        if let Some(target) = self.config.take_profit_pct {
            if -adverse >= target {
                info!(
                    "Take-profit hit at {}: entry {:.2}, close {:.2}",
                    bar.timestamp, entry_price, bar.close
                );
                self.close_position(bar, "take-profit", false)?;
            }
        }
        Ok(())
    }

    fn in_cooldown(&self, timestamp: DateTime<Utc>, cooldown_minutes: Option<i64>) -> bool {
        match (cooldown_minutes, self.last_trade_timestamp) {
            (Some(minutes), Some(last)) => timestamp - last < Duration::minutes(minutes),
            _ => false,
        }
    }

    fn handle_signal(
        &mut self,
        bar: &Bar,
        signal: SignalAction,
        cooldown_minutes: Option<i64>,
    ) -> Result<(), LedgerError> {
        if signal == SignalAction::Hold {
            return Ok(());
        }
        if self.in_cooldown(bar.timestamp, cooldown_minutes) {
            info!(
                "Suppressing {} signal at {}: inside the trade cooldown window",
                signal.as_str(),
                bar.timestamp
            );
            self.skipped_trades += 1;
            return Ok(());
        }

        let cap = bar.tradeable_quantity();
        match signal {
            SignalAction::Buy => {
                if self.net_quantity < 0 {
                    self.execute_trade(
                        bar.timestamp,
                        bar.close,
                        -self.net_quantity,
                        TradeAction::Cover,
                        "signal",
                        cap,
                        false,
                    )?;
                } else if self.net_quantity == 0 {
                    let execution_price = self
                        .slippage
                        .execution_price(bar.close, TradeAction::Buy);
                    let budget = self.cash * self.config.buy_cash_pct;
                    let quantity =
                        self.affordable_quantity(budget, execution_price, TradeAction::Buy);
                    if quantity > 0 {
                        self.execute_trade(
                            bar.timestamp,
                            bar.close,
                            quantity,
                            TradeAction::Buy,
                            "signal",
                            cap,
                            false,
                        )?;
                    } else {
                        debug!(
                            "BUY signal at {} not actionable: budget {:.2} buys nothing at {:.2}",
                            bar.timestamp, budget, execution_price
                        );
                    }
                } else {
                    debug!(
                        "BUY signal at {} is a no-op: already long {}",
                        bar.timestamp, self.net_quantity
                    );
                }
            }
            SignalAction::Sell => {
                if self.net_quantity > 0 {
                    self.execute_trade(
                        bar.timestamp,
                        bar.close,
                        -self.net_quantity,
                        TradeAction::Sell,
                        "signal",
                        cap,
                        false,
                    )?;
                } else if self.net_quantity == 0 {
                    let execution_price = self
                        .slippage
                        .execution_price(bar.close, TradeAction::Short);
                    let budget = self.cash * self.config.short_cash_pct;
                    let quantity = if execution_price > 0.0 {
                        (budget / execution_price).floor() as i64
                    } else {
                        0
                    };
                    if quantity > 0 {
                        self.execute_trade(
                            bar.timestamp,
                            bar.close,
                            -quantity,
                            TradeAction::Short,
                            "signal",
                            cap,
                            false,
                        )?;
                    } else {
                        debug!(
                            "SELL signal at {} not actionable: no shortable budget",
                            bar.timestamp
                        );
                    }
                } else {
                    debug!(
                        "SELL signal at {} is a no-op: already short {}",
                        bar.timestamp, self.net_quantity
                    );
                }
            }
            SignalAction::Hold => {}
        }
        Ok(())
    }

    fn record_valuation(&mut self, bar: &Bar) {
        let holdings_value = self.net_quantity as f64 * bar.close;
        let total_value = self.cash + holdings_value;
        if total_value <= 0.0 {
            error!(
                "Portfolio value is non-positive ({total_value:.2}) at {}",
                bar.timestamp
            );
        }
        self.valuations.push(ValuationSnapshot {
            timestamp: bar.timestamp,
            cash: self.cash,
            holdings_value,
            total_value,
        });
    }

    /// Process one bar in the fixed order: low-cash check, risk overlay,
    /// strategy signal, end-of-horizon liquidation, valuation snapshot.
    pub fn process_bar(
        &mut self,
        data: &MarketData,
        index: usize,
        strategy: &mut dyn Strategy,
        is_last: bool,
    ) -> Result<(), LedgerError> {
        let bar = data.bars()[index].clone();

        if self.cash < self.config.initial_cash * 0.1 {
            warn!(
                "Cash {:.2} is below 10% of initial capital at {}",
                self.cash, bar.timestamp
            );
        }

        self.apply_risk_overlay(&bar)?;

        let view = self.view();
        if let Some(signal) = strategy.generate_signal(bar.timestamp, data, index, &view) {
            let cooldown = strategy.cooldown_minutes();
            self.handle_signal(&bar, signal, cooldown)?;
        }

        if is_last && self.net_quantity != 0 {
            self.close_position(&bar, "end-of-backtest", true)?;
        }

        self.record_valuation(&bar);
        Ok(())
    }

    /// Run the full horizon and produce the summary. The engine is
    /// single-use: state carries across bars, never across runs.
    pub fn run(&mut self, data: &MarketData, strategy: &mut dyn Strategy) -> Result<BacktestSummary> {
        let total = data.len();
        info!(
            "Backtesting {} on {} over {} bars with {:.2} initial cash",
            strategy.template_id(),
            self.symbol,
            total,
            self.config.initial_cash
        );

        for index in 0..total {
            let is_last = index + 1 == total;
            self.process_bar(data, index, strategy, is_last)?;
        }

        let metrics = MetricsEngine::compute(
            &self.valuations,
            &self.trades,
            self.config.initial_cash,
            self.config.bars_per_day,
        );
        let final_value = self
            .valuations
            .last()
            .map(|v| v.total_value)
            .unwrap_or(self.cash);

        info!(
            "Finished {} on {}: final value {:.2}, {} trades, {} skipped",
            strategy.template_id(),
            self.symbol,
            final_value,
            self.trades.len(),
            self.skipped_trades
        );

        Ok(BacktestSummary {
            run_id: Uuid::new_v4().to_string(),
            symbol: self.symbol.clone(),
            strategy: strategy.template_id().to_string(),
            start: data.first_timestamp(),
            end: data.last_timestamp(),
            initial_cash: self.config.initial_cash,
            final_cash: self.cash,
            final_holdings: self.net_quantity,
            final_value,
            skipped_trades: self.skipped_trades,
            trades: self.trades.clone(),
            valuations: self.valuations.clone(),
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeeConfig;
    use crate::data::SessionConfig;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, minute, 0).unwrap()
    }

    fn frictionless_config() -> EngineConfig {
        EngineConfig {
            fees: FeeConfig::free(),
            slippage_pct: 0.0,
            stop_loss_pct: None,
            take_profit_pct: None,
            ..EngineConfig::default()
        }
    }

    fn engine(config: EngineConfig) -> PortfolioEngine {
        PortfolioEngine::new("TEST", config)
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
                volume: 10_000,
                max_tradeable_volume: None,
            })
            .collect();
        MarketData::from_bars("TEST", bars, SessionConfig::default()).unwrap()
    }

    /// Plays back a fixed script of signals, one per bar.
    struct ScriptedStrategy {
        script: Vec<Option<SignalAction>>,
        cooldown: Option<i64>,
    }

    impl Strategy for ScriptedStrategy {
        fn template_id(&self) -> &'static str {
            "scripted"
        }

        fn generate_signal(
            &mut self,
            _timestamp: DateTime<Utc>,
            _data: &MarketData,
            index: usize,
            _portfolio: &PortfolioView,
        ) -> Option<SignalAction> {
            self.script.get(index).copied().flatten()
        }

        fn cooldown_minutes(&self) -> Option<i64> {
            self.cooldown
        }
    }

    #[test]
    fn test_buy_opens_position_and_assigns_position_id() {
        let mut engine = engine(frictionless_config());
        let outcome = engine
            .execute_trade(
                ts(0),
                100.0,
                10,
                TradeAction::Buy,
                "signal",
                f64::INFINITY,
                false,
            )
            .unwrap();
        assert_eq!(outcome, TradeOutcome::Executed);
        assert_eq!(engine.net_quantity(), 10);
        assert!((engine.cash() - 99_000.0).abs() < 1e-9);
        assert_eq!(engine.trades()[0].position_id, 1);
        assert_eq!(engine.trades()[0].net_profit, None);
    }

    #[test]
    fn test_round_trip_at_flat_price_loses_exactly_the_fees() {
        let config = EngineConfig {
            slippage_pct: 0.0,
            stop_loss_pct: None,
            take_profit_pct: None,
            ..EngineConfig::default()
        };
        let fee_model = FeeModel::new(config.fees.clone());
        let mut engine = engine(config);

        engine
            .execute_trade(ts(0), 100.0, 50, TradeAction::Buy, "signal", f64::INFINITY, false)
            .unwrap();
        engine
            .execute_trade(ts(5), 100.0, -50, TradeAction::Sell, "signal", f64::INFINITY, false)
            .unwrap();

        let entry_fees = fee_model.calculate(5_000.0, TradeAction::Buy);
        let exit_fees = fee_model.calculate(5_000.0, TradeAction::Sell);
        let expected_loss = entry_fees + exit_fees;
        assert!((engine.cash() - (100_000.0 - expected_loss)).abs() < 1e-9);
        let closing = &engine.trades()[1];
        assert!((closing.net_profit.unwrap() + expected_loss).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_cash_is_rejected_and_counted() {
        let mut engine = engine(frictionless_config());
        let outcome = engine
            .execute_trade(
                ts(0),
                100.0,
                2_000,
                TradeAction::Buy,
                "signal",
                f64::INFINITY,
                false,
            )
            .unwrap();
        assert!(matches!(outcome, TradeOutcome::Skipped { reason: "insufficient cash" }));
        assert_eq!(engine.skipped_trades(), 1);
        assert_eq!(engine.net_quantity(), 0);
        assert_eq!(engine.cash(), 100_000.0);
        assert!(engine.trades().is_empty());
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        let mut engine = engine(frictionless_config());
        for (price, quantity, cap) in [
            (100.0, 0, f64::INFINITY),
            (f64::NAN, 10, f64::INFINITY),
            (-5.0, 10, f64::INFINITY),
            (100.0, 10, -1.0),
        ] {
            let outcome = engine
                .execute_trade(
                    ts(0),
                    price,
                    quantity,
                    TradeAction::Buy,
                    "signal",
                    cap,
                    false,
                )
                .unwrap();
            assert!(matches!(outcome, TradeOutcome::Skipped { .. }));
        }
        assert_eq!(engine.skipped_trades(), 4);
    }

    #[test]
    fn test_volume_cap_reduces_the_fill() {
        let mut engine = engine(frictionless_config());
        engine
            .execute_trade(ts(0), 100.0, 50, TradeAction::Buy, "signal", 12.7, false)
            .unwrap();
        assert_eq!(engine.net_quantity(), 12);
        assert_eq!(engine.trades()[0].quantity, 12);
    }

    #[test]
    fn test_slippage_moves_execution_against_the_trade() {
        let config = EngineConfig {
            slippage_pct: 0.001,
            ..frictionless_config()
        };
        let mut engine = engine(config);
        engine
            .execute_trade(ts(0), 100.0, 10, TradeAction::Buy, "signal", f64::INFINITY, false)
            .unwrap();
        assert!((engine.trades()[0].executed_price - 100.1).abs() < 1e-9);
        engine
            .execute_trade(ts(1), 100.0, -10, TradeAction::Sell, "signal", f64::INFINITY, false)
            .unwrap();
        assert!((engine.trades()[1].executed_price - 99.9).abs() < 1e-9);
    }

    #[test]
    fn test_short_then_cover_books_profit_on_decline() {
        let mut engine = engine(frictionless_config());
        engine
            .execute_trade(ts(0), 100.0, -20, TradeAction::Short, "signal", f64::INFINITY, false)
            .unwrap();
        assert_eq!(engine.net_quantity(), -20);
        assert!((engine.cash() - 102_000.0).abs() < 1e-9);

        engine
            .execute_trade(ts(5), 90.0, 20, TradeAction::Cover, "signal", f64::INFINITY, false)
            .unwrap();
        assert_eq!(engine.net_quantity(), 0);
        assert!((engine.cash() - 100_200.0).abs() < 1e-9);
        assert!((engine.trades()[1].net_profit.unwrap() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_over_close_aborts_with_ledger_error() {
        let mut engine = engine(frictionless_config());
        engine
            .execute_trade(ts(0), 100.0, 10, TradeAction::Buy, "signal", f64::INFINITY, false)
            .unwrap();
        let err = engine
            .execute_trade(ts(1), 100.0, -15, TradeAction::Sell, "signal", f64::INFINITY, false)
            .unwrap_err();
        assert!(err.to_string().contains("failed to close 5 of 15 units"));
    }

    #[test]
    fn test_position_id_increments_per_flat_to_open_transition() {
        let mut engine = engine(frictionless_config());
        engine
            .execute_trade(ts(0), 100.0, 5, TradeAction::Buy, "signal", f64::INFINITY, false)
            .unwrap();
        engine
            .execute_trade(ts(1), 100.0, 5, TradeAction::Buy, "signal", f64::INFINITY, false)
            .unwrap();
        engine
            .execute_trade(ts(2), 100.0, -10, TradeAction::Sell, "signal", f64::INFINITY, false)
            .unwrap();
        engine
            .execute_trade(ts(3), 100.0, -5, TradeAction::Short, "signal", f64::INFINITY, false)
            .unwrap();

        let ids: Vec<u64> = engine.trades().iter().map(|t| t.position_id).collect();
        assert_eq!(ids, vec![1, 1, 1, 2]);
    }

    #[test]
    fn test_stop_loss_closes_long_with_reason() {
        let config = EngineConfig {
            stop_loss_pct: Some(0.05),
            take_profit_pct: None,
            ..frictionless_config()
        };
        let data = series(&[100.0, 100.0, 94.0, 94.0, 94.0]);
        let mut strategy = ScriptedStrategy {
            script: vec![Some(SignalAction::Buy), None, None, None, None],
            cooldown: None,
        };
        let mut engine = engine(config);
        let summary = engine.run(&data, &mut strategy).unwrap();

        let stop_trade = summary
            .trades
            .iter()
            .find(|t| t.reason == "stop-loss")
            .expect("stop-loss trade");
        assert_eq!(stop_trade.action, TradeAction::Sell);
        assert_eq!(summary.final_holdings, 0);
    }

    #[test]
    fn test_take_profit_closes_short_on_favorable_move() {
        let config = EngineConfig {
            stop_loss_pct: None,
            take_profit_pct: Some(0.05),
            short_cash_pct: 0.5,
            ..frictionless_config()
        };
        let data = series(&[100.0, 100.0, 94.0, 94.0, 94.0]);
        let mut strategy = ScriptedStrategy {
            script: vec![Some(SignalAction::Sell), None, None, None, None],
            cooldown: None,
        };
        let mut engine = engine(config);
        let summary = engine.run(&data, &mut strategy).unwrap();

        let exit = summary
            .trades
            .iter()
            .find(|t| t.reason == "take-profit")
            .expect("take-profit trade");
        assert_eq!(exit.action, TradeAction::Cover);
        assert!(exit.net_profit.unwrap() > 0.0);
    }

    #[test]
    fn test_end_of_horizon_forces_flat() {
        let data = series(&[100.0, 101.0, 102.0]);
        let mut strategy = ScriptedStrategy {
            script: vec![Some(SignalAction::Buy), None, None],
            cooldown: None,
        };
        let mut engine = engine(frictionless_config());
        let summary = engine.run(&data, &mut strategy).unwrap();

        assert_eq!(summary.final_holdings, 0);
        let last_trade = summary.trades.last().unwrap();
        assert_eq!(last_trade.reason, "end-of-backtest");
        assert_eq!(last_trade.timestamp, data.last_timestamp().unwrap());
    }

    #[test]
    fn test_cooldown_suppresses_rapid_signals() {
        let data = series(&[100.0, 100.0, 100.0, 100.0, 100.0, 100.0]);
        let mut strategy = ScriptedStrategy {
            script: vec![
                Some(SignalAction::Buy),
                Some(SignalAction::Sell),
                None,
                None,
                None,
                Some(SignalAction::Sell),
            ],
            cooldown: Some(5),
        };
        let mut engine = engine(frictionless_config());
        let summary = engine.run(&data, &mut strategy).unwrap();

        // the sell one minute after the buy is suppressed; the one five
        // minutes later executes
        let sells: Vec<&TradeRecord> = summary
            .trades
            .iter()
            .filter(|t| t.action == TradeAction::Sell && t.reason == "signal")
            .collect();
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].timestamp, data.bars()[5].timestamp);
        assert!(summary.skipped_trades >= 1);
    }

    #[test]
    fn test_same_direction_signal_is_a_no_op() {
        let data = series(&[100.0, 100.0, 100.0]);
        let mut strategy = ScriptedStrategy {
            script: vec![Some(SignalAction::Buy), Some(SignalAction::Buy), None],
            cooldown: None,
        };
        let mut engine = engine(frictionless_config());
        let summary = engine.run(&data, &mut strategy).unwrap();

        let buys = summary
            .trades
            .iter()
            .filter(|t| t.action == TradeAction::Buy)
            .count();
        assert_eq!(buys, 1);
    }

    #[test]
    fn test_valuation_snapshot_every_bar() {
        let data = series(&[100.0, 101.0, 99.0, 102.0]);
        let mut strategy = ScriptedStrategy {
            script: vec![None; 4],
            cooldown: None,
        };
        let mut engine = engine(frictionless_config());
        let summary = engine.run(&data, &mut strategy).unwrap();

        assert_eq!(summary.valuations.len(), 4);
        for snapshot in &summary.valuations {
            assert!((snapshot.total_value - 100_000.0).abs() < 1e-9);
            assert_eq!(snapshot.holdings_value, 0.0);
        }
    }

    #[test]
    fn test_affordable_quantity_respects_fees() {
        let engine = engine(EngineConfig {
            slippage_pct: 0.0,
            ..EngineConfig::default()
        });
        let quantity = engine.affordable_quantity(10_000.0, 100.0, TradeAction::Buy);
        assert!(quantity > 0);
        let value = 100.0 * quantity as f64;
        let required = value + engine.fee_model.calculate(value, TradeAction::Buy);
        assert!(required <= 10_000.0);
        let next_value = 100.0 * (quantity + 1) as f64;
        let next_required =
            next_value + engine.fee_model.calculate(next_value, TradeAction::Buy);
        assert!(next_required > 10_000.0);
    }
}

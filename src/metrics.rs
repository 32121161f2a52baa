use chrono::{DateTime, Utc};
use statrs::statistics::Statistics;
use std::collections::HashMap;

use crate::models::{MetricsReport, TradeRecord, ValuationSnapshot};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Pure performance statistics over a completed run: same valuation series
/// and trade ledger always produce the same report.
pub struct MetricsEngine;

impl MetricsEngine {
    pub fn compute(
        valuations: &[ValuationSnapshot],
        trades: &[TradeRecord],
        initial_cash: f64,
        bars_per_day: usize,
    ) -> MetricsReport {
        if valuations.is_empty() {
            return MetricsReport::empty();
        }

        let returns = per_bar_returns(valuations);
        let periods_per_year = TRADING_DAYS_PER_YEAR * bars_per_day as f64;

        let annualized_return_pct = annualized_return_pct(valuations, initial_cash);
        let (max_drawdown_pct, max_drawdown_start, max_drawdown_end) = max_drawdown(valuations);
        let (win_rate_pct, profit_factor, closing_trades) = trade_statistics(trades);

        let annualized_fraction = annualized_return_pct / 100.0;
        let drawdown_fraction = max_drawdown_pct.abs() / 100.0;
        let calmar_ratio = if drawdown_fraction > 0.0 {
            annualized_fraction / drawdown_fraction
        } else {
            0.0
        };

        MetricsReport {
            annualized_return_pct,
            max_drawdown_pct,
            max_drawdown_start,
            max_drawdown_end,
            win_rate_pct,
            sharpe_ratio: sharpe_ratio(&returns, periods_per_year),
            sortino_ratio: sortino_ratio(&returns, periods_per_year),
            calmar_ratio,
            profit_factor,
            total_trades: closing_trades,
            avg_trade_duration_minutes: average_trade_duration_minutes(trades),
        }
    }
}

/// Simple per-bar returns of total value; non-finite entries collapse to 0
/// so one degenerate bar cannot poison the ratio statistics.
fn per_bar_returns(valuations: &[ValuationSnapshot]) -> Vec<f64> {
    valuations
        .windows(2)
        .map(|pair| {
            let previous = pair[0].total_value;
            let current = pair[1].total_value;
            let r = (current - previous) / previous;
            if r.is_finite() {
                r
            } else {
                0.0
            }
        })
        .collect()
}

fn annualized_return_pct(valuations: &[ValuationSnapshot], initial_cash: f64) -> f64 {
    if valuations.len() < 2 || initial_cash <= 0.0 {
        return 0.0;
    }
    let first = valuations.first().unwrap();
    let last = valuations.last().unwrap();
    let days = (last.timestamp.date_naive() - first.timestamp.date_naive()).num_days();
    if days <= 0 {
        return 0.0;
    }

    let total_return = last.total_value / initial_cash - 1.0;
    let growth = 1.0 + total_return;
    if growth <= 0.0 {
        return -100.0;
    }
    (growth.powf(TRADING_DAYS_PER_YEAR / days as f64) - 1.0) * 100.0
}

/// Deepest peak-to-trough decline of total value, with the timestamps of
/// the peak and the trough. A non-positive valuation bounds the loss at
/// -100% over the whole horizon.
fn max_drawdown(
    valuations: &[ValuationSnapshot],
) -> (f64, Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    if valuations.iter().any(|v| v.total_value <= 0.0) {
        return (
            -100.0,
            valuations.first().map(|v| v.timestamp),
            valuations.last().map(|v| v.timestamp),
        );
    }

    let mut peak_value = f64::MIN;
    let mut peak_timestamp = None;
    let mut worst_drawdown = 0.0;
    let mut worst_peak = None;
    let mut worst_trough = None;

    for snapshot in valuations {
        if snapshot.total_value > peak_value {
            peak_value = snapshot.total_value;
            peak_timestamp = Some(snapshot.timestamp);
        }
        let drawdown = (snapshot.total_value - peak_value) / peak_value;
        if drawdown < worst_drawdown {
            worst_drawdown = drawdown;
            worst_peak = peak_timestamp;
            worst_trough = Some(snapshot.timestamp);
        }
    }

    (worst_drawdown * 100.0, worst_peak, worst_trough)
}

/// Win rate and profit factor over closing trades with realized profit.
/// With no qualifying trades both are 0, never NaN or infinity from an
/// empty ledger.
fn trade_statistics(trades: &[TradeRecord]) -> (f64, f64, usize) {
    let realized: Vec<f64> = trades
        .iter()
        .filter(|trade| !trade.action.is_entry())
        .filter_map(|trade| trade.net_profit)
        .collect();
    if realized.is_empty() {
        return (0.0, 0.0, 0);
    }

    let wins = realized.iter().filter(|&&profit| profit > 0.0).count();
    let win_rate_pct = wins as f64 / realized.len() as f64 * 100.0;

    let gross_profit: f64 = realized.iter().filter(|p| **p > 0.0).sum();
    let gross_loss: f64 = realized.iter().filter(|p| **p < 0.0).sum::<f64>().abs();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    (win_rate_pct, profit_factor, realized.len())
}

fn sharpe_ratio(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().copied().mean();
    let std_dev = returns.iter().copied().std_dev();
    if !std_dev.is_finite() || std_dev == 0.0 {
        return 0.0;
    }
    mean * periods_per_year / (std_dev * periods_per_year.sqrt())
}

fn sortino_ratio(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.len() < 2 {
        return 0.0;
    }
    let downside_std = downside.iter().copied().std_dev();
    if !downside_std.is_finite() || downside_std == 0.0 {
        return 0.0;
    }
    let mean = returns.iter().copied().mean();
    mean * periods_per_year / (downside_std * periods_per_year.sqrt())
}

/// Mean open-to-close span in minutes over distinct position ids with at
/// least one closing trade.
fn average_trade_duration_minutes(trades: &[TradeRecord]) -> f64 {
    let mut opened: HashMap<u64, DateTime<Utc>> = HashMap::new();
    let mut closed: HashMap<u64, DateTime<Utc>> = HashMap::new();

    for trade in trades {
        if trade.action.is_entry() {
            opened
                .entry(trade.position_id)
                .and_modify(|first| *first = (*first).min(trade.timestamp))
                .or_insert(trade.timestamp);
        } else {
            closed
                .entry(trade.position_id)
                .and_modify(|last| *last = (*last).max(trade.timestamp))
                .or_insert(trade.timestamp);
        }
    }

    let durations: Vec<f64> = closed
        .iter()
        .filter_map(|(position_id, close_ts)| {
            opened
                .get(position_id)
                .map(|open_ts| (*close_ts - *open_ts).num_seconds() as f64 / 60.0)
        })
        .collect();
    if durations.is_empty() {
        return 0.0;
    }
    durations.iter().sum::<f64>() / durations.len() as f64
}

use anyhow::{Context, Result};
use chrono::Utc;
use log::debug;
use serde_json::json;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::models::{BacktestSummary, MetricsReport, TradeRecord, ValuationSnapshot};

/// Run-scoped JSONL audit trail. One line per event, every line carrying
/// the run id so interleaved files stay attributable.
pub struct TradeLogger {
    run_id: String,
    writer: BufWriter<File>,
}

impl TradeLogger {
    pub fn create(path: &Path, run_id: &str) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        Ok(Self {
            run_id: run_id.to_string(),
            writer: BufWriter::new(file),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn write_event(
        &mut self,
        log_type: &str,
        message: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        let event = json!({
            "runId": self.run_id,
            "timestamp": Utc::now(),
            "logType": log_type,
            "message": message,
            "details": details,
        });
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n")?;
        debug!("{log_type}: {message}");
        Ok(())
    }

    pub fn log_trade(&mut self, trade: &TradeRecord) -> Result<()> {
        let message = format!(
            "{} {} {} @ {:.2} ({})",
            trade.action, trade.quantity, trade.symbol, trade.executed_price, trade.reason
        );
        self.write_event("trade", &message, serde_json::to_value(trade)?)
    }

    pub fn log_valuation(&mut self, snapshot: &ValuationSnapshot) -> Result<()> {
        let message = format!("total value {:.2}", snapshot.total_value);
        self.write_event("valuation", &message, serde_json::to_value(snapshot)?)
    }

    pub fn log_metrics(&mut self, metrics: &MetricsReport) -> Result<()> {
        let message = format!(
            "annualized {:.2}%, sharpe {:.2}, max drawdown {:.2}%",
            metrics.annualized_return_pct, metrics.sharpe_ratio, metrics.max_drawdown_pct
        );
        self.write_event("metrics", &message, serde_json::to_value(metrics)?)
    }

    /// Persist a completed run: every trade, every valuation snapshot, and
    /// the final metrics report.
    pub fn log_summary(&mut self, summary: &BacktestSummary) -> Result<()> {
        self.write_event(
            "run",
            &format!("{} on {}", summary.strategy, summary.symbol),
            json!({
                "symbol": summary.symbol,
                "strategy": summary.strategy,
                "initialCash": summary.initial_cash,
                "finalValue": summary.final_value,
                "skippedTrades": summary.skipped_trades,
            }),
        )?;
        for trade in &summary.trades {
            self.log_trade(trade)?;
        }
        for snapshot in &summary.valuations {
            self.log_valuation(snapshot)?;
        }
        self.log_metrics(&summary.metrics)?;
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush trade log")
    }
}

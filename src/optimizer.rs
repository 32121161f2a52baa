use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use crate::config::EngineConfig;
use crate::data::MarketData;
use crate::models::{MetricsReport, OptimizationRecord};
use crate::param_utils::parameter_signature;
use crate::portfolio::PortfolioEngine;
use crate::strategy::StrategyFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    Sharpe,
    AnnualizedReturn,
    Calmar,
}

impl Objective {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sharpe" | "sharpe_ratio" => Ok(Self::Sharpe),
            "annualized" | "annualized_return" => Ok(Self::AnnualizedReturn),
            "calmar" => Ok(Self::Calmar),
            other => Err(anyhow!(
                "Objective must be sharpe, annualized, or calmar (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Sharpe => "Sharpe ratio",
            Self::AnnualizedReturn => "annualized return",
            Self::Calmar => "Calmar ratio",
        }
    }

    pub fn score(self, metrics: &MetricsReport) -> f64 {
        match self {
            Self::Sharpe => metrics.sharpe_ratio,
            Self::AnnualizedReturn => metrics.annualized_return_pct,
            Self::Calmar => metrics.calmar_ratio,
        }
    }
}

/// Parameter name to candidate values; expansion is the cartesian product.
#[derive(Debug, Clone, Default)]
pub struct ParameterGrid {
    values: BTreeMap<String, Vec<f64>>,
}

impl ParameterGrid {
    pub fn from_json(raw: &str) -> Result<Self> {
        let parsed: serde_json::Value =
            serde_json::from_str(raw).context("Invalid grid JSON")?;
        let object = parsed
            .as_object()
            .ok_or_else(|| anyhow!("Grid JSON must be an object of arrays"))?;

        let mut values = BTreeMap::new();
        for (key, entry) in object {
            let array = entry
                .as_array()
                .ok_or_else(|| anyhow!("Grid entry {} must be an array", key))?;
            let mut candidates = Vec::with_capacity(array.len());
            for item in array {
                let number = item
                    .as_f64()
                    .ok_or_else(|| anyhow!("Grid entry {} holds a non-numeric value", key))?;
                candidates.push(number);
            }
            if candidates.is_empty() {
                return Err(anyhow!("Grid entry {} is empty", key));
            }
            values.insert(key.clone(), candidates);
        }
        if values.is_empty() {
            return Err(anyhow!("Grid defines no parameters"));
        }
        Ok(Self { values })
    }

    pub fn insert(&mut self, key: &str, candidates: Vec<f64>) {
        self.values.insert(key.to_string(), candidates);
    }

    /// All parameter combinations, merged over `base` (grid values win).
    pub fn combinations(&self, base: &HashMap<String, f64>) -> Vec<HashMap<String, f64>> {
        let mut combos = vec![base.clone()];
        for (key, candidates) in &self.values {
            let mut expanded = Vec::with_capacity(combos.len() * candidates.len());
            for combo in &combos {
                for &candidate in candidates {
                    let mut next = combo.clone();
                    next.insert(key.clone(), candidate);
                    expanded.push(next);
                }
            }
            combos = expanded;
        }
        combos
    }
}

struct SearchTask {
    signature: String,
    parameters: HashMap<String, f64>,
}

struct SearchTaskResult {
    signature: String,
    outcome: Result<OptimizationRecord>,
}

/// Exhaustive grid search over strategy and engine parameters. Each
/// combination gets an isolated engine and strategy instance; parallelism
/// exists only across runs.
pub struct GridSearchOptimizer {
    data: Arc<MarketData>,
    factory: StrategyFactory,
    objective: Objective,
    cache: Arc<DashMap<String, OptimizationRecord>>,
}

impl GridSearchOptimizer {
    pub fn new(data: MarketData, factory: StrategyFactory, objective: Objective) -> Self {
        Self {
            data: Arc::new(data),
            factory,
            objective,
            cache: Arc::new(DashMap::new()),
        }
    }

    fn run_single(
        data: &MarketData,
        factory: StrategyFactory,
        parameters: HashMap<String, f64>,
    ) -> Result<OptimizationRecord> {
        let config = EngineConfig::from_parameters(&parameters)?;
        let mut strategy = factory(&parameters);
        let mut engine = PortfolioEngine::new(data.symbol(), config);
        let summary = engine.run(data, strategy.as_mut())?;
        Ok(OptimizationRecord {
            parameters,
            metrics: summary.metrics,
            final_value: summary.final_value,
            skipped_trades: summary.skipped_trades,
        })
    }

    /// Evaluate every combination in the grid, best first by the chosen
    /// objective. Previously evaluated signatures come from the cache.
    pub fn optimize(
        &self,
        grid: &ParameterGrid,
        base: &HashMap<String, f64>,
    ) -> Result<Vec<OptimizationRecord>> {
        let mut results = Vec::new();
        let mut seen = HashSet::new();
        let mut tasks = Vec::new();

        for parameters in grid.combinations(base) {
            let signature = parameter_signature(&parameters);
            if !seen.insert(signature.clone()) {
                continue;
            }
            if let Some(cached) = self.cache.get(&signature) {
                results.push(cached.clone());
                continue;
            }
            tasks.push(SearchTask {
                signature,
                parameters,
            });
        }

        let task_count = tasks.len();
        info!(
            "Grid search: {} combinations to run, {} served from cache",
            task_count,
            results.len()
        );

        if task_count > 0 {
            let num_workers = task_count.min(num_cpus::get().max(1));
            info!("Using {num_workers} worker threads");

            let (task_tx, task_rx): (Sender<SearchTask>, Receiver<SearchTask>) =
                bounded(task_count);
            let (result_tx, result_rx): (Sender<SearchTaskResult>, Receiver<SearchTaskResult>) =
                bounded(task_count);

            let mut handles = Vec::new();
            for _ in 0..num_workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let data = self.data.clone();
                let factory = self.factory;

                let handle = thread::spawn(move || {
                    while let Ok(task) = task_rx.recv() {
                        let outcome = Self::run_single(&data, factory, task.parameters);
                        if result_tx
                            .send(SearchTaskResult {
                                signature: task.signature,
                                outcome,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                });
                handles.push(handle);
            }
            drop(task_rx);
            drop(result_tx);

            for task in tasks {
                task_tx
                    .send(task)
                    .map_err(|_| anyhow!("Worker pool shut down before tasks were queued"))?;
            }
            drop(task_tx);

            let progress = ProgressBar::new(task_count as u64);
            progress.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                    )
                    .unwrap()
                    .progress_chars("#>-"),
            );

            let mut failures = 0usize;
            for _ in 0..task_count {
                match result_rx.recv() {
                    Ok(result) => {
                        progress.inc(1);
                        match result.outcome {
                            Ok(record) => {
                                self.cache.insert(result.signature, record.clone());
                                results.push(record);
                            }
                            Err(error) => {
                                failures += 1;
                                warn!("Combination {} failed: {error:#}", result.signature);
                            }
                        }
                    }
                    Err(_) => {
                        warn!("Result channel closed unexpectedly; some results may be lost");
                        break;
                    }
                }
            }
            progress.finish();

            for handle in handles {
                handle
                    .join()
                    .map_err(|_| anyhow!("A grid search worker panicked"))?;
            }
            if failures > 0 {
                warn!("Grid search finished with {failures} failed combinations");
            }
        }

        results.sort_by(|a, b| {
            let left = self.objective.score(&a.metrics);
            let right = self.objective.score(&b.metrics);
            right
                .partial_cmp(&left)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if let Some(best) = results.first() {
            info!(
                "Best {}: {:.4} with parameters {}",
                self.objective.label(),
                self.objective.score(&best.metrics),
                parameter_signature(&best.parameters)
            );
        }
        Ok(results)
    }

    /// Write the ranked results to CSV: one column per parameter (sorted),
    /// then the headline metrics.
    pub fn export_csv(records: &[OptimizationRecord], path: &Path) -> Result<()> {
        let mut parameter_keys: Vec<String> = records
            .iter()
            .flat_map(|record| record.parameters.keys().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        parameter_keys.sort();

        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;

        let mut header: Vec<String> = parameter_keys.clone();
        header.extend(
            [
                "annualizedReturnPct",
                "maxDrawdownPct",
                "winRatePct",
                "sharpeRatio",
                "sortinoRatio",
                "calmarRatio",
                "profitFactor",
                "totalTrades",
                "avgTradeDurationMinutes",
                "finalValue",
                "skippedTrades",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        writer.write_record(&header)?;

        for record in records {
            let mut row: Vec<String> = parameter_keys
                .iter()
                .map(|key| {
                    record
                        .parameters
                        .get(key)
                        .map(|v| format!("{v}"))
                        .unwrap_or_default()
                })
                .collect();
            let m = &record.metrics;
            row.push(format!("{:.6}", m.annualized_return_pct));
            row.push(format!("{:.6}", m.max_drawdown_pct));
            row.push(format!("{:.6}", m.win_rate_pct));
            row.push(format!("{:.6}", m.sharpe_ratio));
            row.push(format!("{:.6}", m.sortino_ratio));
            row.push(format!("{:.6}", m.calmar_ratio));
            row.push(format!("{:.6}", m.profit_factor));
            row.push(m.total_trades.to_string());
            row.push(format!("{:.2}", m.avg_trade_duration_minutes));
            row.push(format!("{:.2}", record.final_value));
            row.push(record.skipped_trades.to_string());
            writer.write_record(&row)?;
        }
        writer.flush()?;
        info!("Wrote {} optimization rows to {}", records.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SessionConfig;
    use crate::models::Bar;
    use chrono::{Duration, TimeZone, Utc};

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

    #[test]
    fn test_objective_parse_and_labels() {
        assert_eq!(Objective::parse("sharpe").unwrap(), Objective::Sharpe);
        assert_eq!(
            Objective::parse(" Annualized ").unwrap(),
            Objective::AnnualizedReturn
        );
        assert_eq!(Objective::parse("calmar").unwrap(), Objective::Calmar);
        assert!(Objective::parse("drawdown").is_err());
    }

    #[test]
    fn test_grid_combinations_are_a_cartesian_product() {
        let grid =
            ParameterGrid::from_json(r#"{"period": [10, 14], "oversoldLevel": [25, 30, 35]}"#)
                .unwrap();
        let mut base = HashMap::new();
        base.insert("overboughtLevel".to_string(), 70.0);

        let combos = grid.combinations(&base);
        assert_eq!(combos.len(), 6);
        for combo in &combos {
            assert_eq!(combo.get("overboughtLevel"), Some(&70.0));
            assert!(combo.contains_key("period"));
            assert!(combo.contains_key("oversoldLevel"));
        }
    }

    #[test]
    fn test_grid_rejects_malformed_json() {
        assert!(ParameterGrid::from_json(r#"{"period": []}"#).is_err());
        assert!(ParameterGrid::from_json(r#"{"period": ["fast"]}"#).is_err());
        assert!(ParameterGrid::from_json("{}").is_err());
        assert!(ParameterGrid::from_json("[1]").is_err());
    }

    #[test]
    fn test_optimize_evaluates_and_ranks_all_combinations() {
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + 10.0 * ((i as f64) * 0.3).sin())
            .collect();
        let data = series(&closes);
        let optimizer = GridSearchOptimizer::new(
            data,
            crate::strategies::rsi::create,
            Objective::Sharpe,
        );

        let grid =
            ParameterGrid::from_json(r#"{"period": [5, 10], "oversoldLevel": [30, 40]}"#).unwrap();
        let mut base = HashMap::new();
        base.insert("slippagePct".to_string(), 0.0);

        let results = optimizer.optimize(&grid, &base).unwrap();
        assert_eq!(results.len(), 4);
        for pair in results.windows(2) {
            assert!(pair[0].metrics.sharpe_ratio >= pair[1].metrics.sharpe_ratio);
        }

        // a second pass over the same grid is served entirely from cache
        let again = optimizer.optimize(&grid, &base).unwrap();
        assert_eq!(again.len(), 4);
    }

    #[test]
    fn test_duplicate_combinations_collapse() {
        let data = series(&(0..40).map(|i| 100.0 + i as f64 * 0.1).collect::<Vec<_>>());
        let optimizer = GridSearchOptimizer::new(
            data,
            crate::strategies::rsi::create,
            Objective::AnnualizedReturn,
        );
        let grid = ParameterGrid::from_json(r#"{"period": [14, 14]}"#).unwrap();
        let results = optimizer.optimize(&grid, &HashMap::new()).unwrap();
        assert_eq!(results.len(), 1);
    }
}

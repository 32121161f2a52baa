use anyhow::{Context, Result};
use backtester::logger::TradeLogger;
use backtester::models::{parse_parameter_map_from_json, BacktestSummary};
use backtester::optimizer::{GridSearchOptimizer, Objective, ParameterGrid};
use backtester::stress::StressTester;
use backtester::{EngineConfig, MarketData, PortfolioEngine, StrategyRegistry};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use log::info;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "backtester")]
#[command(about = "Minute-bar strategy backtester with realistic transaction costs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest one strategy over a bar file
    Run {
        /// Strategy name (see the bundled registry)
        strategy: String,
        /// CSV file of minute bars
        #[arg(long = "data", value_name = "PATH")]
        data: PathBuf,
        /// Instrument symbol for reporting
        #[arg(long, default_value = "UNKNOWN")]
        symbol: String,
        /// JSON file with engine and strategy parameters
        #[arg(long, value_name = "PATH")]
        params: Option<PathBuf>,
        /// First bar to include (RFC 3339 or "YYYY-MM-DD HH:MM:SS")
        #[arg(long)]
        start: Option<String>,
        /// Last bar to include
        #[arg(long)]
        end: Option<String>,
        /// Write a JSONL audit trail of the run
        #[arg(long = "log-file", value_name = "PATH")]
        log_file: Option<PathBuf>,
    },
    /// Grid-search strategy parameters
    Optimize {
        /// Strategy name
        strategy: String,
        /// CSV file of minute bars
        #[arg(long = "data", value_name = "PATH")]
        data: PathBuf,
        #[arg(long, default_value = "UNKNOWN")]
        symbol: String,
        /// JSON object mapping parameter names to candidate arrays
        #[arg(long, value_name = "PATH")]
        grid: PathBuf,
        /// Base parameters applied to every combination
        #[arg(long, value_name = "PATH")]
        params: Option<PathBuf>,
        /// Ranking objective: sharpe, annualized, or calmar
        #[arg(long, default_value = "sharpe")]
        objective: String,
        /// Destination CSV for the ranked results
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Backtest under shocked prices and constrained liquidity
    Stress {
        /// Strategy name
        strategy: String,
        /// CSV file of minute bars
        #[arg(long = "data", value_name = "PATH")]
        data: PathBuf,
        #[arg(long, default_value = "UNKNOWN")]
        symbol: String,
        #[arg(long, value_name = "PATH")]
        params: Option<PathBuf>,
        /// RNG seed so a stress run is reproducible
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Multiplier applied to shocked bars
        #[arg(long = "shock-factor", default_value_t = 0.95)]
        shock_factor: f64,
        /// Probability a bar is shocked
        #[arg(long, default_value_t = 0.05)]
        probability: f64,
        /// Cap tradeable quantity at this fraction of bar volume
        #[arg(long = "max-volume-pct")]
        max_volume_pct: Option<f64>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let registry = StrategyRegistry::with_bundled();

    match cli.command {
        Commands::Run {
            strategy,
            data,
            symbol,
            params,
            start,
            end,
            log_file,
        } => {
            let params = load_parameters(params.as_deref())?;
            let market_data = MarketData::from_csv(
                &data,
                &symbol,
                parse_cli_timestamp(start.as_deref())?,
                parse_cli_timestamp(end.as_deref())?,
            )?;
            let summary = run_backtest(&registry, &strategy, &market_data, &params)?;
            if let Some(path) = log_file {
                let run_id = summary.run_id.clone();
                let mut logger = TradeLogger::create(&path, &run_id)?;
                logger.log_summary(&summary)?;
                info!("Audit trail written to {}", path.display());
            }
            print_summary(&summary);
        }
        Commands::Optimize {
            strategy,
            data,
            symbol,
            grid,
            params,
            objective,
            output,
        } => {
            let base = load_parameters(params.as_deref())?;
            let grid_raw = fs::read_to_string(&grid)
                .with_context(|| format!("Failed to read grid file {}", grid.display()))?;
            let grid = ParameterGrid::from_json(&grid_raw)?;
            let objective = Objective::parse(&objective)?;
            let market_data = MarketData::from_csv(&data, &symbol, None, None)?;

            let optimizer =
                GridSearchOptimizer::new(market_data, registry.factory(&strategy)?, objective);
            let results = optimizer.optimize(&grid, &base)?;
            for (rank, record) in results.iter().take(10).enumerate() {
                println!(
                    "#{:<2} {}: {:.4}  annualized {:.2}%  max drawdown {:.2}%  trades {}",
                    rank + 1,
                    objective.label(),
                    objective.score(&record.metrics),
                    record.metrics.annualized_return_pct,
                    record.metrics.max_drawdown_pct,
                    record.metrics.total_trades
                );
            }
            if let Some(path) = output {
                GridSearchOptimizer::export_csv(&results, &path)?;
            }
        }
        Commands::Stress {
            strategy,
            data,
            symbol,
            params,
            seed,
            shock_factor,
            probability,
            max_volume_pct,
        } => {
            let params = load_parameters(params.as_deref())?;
            let market_data = MarketData::from_csv(&data, &symbol, None, None)?;

            let baseline = run_backtest(&registry, &strategy, &market_data, &params)?;

            let mut tester = StressTester::new(seed);
            let mut stressed = tester.apply_price_shock(&market_data, shock_factor, probability)?;
            if let Some(fraction) = max_volume_pct {
                stressed = tester.apply_liquidity_constraint(&stressed, fraction)?;
            }
            let shocked = run_backtest(&registry, &strategy, &stressed, &params)?;

            println!("--- baseline ---");
            print_summary(&baseline);
            println!("--- stressed (seed {seed}) ---");
            print_summary(&shocked);
        }
    }
    Ok(())
}

fn load_parameters(path: Option<&std::path::Path>) -> Result<HashMap<String, f64>> {
    match path {
        None => Ok(HashMap::new()),
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Failed to read parameter file {}", path.display()))?;
            parse_parameter_map_from_json(&raw)
        }
    }
}

fn parse_cli_timestamp(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    let naive = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("Unparseable timestamp: {raw}"))?;
    Ok(Some(naive.and_utc()))
}

fn run_backtest(
    registry: &StrategyRegistry,
    strategy_name: &str,
    data: &MarketData,
    params: &HashMap<String, f64>,
) -> Result<BacktestSummary> {
    let config = EngineConfig::from_parameters(params)?;
    let mut strategy = registry.create(strategy_name, params)?;
    let mut engine = PortfolioEngine::new(data.symbol(), config);
    engine.run(data, strategy.as_mut())
}

fn print_summary(summary: &BacktestSummary) {
    let m = &summary.metrics;
    println!(
        "{} on {} ({} bars): final value {:.2} from {:.2}",
        summary.strategy,
        summary.symbol,
        summary.valuations.len(),
        summary.final_value,
        summary.initial_cash
    );
    println!(
        "  annualized return: {:>8.2}%   max drawdown: {:>7.2}%",
        m.annualized_return_pct, m.max_drawdown_pct
    );
    println!(
        "  sharpe: {:>7.3}   sortino: {:>7.3}   calmar: {:>7.3}",
        m.sharpe_ratio, m.sortino_ratio, m.calmar_ratio
    );
    println!(
        "  win rate: {:>6.2}%   profit factor: {:>7.3}   trades: {}   avg duration: {:.1}m",
        m.win_rate_pct, m.profit_factor, m.total_trades, m.avg_trade_duration_minutes
    );
    println!("  skipped trades: {}", summary.skipped_trades);
}

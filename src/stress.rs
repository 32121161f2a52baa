use anyhow::{anyhow, Result};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::MarketData;
use crate::models::Bar;

/// Deterministic, seeded transforms that degrade a bar series so a
/// strategy's sensitivity to shocks and thin liquidity can be measured.
pub struct StressTester {
    rng: StdRng,
}

impl StressTester {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Scale OHLC of randomly selected bars by `shock_factor`. A factor
    /// below 1 simulates sudden drops, above 1 sudden spikes.
    pub fn apply_price_shock(
        &mut self,
        data: &MarketData,
        shock_factor: f64,
        probability: f64,
    ) -> Result<MarketData> {
        if !shock_factor.is_finite() || shock_factor <= 0.0 {
            return Err(anyhow!(
                "Shock factor must be positive (value: {})",
                shock_factor
            ));
        }
        if !(0.0..=1.0).contains(&probability) {
            return Err(anyhow!(
                "Shock probability must be between 0 and 1 (value: {})",
                probability
            ));
        }

        let mut shocked = 0usize;
        let bars: Vec<Bar> = data
            .bars()
            .iter()
            .map(|bar| {
                if self.rng.gen::<f64>() < probability {
                    shocked += 1;
                    Bar {
                        open: bar.open * shock_factor,
                        high: bar.high * shock_factor,
                        low: bar.low * shock_factor,
                        close: bar.close * shock_factor,
                        ..bar.clone()
                    }
                } else {
                    bar.clone()
                }
            })
            .collect();
        info!(
            "Applied x{shock_factor} price shock to {shocked} of {} bars",
            data.len()
        );
        MarketData::from_bars(data.symbol(), bars, data.session())
    }

    /// Cap tradeable quantity at a fraction of each bar's printed volume,
    /// so fills can no longer assume unlimited depth.
    pub fn apply_liquidity_constraint(
        &self,
        data: &MarketData,
        max_volume_pct: f64,
    ) -> Result<MarketData> {
        if !(0.0..=1.0).contains(&max_volume_pct) {
            return Err(anyhow!(
                "Volume fraction must be between 0 and 1 (value: {})",
                max_volume_pct
            ));
        }
        let bars: Vec<Bar> = data
            .bars()
            .iter()
            .map(|bar| Bar {
                max_tradeable_volume: Some((bar.volume as f64 * max_volume_pct).floor()),
                ..bar.clone()
            })
            .collect();
        info!(
            "Constrained tradeable volume to {:.1}% of printed volume",
            max_volume_pct * 100.0
        );
        MarketData::from_bars(data.symbol(), bars, data.session())
    }
}

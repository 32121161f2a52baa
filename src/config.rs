use anyhow::{anyhow, Result};
use std::collections::HashMap;

use crate::param_utils::{get_param, get_param_f64_clamped};

/// Transaction-cost schedule. Rates are fractions of traded value except
/// `brokerage_min`, a currency floor on the brokerage component.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeConfig {
    pub brokerage_rate: f64,
    pub brokerage_min: f64,
    pub transaction_rate: f64,
    pub regulatory_rate: f64,
    /// Securities transaction tax, levied on sell-side executions.
    pub tax_rate: f64,
    /// Stamp duty, levied on buy-side executions.
    pub stamp_rate: f64,
    /// Applied to the brokerage and transaction components.
    pub vat_rate: f64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            brokerage_rate: 0.0005,
            brokerage_min: 20.0,
            transaction_rate: 0.0001,
            regulatory_rate: 0.00001,
            tax_rate: 0.00025,
            stamp_rate: 0.00003,
            vat_rate: 0.18,
        }
    }
}

impl FeeConfig {
    pub fn from_parameters(params: &HashMap<String, f64>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            brokerage_rate: require_rate(params, "brokerageRate", defaults.brokerage_rate)?,
            brokerage_min: require_non_negative(params, "brokerageMin", defaults.brokerage_min)?,
            transaction_rate: require_rate(params, "transactionRate", defaults.transaction_rate)?,
            regulatory_rate: require_rate(params, "regulatoryRate", defaults.regulatory_rate)?,
            tax_rate: require_rate(params, "taxRate", defaults.tax_rate)?,
            stamp_rate: require_rate(params, "stampRate", defaults.stamp_rate)?,
            vat_rate: require_rate(params, "vatRate", defaults.vat_rate)?,
        };
        Ok(config)
    }

    /// A schedule with every component zeroed, for frictionless scenarios.
    pub fn free() -> Self {
        Self {
            brokerage_rate: 0.0,
            brokerage_min: 0.0,
            transaction_rate: 0.0,
            regulatory_rate: 0.0,
            tax_rate: 0.0,
            stamp_rate: 0.0,
            vat_rate: 0.0,
        }
    }
}

/// Portfolio, risk, and sizing settings for one backtest run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub initial_cash: f64,
    /// Fraction of cash budgeted when opening a long.
    pub buy_cash_pct: f64,
    /// Fraction of cash sizing a short entry.
    pub short_cash_pct: f64,
    /// Adverse move from the volume-weighted entry price that forces a full
    /// close. `None` disables the stop.
    pub stop_loss_pct: Option<f64>,
    /// Favorable move that takes profit on the whole position.
    pub take_profit_pct: Option<f64>,
    pub slippage_pct: f64,
    /// Bars per trading day, used to annualize per-bar return statistics.
    pub bars_per_day: usize,
    pub fees: FeeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_cash: 100_000.0,
            buy_cash_pct: 1.0,
            short_cash_pct: 1.0,
            stop_loss_pct: Some(0.05),
            take_profit_pct: Some(0.10),
            slippage_pct: 0.0,
            bars_per_day: 390,
            fees: FeeConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_parameters(params: &HashMap<String, f64>) -> Result<Self> {
        let defaults = Self::default();

        let initial_cash = get_param(params, "initialCash", defaults.initial_cash);
        if !initial_cash.is_finite() || initial_cash <= 0.0 {
            return Err(anyhow!(
                "initialCash must be a positive number (value: {})",
                initial_cash
            ));
        }

        let buy_cash_pct =
            get_param_f64_clamped(params, "buyCashPct", defaults.buy_cash_pct, 0.0, 1.0);
        let short_cash_pct =
            get_param_f64_clamped(params, "shortCashPct", defaults.short_cash_pct, 0.0, 1.0);

        let slippage_pct = get_param(params, "slippagePct", defaults.slippage_pct);
        if !slippage_pct.is_finite() || slippage_pct < 0.0 {
            return Err(anyhow!(
                "slippagePct must be a non-negative number (value: {})",
                slippage_pct
            ));
        }

        let bars_per_day = get_param(params, "barsPerDay", defaults.bars_per_day as f64);
        if !bars_per_day.is_finite() || bars_per_day < 1.0 {
            return Err(anyhow!(
                "barsPerDay must be at least 1 (value: {})",
                bars_per_day
            ));
        }

        Ok(Self {
            initial_cash,
            buy_cash_pct,
            short_cash_pct,
            stop_loss_pct: optional_threshold(params, "stopLossPct", defaults.stop_loss_pct)?,
            take_profit_pct: optional_threshold(params, "takeProfitPct", defaults.take_profit_pct)?,
            slippage_pct,
            bars_per_day: bars_per_day.round() as usize,
            fees: FeeConfig::from_parameters(params)?,
        })
    }
}

/// Threshold parameters disable at zero, so a grid can switch the overlay
/// off without a separate flag.
fn optional_threshold(
    params: &HashMap<String, f64>,
    key: &str,
    default: Option<f64>,
) -> Result<Option<f64>> {
    match params.get(key).copied() {
        None => Ok(default),
        Some(raw) => {
            if !raw.is_finite() || raw < 0.0 {
                return Err(anyhow!(
                    "{} must be a non-negative number (value: {})",
                    key,
                    raw
                ));
            }
            if raw == 0.0 {
                Ok(None)
            } else {
                Ok(Some(raw))
            }
        }
    }
}

fn require_rate(params: &HashMap<String, f64>, key: &str, default: f64) -> Result<f64> {
    let value = get_param(params, key, default);
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(anyhow!(
            "{} must be between 0 and 1 (value: {})",
            key,
            value
        ));
    }
    Ok(value)
}

fn require_non_negative(params: &HashMap<String, f64>, key: &str, default: f64) -> Result<f64> {
    let value = get_param(params, key, default);
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow!(
            "{} must be a non-negative number (value: {})",
            key,
            value
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_params_empty() {
        let config = EngineConfig::from_parameters(&HashMap::new()).unwrap();
        assert_eq!(config.initial_cash, 100_000.0);
        assert_eq!(config.stop_loss_pct, Some(0.05));
        assert_eq!(config.bars_per_day, 390);
        assert_eq!(config.fees, FeeConfig::default());
    }

    #[test]
    fn test_zero_threshold_disables_overlay() {
        let mut params = HashMap::new();
        params.insert("stopLossPct".to_string(), 0.0);
        params.insert("takeProfitPct".to_string(), 0.08);
        let config = EngineConfig::from_parameters(&params).unwrap();
        assert_eq!(config.stop_loss_pct, None);
        assert_eq!(config.take_profit_pct, Some(0.08));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let mut params = HashMap::new();
        params.insert("initialCash".to_string(), -5.0);
        assert!(EngineConfig::from_parameters(&params).is_err());

        let mut params = HashMap::new();
        params.insert("brokerageRate".to_string(), 1.5);
        assert!(EngineConfig::from_parameters(&params).is_err());

        let mut params = HashMap::new();
        params.insert("slippagePct".to_string(), f64::NAN);
        assert!(EngineConfig::from_parameters(&params).is_err());
    }

    #[test]
    fn test_cash_fractions_are_clamped() {
        let mut params = HashMap::new();
        params.insert("buyCashPct".to_string(), 1.7);
        params.insert("shortCashPct".to_string(), -0.2);
        let config = EngineConfig::from_parameters(&params).unwrap();
        assert_eq!(config.buy_cash_pct, 1.0);
        assert_eq!(config.short_cash_pct, 0.0);
    }
}

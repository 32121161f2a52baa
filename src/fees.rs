use crate::config::FeeConfig;
use crate::models::TradeAction;

/// Pure transaction-cost model. Same inputs always yield the same output;
/// no portfolio state is read or written.
#[derive(Debug, Clone)]
pub struct FeeModel {
    config: FeeConfig,
}

impl FeeModel {
    pub fn new(config: FeeConfig) -> Self {
        Self { config }
    }

    /// Total fees for a trade of `value` (executed price x quantity).
    /// Components: brokerage (rate with a currency floor), transaction and
    /// regulatory charges on value, securities tax on sell-side executions,
    /// stamp duty on buy-side executions, VAT on brokerage + transaction.
    pub fn calculate(&self, value: f64, action: TradeAction) -> f64 {
        if value <= 0.0 {
            return 0.0;
        }
        let c = &self.config;

        let brokerage = (value * c.brokerage_rate).max(c.brokerage_min);
        let transaction = value * c.transaction_rate;
        let regulatory = value * c.regulatory_rate;
        let tax = if action.is_buy_side() {
            0.0
        } else {
            value * c.tax_rate
        };
        let stamp = if action.is_buy_side() {
            value * c.stamp_rate
        } else {
            0.0
        };
        let vat = (brokerage + transaction) * c.vat_rate;

        brokerage + transaction + regulatory + tax + stamp + vat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_model() -> FeeModel {
        FeeModel::new(FeeConfig::default())
    }

    #[test]
    fn test_buy_side_fee_components() {
        let model = default_model();
        let value = 100_000.0;
        // brokerage 50, transaction 10, regulatory 1, stamp 3, vat 10.8
        let expected = 50.0 + 10.0 + 1.0 + 3.0 + (50.0 + 10.0) * 0.18;
        assert!((model.calculate(value, TradeAction::Buy) - expected).abs() < 1e-9);
        assert!((model.calculate(value, TradeAction::Cover) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_sell_side_fee_components() {
        let model = default_model();
        let value = 100_000.0;
        // tax 25 replaces stamp 3 on the sell side
        let expected = 50.0 + 10.0 + 1.0 + 25.0 + (50.0 + 10.0) * 0.18;
        assert!((model.calculate(value, TradeAction::Sell) - expected).abs() < 1e-9);
        assert!((model.calculate(value, TradeAction::Short) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_brokerage_floor_applies_to_small_trades() {
        let model = default_model();
        let value = 1_000.0;
        // rate would give 0.5, floor lifts it to 20
        let brokerage = 20.0;
        let transaction = 0.1;
        let expected = brokerage + transaction + 0.01 + 0.03 + (brokerage + transaction) * 0.18;
        assert!((model.calculate(value, TradeAction::Buy) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_free_schedule_charges_nothing() {
        let model = FeeModel::new(FeeConfig::free());
        assert_eq!(model.calculate(100_000.0, TradeAction::Buy), 0.0);
        assert_eq!(model.calculate(100_000.0, TradeAction::Sell), 0.0);
    }

    #[test]
    fn test_non_positive_value_is_free() {
        let model = default_model();
        assert_eq!(model.calculate(0.0, TradeAction::Buy), 0.0);
        assert_eq!(model.calculate(-10.0, TradeAction::Sell), 0.0);
    }
}

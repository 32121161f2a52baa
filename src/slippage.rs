use crate::models::TradeAction;

/// Fixed-percentage slippage: buy-side executions pay above the quote,
/// sell-side receive below it. Pure and stateless.
#[derive(Debug, Clone, Copy)]
pub struct SlippageModel {
    pct: f64,
}

impl SlippageModel {
    pub fn new(pct: f64) -> Self {
        Self { pct }
    }

    pub fn execution_price(&self, quoted_price: f64, action: TradeAction) -> f64 {
        if action.is_buy_side() {
            quoted_price * (1.0 + self.pct)
        } else {
            quoted_price * (1.0 - self.pct)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_of_adjustment() {
        let model = SlippageModel::new(0.001);
        assert!((model.execution_price(100.0, TradeAction::Buy) - 100.1).abs() < 1e-9);
        assert!((model.execution_price(100.0, TradeAction::Cover) - 100.1).abs() < 1e-9);
        assert!((model.execution_price(100.0, TradeAction::Sell) - 99.9).abs() < 1e-9);
        assert!((model.execution_price(100.0, TradeAction::Short) - 99.9).abs() < 1e-9);
    }

    #[test]
    fn test_zero_slippage_is_identity() {
        let model = SlippageModel::new(0.0);
        assert_eq!(model.execution_price(42.5, TradeAction::Buy), 42.5);
        assert_eq!(model.execution_price(42.5, TradeAction::Sell), 42.5);
    }
}

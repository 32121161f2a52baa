use chrono::{DateTime, Utc};
use log::error;
use std::collections::VecDeque;
use thiserror::Error;

use crate::models::TradeAction;

/// One FIFO cost-basis entry. Quantity is signed (negative for short lots)
/// and keeps its sign for the lot's lifetime; `fees` is the unamortized
/// share of the entry fees still attributed to the lot.
#[derive(Debug, Clone, PartialEq)]
pub struct Lot {
    pub quantity: i64,
    pub entry_price: f64,
    pub fees: f64,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(
        "failed to close {unmatched} of {requested} units: {action} at {timestamp} exhausted the ledger ({open_lots} lots open, net {net_quantity})"
    )]
    Exhausted {
        action: TradeAction,
        timestamp: DateTime<Utc>,
        requested: i64,
        unmatched: i64,
        open_lots: usize,
        net_quantity: i64,
    },
}

/// FIFO lot queue backing exact profit attribution. Exits consume the
/// oldest lots first; entry fees travel with their lot and are expensed
/// in proportion to the quantity matched.
#[derive(Debug, Clone, Default)]
pub struct PositionLedger {
    lots: VecDeque<Lot>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self {
            lots: VecDeque::new(),
        }
    }

    pub fn lots(&self) -> &VecDeque<Lot> {
        &self.lots
    }

    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }

    pub fn net_quantity(&self) -> i64 {
        self.lots.iter().map(|lot| lot.quantity).sum()
    }

    /// Append a new lot. Lots are never merged; adjacent same-price entries
    /// stay distinct so fee attribution remains exact.
    pub fn open(&mut self, quantity: i64, entry_price: f64, entry_fees: f64) {
        if quantity == 0 {
            error!("Ignoring attempt to open a zero-quantity lot at {entry_price}");
            return;
        }
        self.lots.push_back(Lot {
            quantity,
            entry_price,
            fees: entry_fees,
        });
    }

    /// Close `quantity` units oldest-first and return the realized profit
    /// net of prorated entry fees and the exit fees. Exhausting the queue
    /// before the full quantity matches is fatal: the caller sized the
    /// close against stale state.
    pub fn close(
        &mut self,
        action: TradeAction,
        quantity: i64,
        exit_price: f64,
        exit_fees: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<f64, LedgerError> {
        let requested = quantity;
        let mut remaining = quantity;
        let mut profit = 0.0;

        while remaining > 0 {
            let Some(lot) = self.lots.front_mut() else {
                break;
            };
            if lot.quantity == 0 {
                error!("Skipping zero-quantity lot at entry price {}", lot.entry_price);
                self.lots.pop_front();
                continue;
            }

            let lot_abs = lot.quantity.abs();
            let matched = remaining.min(lot_abs);
            let per_unit = match action {
                TradeAction::Sell => exit_price - lot.entry_price,
                _ => lot.entry_price - exit_price,
            };
            let fee_share = lot.fees * matched as f64 / lot_abs as f64;
            profit += per_unit * matched as f64 - fee_share;

            if matched == lot_abs {
                self.lots.pop_front();
            } else {
                lot.quantity -= matched * lot.quantity.signum();
                lot.fees -= fee_share;
            }
            remaining -= matched;
        }

        if remaining > 0 {
            return Err(LedgerError::Exhausted {
                action,
                timestamp,
                requested,
                unmatched: remaining,
                open_lots: self.lots.len(),
                net_quantity: self.net_quantity(),
            });
        }

        Ok(profit - exit_fees)
    }

    /// Soft consistency check: the lot quantities must sum to the recorded
    /// net position. A mismatch is logged and reported, never repaired.
    pub fn validate(&self, expected_net_quantity: i64) -> bool {
        let actual = self.net_quantity();
        if actual != expected_net_quantity {
            error!(
                "Ledger mismatch: lots sum to {actual} but recorded net quantity is {expected_net_quantity}"
            );
            return false;
        }
        true
    }

    /// Volume-weighted average entry price across open lots, used as the
    /// reference for stop-loss and take-profit checks.
    pub fn volume_weighted_entry_price(&self) -> Option<f64> {
        let total: i64 = self.lots.iter().map(|lot| lot.quantity.abs()).sum();
        if total == 0 {
            return None;
        }
        let weighted: f64 = self
            .lots
            .iter()
            .map(|lot| lot.quantity.abs() as f64 * lot.entry_price)
            .sum();
        Some(weighted / total as f64)
    }
}

//! FIFO layer repricing.
//!
//! Incoming rows open cost layers; outgoing rows consume them oldest first.
//! Rows whose reference type consumes at FIFO cost get their unit cost
//! recomputed from the layers they actually consume. Declared-cost outgoing
//! rows (adjustments, write-offs) consume layers too but keep their cost.

use std::collections::VecDeque;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockbook_core::LedgerEntryId;

use crate::entry::LedgerEntry;

/// A row whose unit cost changed during repricing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repriced {
    pub id: LedgerEntryId,
    pub old_unit_cost: Decimal,
    pub new_unit_cost: Decimal,
}

#[derive(Debug, Clone, Copy)]
struct Layer {
    remaining: Decimal,
    unit_cost: Decimal,
}

#[derive(Debug, Default)]
struct Layers {
    open: VecDeque<Layer>,
    last_cost: Option<Decimal>,
}

impl Layers {
    fn receive(&mut self, quantity: Decimal, unit_cost: Decimal) {
        self.open.push_back(Layer {
            remaining: quantity,
            unit_cost,
        });
        self.last_cost = Some(unit_cost);
    }

    /// Consume `quantity` units and return their total cost plus any quantity
    /// the open layers could not cover.
    fn consume(&mut self, mut quantity: Decimal) -> (Decimal, Decimal) {
        let mut cost = Decimal::ZERO;
        while quantity > Decimal::ZERO {
            let Some(front) = self.open.front_mut() else {
                break;
            };
            let taken = quantity.min(front.remaining);
            cost += taken * front.unit_cost;
            front.remaining -= taken;
            quantity -= taken;
            self.last_cost = Some(front.unit_cost);
            if front.remaining.is_zero() {
                self.open.pop_front();
            }
        }
        (cost, quantity)
    }
}

/// Reprice FIFO-basis outgoing rows dated on or after `from`.
///
/// `history` must be the whole partition in partition order. Reversed rows and
/// reversals net to zero and are left out of the layering. Shortfalls (selling
/// more than was received) are priced at the last layer cost seen, falling back
/// to the row's current cost.
pub fn reprice(history: &[LedgerEntry], from: NaiveDate) -> Vec<Repriced> {
    let mut layers = Layers::default();
    let mut changed = Vec::new();

    for row in history.iter().filter(|r| r.is_active() && !r.quantity.is_zero()) {
        if !row.is_outgoing {
            layers.receive(row.quantity, row.base_unit_cost);
            continue;
        }

        let wanted = row.quantity.abs();
        let (cost, shortfall) = layers.consume(wanted);
        if !row.is_fifo_priced() || row.transaction_date < from {
            continue;
        }

        let fallback = layers.last_cost.unwrap_or(row.base_unit_cost);
        let unit_cost = (cost + shortfall * fallback) / wanted;
        if unit_cost != row.base_unit_cost {
            changed.push(Repriced {
                id: row.id,
                old_unit_cost: row.base_unit_cost,
                new_unit_cost: unit_cost,
            });
        }
    }

    changed
}

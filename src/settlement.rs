//! Settlement optimizer: nets raw debts per person and re-matches debtors to
//! creditors to cut down the number of payments.
//!
//! # Matching
//!
//! Debtors are walked in roster order; each pays creditors in roster order
//! until their obligation is gone. Every payment exhausts either the debtor or
//! the creditor, so at most `debtors + creditors - 1` payments are produced.
//! This is a greedy pass, not a search for the fewest possible payments: a
//! group that splits into two independent zero-sum subgroups may still get one
//! payment more than the optimum.
//!
//! # Rounding
//!
//! Raw debts are already whole cents, so balances are accumulated exactly and
//! rounded once at the end. Payment amounts are rounded at emission.

use crate::decimal::Money;
use crate::error::{LedgerError, Result};
use crate::model::{Debt, Person};
use log::debug;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// A person's net position: positive when owed money, negative when owing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    pub person_id: String,
    pub amount: Money,
}

/// Computes the net balance of every known person, in roster order.
///
/// People referenced by a debt but missing from the roster are appended after
/// the roster, in order of first appearance, so the balances still sum to zero.
///
/// Fails with [`LedgerError::InvalidInput`] if a running total leaves the
/// range of `Decimal`.
pub fn net_balances(raw_debts: &[Debt], people: &[Person]) -> Result<Vec<Balance>> {
    let mut order: Vec<&str> = people.iter().map(|p| p.id.as_str()).collect();
    let mut totals: HashMap<&str, Decimal> = order.iter().map(|id| (*id, Decimal::ZERO)).collect();

    for debt in raw_debts {
        for id in [debt.from_user_id.as_str(), debt.to_user_id.as_str()] {
            if !totals.contains_key(id) {
                debug!("Debt references {} who is not on the roster", id);
                totals.insert(id, Decimal::ZERO);
                order.push(id);
            }
        }

        let amount = debt.amount.as_decimal();
        if let Some(total) = totals.get_mut(debt.from_user_id.as_str()) {
            *total = total
                .checked_sub(amount)
                .ok_or_else(|| out_of_range(&debt.from_user_id))?;
        }
        if let Some(total) = totals.get_mut(debt.to_user_id.as_str()) {
            *total = total
                .checked_add(amount)
                .ok_or_else(|| out_of_range(&debt.to_user_id))?;
        }
    }

    Ok(order
        .into_iter()
        .map(|id| Balance {
            person_id: id.to_string(),
            amount: Money::new(totals.get(id).copied().unwrap_or_default()),
        })
        .collect())
}

fn out_of_range(person_id: &str) -> LedgerError {
    LedgerError::invalid(format!("balance of {} is out of range", person_id))
}

/// Reduces raw debts to a small set of settlement payments.
///
/// The result depends only on the order of `people` and `raw_debts`. Input
/// that already nets to zero for everyone yields no payments.
pub fn simplify(raw_debts: &[Debt], people: &[Person]) -> Result<Vec<Debt>> {
    let balances = net_balances(raw_debts, people)?;
    Ok(settle_balances(&balances))
}

/// Greedily matches negative balances to positive ones, in the given order.
///
/// Each payment is bounded by both sides' remaining amounts, so nothing here
/// can overflow.
pub fn settle_balances(balances: &[Balance]) -> Vec<Debt> {
    let debtors: Vec<(String, Money)> = balances
        .iter()
        .filter(|b| b.amount.is_negative())
        .map(|b| (b.person_id.clone(), b.amount.abs()))
        .collect();

    let mut creditors: Vec<(String, Money)> = balances
        .iter()
        .filter(|b| b.amount.is_positive())
        .map(|b| (b.person_id.clone(), b.amount))
        .collect();

    let mut settlements = Vec::new();

    for (debtor, owed) in debtors {
        let mut remaining = owed;

        for (creditor, credit) in creditors.iter_mut() {
            if !remaining.is_positive() {
                break;
            }
            if !credit.is_positive() {
                continue;
            }

            let payment = remaining.min(*credit);
            if payment.is_positive() {
                debug!("{} pays {} {}", debtor, creditor, payment);
                settlements.push(Debt::new(debtor.clone(), creditor.clone(), payment));
                *credit -= payment;
                remaining -= payment;
            }
        }

        if remaining.is_positive() {
            debug!("{} left with {} unmatched", debtor, remaining);
        }
    }

    settlements
}

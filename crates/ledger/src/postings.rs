//! Posting factories
//!
//! Every financial event is expressed as a balanced set of postings.
//! These constructors are the only places posting shapes are defined, so
//! the zero-sum invariant holds by construction everywhere they are used.

use crate::types::Posting;
use meridian_core::{AccountId, AccountKey, MicroUsd};

fn neg(amount: MicroUsd) -> MicroUsd {
    MicroUsd::new(-amount.get())
}

/// Supply injection: credit the user, debit system revenue (the amount is
/// the provider's debt until it is earned back).
pub fn mint(user: &AccountId, amount: MicroUsd) -> Vec<Posting> {
    vec![
        Posting::micro_usd(AccountKey::available(user), amount),
        Posting::micro_usd(AccountKey::SystemRevenue, neg(amount)),
    ]
}

/// Move an estimate from available to held.
pub fn reserve(user: &AccountId, amount: MicroUsd) -> Vec<Posting> {
    vec![
        Posting::micro_usd(AccountKey::available(user), neg(amount)),
        Posting::micro_usd(AccountKey::held(user), amount),
    ]
}

/// Settle a held reservation against actual cost. The difference between
/// reserved and actual flows back to available; revenue takes the actual.
pub fn commit(user: &AccountId, reserved: MicroUsd, actual: MicroUsd) -> Vec<Posting> {
    let refund = MicroUsd::new(reserved.get() - actual.get());
    vec![
        Posting::micro_usd(AccountKey::held(user), neg(reserved)),
        Posting::micro_usd(AccountKey::available(user), refund),
        Posting::micro_usd(AccountKey::SystemRevenue, actual),
    ]
}

/// Return a reservation untouched.
pub fn release(user: &AccountId, amount: MicroUsd) -> Vec<Posting> {
    vec![
        Posting::micro_usd(AccountKey::held(user), neg(amount)),
        Posting::micro_usd(AccountKey::available(user), amount),
    ]
}

/// Administrative reversal of a settled commit.
pub fn void(user: &AccountId, amount: MicroUsd) -> Vec<Posting> {
    vec![
        Posting::micro_usd(AccountKey::SystemRevenue, neg(amount)),
        Posting::micro_usd(AccountKey::available(user), amount),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum(postings: &[Posting]) -> i64 {
        postings.iter().map(|p| p.delta.get()).sum()
    }

    #[test]
    fn test_factories_balance_to_zero() {
        let user = AccountId::new("u1").unwrap();
        let n = MicroUsd::new(3_000);
        assert_eq!(sum(&mint(&user, n)), 0);
        assert_eq!(sum(&reserve(&user, n)), 0);
        assert_eq!(sum(&commit(&user, n, MicroUsd::new(2_500))), 0);
        assert_eq!(sum(&release(&user, n)), 0);
        assert_eq!(sum(&void(&user, n)), 0);
    }

    #[test]
    fn test_commit_refunds_overage() {
        let user = AccountId::new("u1").unwrap();
        let postings = commit(&user, MicroUsd::new(3_000), MicroUsd::new(2_500));
        let refund = postings
            .iter()
            .find(|p| p.account == AccountKey::available(&user))
            .unwrap();
        assert_eq!(refund.delta, MicroUsd::new(500));
    }

    #[test]
    fn test_commit_exact_cost_refunds_nothing() {
        let user = AccountId::new("u1").unwrap();
        let postings = commit(&user, MicroUsd::new(3_000), MicroUsd::new(3_000));
        let refund = postings
            .iter()
            .find(|p| p.account == AccountKey::available(&user))
            .unwrap();
        assert_eq!(refund.delta, MicroUsd::ZERO);
    }
}

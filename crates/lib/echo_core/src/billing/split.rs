//! Splitting a provider charge into what the user pays and who earns what.
//!
//! All arithmetic is `Decimal` at the ledger's column scale. The referral
//! share is rounded toward zero and the app share is computed by subtraction,
//! so any rounding remainder lands in `app_profit` and
//! `app_profit + referral_profit == markup_profit` holds exactly.

use rust_decimal::{Decimal, RoundingStrategy};

/// Fractional digits stored by the ledger's NUMERIC columns.
pub const MONEY_SCALE: u32 = 12;

/// Monetary breakdown of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostSplit {
    pub raw_transaction_cost: Decimal,
    pub markup_profit: Decimal,
    pub total_cost: Decimal,
    pub referral_profit: Decimal,
    pub app_profit: Decimal,
}

/// Round a monetary amount to ledger scale.
pub fn to_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointNearestEven)
}

/// Split `raw_cost` given the app's markup rate and, for referred users, the referral rate.
pub fn split_cost(
    raw_cost: Decimal,
    markup_rate: Decimal,
    referral_rate: Option<Decimal>,
) -> CostSplit {
    let raw_transaction_cost = to_money(raw_cost);
    let markup_profit = to_money(raw_transaction_cost * markup_rate);
    let referral_profit = match referral_rate {
        Some(rate) => (markup_profit * rate).round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::ToZero),
        None => Decimal::ZERO,
    };

    CostSplit {
        raw_transaction_cost,
        markup_profit,
        total_cost: raw_transaction_cost + markup_profit,
        referral_profit,
        app_profit: markup_profit - referral_profit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn no_markup_means_no_profit() {
        let split = split_cost(dec("0.60"), Decimal::ZERO, None);
        assert_eq!(split.total_cost, dec("0.60"));
        assert_eq!(split.markup_profit, Decimal::ZERO);
        assert_eq!(split.app_profit, Decimal::ZERO);
    }

    #[test]
    fn referral_takes_its_share_of_markup() {
        let split = split_cost(dec("1.00"), dec("0.25"), Some(dec("0.10")));
        assert_eq!(split.markup_profit, dec("0.25"));
        assert_eq!(split.total_cost, dec("1.25"));
        assert_eq!(split.referral_profit, dec("0.025"));
        assert_eq!(split.app_profit, dec("0.225"));
    }

    #[test]
    fn rounding_remainder_goes_to_app_profit() {
        // 3e-12 * 0.333333 rounds up to one ledger unit.
        let split = split_cost(dec("0.000000000003"), dec("0.333333"), Some(dec("0.5")));
        assert_eq!(split.markup_profit, dec("0.000000000001"));
        assert_eq!(split.referral_profit, Decimal::ZERO);
        assert_eq!(split.app_profit, dec("0.000000000001"));
    }

    fn arb_rate() -> impl Strategy<Value = Decimal> {
        (0u32..=1_000_000).prop_map(|n| Decimal::new(n as i64, 6))
    }

    fn arb_cost() -> impl Strategy<Value = Decimal> {
        (0i64..=10_000_000_000_000).prop_map(|n| Decimal::new(n, 9))
    }

    proptest! {
        #[test]
        fn split_invariants_hold(
            raw in arb_cost(),
            markup in arb_rate(),
            referral in prop::option::of(arb_rate()),
        ) {
            let split = split_cost(raw, markup, referral);
            prop_assert_eq!(split.total_cost, split.raw_transaction_cost + split.markup_profit);
            prop_assert_eq!(split.app_profit + split.referral_profit, split.markup_profit);
            prop_assert!(split.referral_profit >= Decimal::ZERO);
            prop_assert!(split.app_profit >= Decimal::ZERO);
            prop_assert!(split.total_cost >= split.raw_transaction_cost);
        }
    }
}

#![deny(warnings)]

//! Economic model: cost scaling and production rates.
//!
//! Pure, deterministic helpers over the catalog and owned counts:
//! - Purchase cost of the next generator unit (geometric growth)
//! - Upgrade multiplier stacking per generator
//! - Aggregate production rate and manual action value
//! - Upgrade availability from ownership thresholds

use clicker_core::{Catalog, GeneratorId, UpgradeDef, UpgradeId};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;

/// Cost growth per owned unit (1.15).
pub const GROWTH_FACTOR: Decimal = Decimal::from_parts(115, 0, 0, false, 2);

/// Effect of one applied upgrade on its target (2x).
pub const UPGRADE_MULTIPLIER: Decimal = Decimal::from_parts(2, 0, 0, false, 0);

/// Errors produced by economic helpers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EconError {
    /// Generator missing from the catalog.
    #[error("unknown generator: {0}")]
    UnknownGenerator(String),
    /// Upgrade missing from the catalog.
    #[error("unknown upgrade: {0}")]
    UnknownUpgrade(u32),
    /// Result does not fit the decimal range.
    #[error("amount overflow")]
    Overflow,
}

/// `base^exp` by squaring, failing on overflow instead of panicking.
fn checked_powi(base: Decimal, mut exp: u32) -> Result<Decimal, EconError> {
    let mut result = Decimal::ONE;
    let mut b = base;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result.checked_mul(b).ok_or(EconError::Overflow)?;
        }
        exp >>= 1;
        if exp > 0 {
            b = b.checked_mul(b).ok_or(EconError::Overflow)?;
        }
    }
    Ok(result)
}

/// Cost of the next unit: `base × 1.15^owned`.
///
/// Example:
/// let c = scaled_cost(Decimal::new(100, 0), 3).unwrap();
/// assert_eq!(c, Decimal::new(1520875, 4)); // 152.0875
pub fn scaled_cost(base_cost: Decimal, owned: u32) -> Result<Decimal, EconError> {
    let factor = checked_powi(GROWTH_FACTOR, owned)?;
    base_cost.checked_mul(factor).ok_or(EconError::Overflow)
}

/// Purchase cost of the next unit of `generator` given `owned` units.
pub fn purchase_cost(
    catalog: &Catalog,
    generator: &GeneratorId,
    owned: u32,
) -> Result<Decimal, EconError> {
    let def = catalog
        .generator(generator)
        .ok_or_else(|| EconError::UnknownGenerator(generator.0.clone()))?;
    scaled_cost(def.base_cost, owned)
}

/// Flat cost of an upgrade.
pub fn upgrade_cost(catalog: &Catalog, upgrade: UpgradeId) -> Result<Decimal, EconError> {
    catalog
        .upgrade(upgrade)
        .map(|u| u.cost)
        .ok_or(EconError::UnknownUpgrade(upgrade.0))
}

/// `2^k` where k is the number of applied upgrades targeting `generator`.
///
/// Upgrades compose multiplicatively, so the order they were applied in does
/// not matter. Ids unknown to the catalog contribute nothing.
pub fn effective_multiplier(
    catalog: &Catalog,
    generator: &GeneratorId,
    applied: &BTreeSet<UpgradeId>,
) -> Result<Decimal, EconError> {
    let k = applied
        .iter()
        .filter_map(|id| catalog.upgrade(*id))
        .filter(|u| u.targets(generator))
        .count();
    let k = u32::try_from(k).map_err(|_| EconError::Overflow)?;
    checked_powi(UPGRADE_MULTIPLIER, k)
}

/// Sum over catalog generators of `owned × base_rate × multiplier`.
pub fn aggregate_production_rate(
    catalog: &Catalog,
    owned: &BTreeMap<GeneratorId, u32>,
    applied: &BTreeSet<UpgradeId>,
) -> Result<Decimal, EconError> {
    let mut total = Decimal::ZERO;
    for def in &catalog.generators {
        let count = owned.get(&def.id).copied().unwrap_or(0);
        if count == 0 {
            continue;
        }
        let mult = effective_multiplier(catalog, &def.id, applied)?;
        let contribution = Decimal::from(count)
            .checked_mul(def.base_rate)
            .and_then(|r| r.checked_mul(mult))
            .ok_or(EconError::Overflow)?;
        total = total.checked_add(contribution).ok_or(EconError::Overflow)?;
    }
    Ok(total)
}

/// Value of one manual action: base doubled once per applied upgrade that
/// boosts the manual action.
pub fn manual_action_value(
    catalog: &Catalog,
    applied: &BTreeSet<UpgradeId>,
) -> Result<Decimal, EconError> {
    let k = applied
        .iter()
        .filter_map(|id| catalog.upgrade(*id))
        .filter(|u| u.boosts_manual_action)
        .count();
    let k = u32::try_from(k).map_err(|_| EconError::Overflow)?;
    let mult = checked_powi(UPGRADE_MULTIPLIER, k)?;
    catalog
        .manual_action_base
        .checked_mul(mult)
        .ok_or(EconError::Overflow)
}

/// Whether the upgrade's ownership threshold is met.
pub fn requirement_met(upgrade: &UpgradeDef, owned: &BTreeMap<GeneratorId, u32>) -> bool {
    match &upgrade.requires {
        Some(req) => owned.get(&req.generator).copied().unwrap_or(0) >= req.count,
        None => true,
    }
}

/// Upgrades that are not applied yet and whose prerequisites are met.
pub fn available_upgrades<'a>(
    catalog: &'a Catalog,
    owned: &BTreeMap<GeneratorId, u32>,
    applied: &BTreeSet<UpgradeId>,
) -> Vec<&'a UpgradeDef> {
    catalog
        .upgrades
        .iter()
        .filter(|u| !applied.contains(&u.id) && requirement_met(u, owned))
        .collect()
}

/// Resource produced at `rate` per second over `elapsed`, at millisecond
/// resolution.
pub fn production_over(rate: Decimal, elapsed: Duration) -> Result<Decimal, EconError> {
    let millis = i64::try_from(elapsed.as_millis()).map_err(|_| EconError::Overflow)?;
    rate.checked_mul(Decimal::new(millis, 3))
        .ok_or(EconError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(s: &str) -> GeneratorId {
        GeneratorId::new(s)
    }

    fn owned(pairs: &[(&str, u32)]) -> BTreeMap<GeneratorId, u32> {
        pairs.iter().map(|(k, v)| (id(k), *v)).collect()
    }

    #[test]
    fn cost_of_fourth_grandma() {
        let c = purchase_cost(&Catalog::standard(), &id("grandma"), 3).unwrap();
        assert_eq!(c, Decimal::new(1_520_875, 4));
    }

    #[test]
    fn first_unit_costs_base() {
        let c = purchase_cost(&Catalog::standard(), &id("cursor"), 0).unwrap();
        assert_eq!(c, Decimal::new(15, 0));
    }

    #[test]
    fn unknown_generator_is_an_error() {
        assert_eq!(
            purchase_cost(&Catalog::standard(), &id("portal"), 0),
            Err(EconError::UnknownGenerator("portal".into()))
        );
    }

    #[test]
    fn huge_counts_overflow_instead_of_panicking() {
        let c = purchase_cost(&Catalog::standard(), &id("factory"), 10_000);
        assert_eq!(c, Err(EconError::Overflow));
    }

    #[test]
    fn grandma_upgrades_stack_to_eight() {
        let catalog = Catalog::standard();
        let applied: BTreeSet<_> = [UpgradeId(2), UpgradeId(3), UpgradeId(4)].into();
        let m = effective_multiplier(&catalog, &id("grandma"), &applied).unwrap();
        assert_eq!(m, Decimal::new(8, 0));
        let cursor = effective_multiplier(&catalog, &id("cursor"), &applied).unwrap();
        assert_eq!(cursor, Decimal::ONE);
    }

    #[test]
    fn global_upgrade_applies_to_every_generator() {
        let mut catalog = Catalog::standard();
        catalog.upgrades.push(UpgradeDef {
            id: UpgradeId(9),
            name: "Everything".into(),
            description: String::new(),
            target: clicker_core::UpgradeTarget::Global,
            cost: Decimal::new(1, 0),
            requires: None,
            boosts_manual_action: false,
        });
        let applied: BTreeSet<_> = [UpgradeId(1), UpgradeId(9)].into();
        assert_eq!(
            effective_multiplier(&catalog, &id("cursor"), &applied).unwrap(),
            Decimal::new(4, 0)
        );
        assert_eq!(
            effective_multiplier(&catalog, &id("mine"), &applied).unwrap(),
            Decimal::new(2, 0)
        );
    }

    #[test]
    fn aggregate_rate_mixes_counts_and_multipliers() {
        let catalog = Catalog::standard();
        let counts = owned(&[("cursor", 10), ("grandma", 3), ("farm", 1)]);
        let applied: BTreeSet<_> = [UpgradeId(1), UpgradeId(2)].into();
        // 10*0.1*2 + 3*1*2 + 1*8 = 2 + 6 + 8
        let rate = aggregate_production_rate(&catalog, &counts, &applied).unwrap();
        assert_eq!(rate, Decimal::new(16, 0));
    }

    #[test]
    fn rate_is_zero_without_generators() {
        let catalog = Catalog::standard();
        let rate =
            aggregate_production_rate(&catalog, &BTreeMap::new(), &BTreeSet::new()).unwrap();
        assert_eq!(rate, Decimal::ZERO);
    }

    #[test]
    fn manual_value_doubles_with_index_finger() {
        let catalog = Catalog::standard();
        assert_eq!(
            manual_action_value(&catalog, &BTreeSet::new()).unwrap(),
            Decimal::ONE
        );
        let applied: BTreeSet<_> = [UpgradeId(1), UpgradeId(2)].into();
        assert_eq!(
            manual_action_value(&catalog, &applied).unwrap(),
            Decimal::new(2, 0)
        );
    }

    #[test]
    fn availability_follows_thresholds() {
        let catalog = Catalog::standard();
        let none = available_upgrades(&catalog, &BTreeMap::new(), &BTreeSet::new());
        assert!(none.is_empty());
        let counts = owned(&[("cursor", 1), ("grandma", 5)]);
        let ids: Vec<u32> = available_upgrades(&catalog, &counts, &BTreeSet::new())
            .iter()
            .map(|u| u.id.0)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let applied: BTreeSet<_> = [UpgradeId(2)].into();
        let ids: Vec<u32> = available_upgrades(&catalog, &counts, &applied)
            .iter()
            .map(|u| u.id.0)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn production_over_elapsed_time() {
        let rate = Decimal::new(16, 1); // 1.6/s
        let p = production_over(rate, Duration::from_secs(45)).unwrap();
        assert_eq!(p, Decimal::new(72, 0));
        let p = production_over(rate, Duration::from_millis(250)).unwrap();
        assert_eq!(p, Decimal::new(4, 1));
    }

    proptest! {
        #[test]
        fn cost_strictly_increasing(n in 0u32..300) {
            let catalog = Catalog::standard();
            for g in &catalog.generators {
                let a = purchase_cost(&catalog, &g.id, n).unwrap();
                let b = purchase_cost(&catalog, &g.id, n + 1).unwrap();
                prop_assert!(b > a);
                prop_assert!(a > Decimal::ZERO);
            }
        }

        #[test]
        fn cost_matches_repeated_growth(n in 0u32..12) {
            let mut expected = Decimal::new(1_100, 0);
            for _ in 0..n {
                expected *= GROWTH_FACTOR;
            }
            prop_assert_eq!(scaled_cost(Decimal::new(1_100, 0), n).unwrap(), expected);
        }

        #[test]
        fn stacking_is_order_independent(ids in proptest::sample::subsequence(vec![2u32, 3, 4], 0..=3),
                                         rev in any::<bool>()) {
            let catalog = Catalog::standard();
            let mut order = ids.clone();
            if rev {
                order.reverse();
            }
            let mut applied = BTreeSet::new();
            for i in order {
                applied.insert(UpgradeId(i));
            }
            let m = effective_multiplier(&catalog, &id("grandma"), &applied).unwrap();
            prop_assert_eq!(m, Decimal::from(1u64 << ids.len()));
        }
    }
}

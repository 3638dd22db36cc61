//! Mutable progression state owned by one running session.
//!
//! Every mutation either fully applies or returns an [`ActionError`] without
//! touching anything. The production rate and manual action value are caches
//! recomputed from `(owned, applied)` after each change.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use clicker_core::{validate_snapshot, Action, Catalog, GeneratorId, Snapshot, UpgradeId};
use clicker_econ as econ;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{ActionError, SnapshotError};

/// Result of a successful generator purchase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Purchase {
    pub generator: GeneratorId,
    pub new_count: u32,
    pub cost: Decimal,
}

/// Per-generator line for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratorView {
    pub id: GeneratorId,
    pub name: String,
    pub owned: u32,
    /// `None` when the next unit is too expensive to represent.
    pub next_cost: Option<Decimal>,
    /// This generator's share of the production rate.
    pub rate: Decimal,
    pub affordable: bool,
}

/// Per-upgrade line for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpgradeView {
    pub id: UpgradeId,
    pub name: String,
    pub description: String,
    pub cost: Decimal,
    pub available: bool,
    pub purchased: bool,
    pub affordable: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressionState {
    catalog: Arc<Catalog>,
    balance: Decimal,
    total_earned: Decimal,
    owned: BTreeMap<GeneratorId, u32>,
    applied: BTreeSet<UpgradeId>,
    production_rate: Decimal,
    manual_action_value: Decimal,
    total_clicks: u64,
}

impl ProgressionState {
    /// Build the session state from the authority's snapshot.
    pub fn from_snapshot(catalog: Arc<Catalog>, snapshot: &Snapshot) -> Result<Self, SnapshotError> {
        validate_snapshot(&catalog, snapshot)?;
        let production_rate =
            econ::aggregate_production_rate(&catalog, &snapshot.owned, &snapshot.upgrades)?;
        let manual_action_value = econ::manual_action_value(&catalog, &snapshot.upgrades)?;
        Ok(Self {
            balance: snapshot.balance,
            total_earned: snapshot.total_earned.max(snapshot.balance),
            owned: snapshot.owned.clone(),
            applied: snapshot.upgrades.clone(),
            production_rate,
            manual_action_value,
            total_clicks: snapshot.total_clicks,
            catalog,
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn total_earned(&self) -> Decimal {
        self.total_earned
    }

    pub fn production_rate(&self) -> Decimal {
        self.production_rate
    }

    pub fn manual_action_value(&self) -> Decimal {
        self.manual_action_value
    }

    pub fn total_clicks(&self) -> u64 {
        self.total_clicks
    }

    pub fn owned_count(&self, generator: &GeneratorId) -> u32 {
        self.owned.get(generator).copied().unwrap_or(0)
    }

    pub fn is_applied(&self, upgrade: UpgradeId) -> bool {
        self.applied.contains(&upgrade)
    }

    /// Cost of the next unit of `generator`.
    pub fn next_cost(&self, generator: &GeneratorId) -> Result<Decimal, ActionError> {
        if self.catalog.generator(generator).is_none() {
            return Err(ActionError::UnknownGenerator(generator.clone()));
        }
        Ok(econ::purchase_cost(
            &self.catalog,
            generator,
            self.owned_count(generator),
        )?)
    }

    fn credit(&mut self, amount: Decimal) {
        self.balance = self.balance.saturating_add(amount);
        self.total_earned = self.total_earned.saturating_add(amount);
    }

    /// Credit one manual action and return the amount added.
    pub fn apply_manual_action(&mut self) -> Decimal {
        let delta = self.manual_action_value;
        self.credit(delta);
        self.total_clicks = self.total_clicks.saturating_add(1);
        delta
    }

    pub fn purchase_generator(&mut self, generator: &GeneratorId) -> Result<Purchase, ActionError> {
        let cost = self.next_cost(generator)?;
        if self.balance < cost {
            return Err(ActionError::InsufficientFunds {
                cost,
                balance: self.balance,
            });
        }
        let mut owned = self.owned.clone();
        let count = owned.entry(generator.clone()).or_insert(0);
        *count += 1;
        let new_count = *count;
        let production_rate =
            econ::aggregate_production_rate(&self.catalog, &owned, &self.applied)?;

        self.balance -= cost;
        self.owned = owned;
        self.production_rate = production_rate;
        Ok(Purchase {
            generator: generator.clone(),
            new_count,
            cost,
        })
    }

    pub fn apply_upgrade(&mut self, upgrade: UpgradeId) -> Result<(), ActionError> {
        let def = self
            .catalog
            .upgrade(upgrade)
            .ok_or(ActionError::UnknownUpgrade(upgrade))?;
        if self.applied.contains(&upgrade) {
            return Err(ActionError::AlreadyApplied(upgrade));
        }
        if !econ::requirement_met(def, &self.owned) {
            return Err(ActionError::NotAvailable(upgrade));
        }
        if self.balance < def.cost {
            return Err(ActionError::InsufficientFunds {
                cost: def.cost,
                balance: self.balance,
            });
        }
        let cost = def.cost;
        let mut applied = self.applied.clone();
        applied.insert(upgrade);
        let production_rate = econ::aggregate_production_rate(&self.catalog, &self.owned, &applied)?;
        let manual_action_value = econ::manual_action_value(&self.catalog, &applied)?;

        self.balance -= cost;
        self.applied = applied;
        self.production_rate = production_rate;
        self.manual_action_value = manual_action_value;
        Ok(())
    }

    /// Apply `action` locally. Used for optimistic updates and for replaying
    /// still-pending actions on top of a fresh snapshot.
    pub fn apply(&mut self, action: &Action) -> Result<(), ActionError> {
        match action {
            Action::ManualAction => {
                self.apply_manual_action();
                Ok(())
            }
            Action::PurchaseGenerator(id) => self.purchase_generator(id).map(|_| ()),
            Action::PurchaseUpgrade(id) => self.apply_upgrade(*id),
        }
    }

    /// Credit passive production for the time actually elapsed since the
    /// previous tick. Callers measure `elapsed` from a clock, never pass the
    /// nominal interval. Nothing is credited when the amount overflows.
    pub fn tick(&mut self, elapsed: Duration) -> Result<Decimal, ActionError> {
        let delta = econ::production_over(self.production_rate, elapsed)?;
        self.credit(delta);
        Ok(delta)
    }

    /// Replace local state with the authority's snapshot. `unsynced` is
    /// passive income the authority has not been told about yet.
    ///
    /// The lifetime total never decreases, even when a rollback lowers the
    /// balance.
    pub fn reconcile(&mut self, snapshot: &Snapshot, unsynced: Decimal) -> Result<(), SnapshotError> {
        validate_snapshot(&self.catalog, snapshot)?;
        let production_rate =
            econ::aggregate_production_rate(&self.catalog, &snapshot.owned, &snapshot.upgrades)?;
        let manual_action_value = econ::manual_action_value(&self.catalog, &snapshot.upgrades)?;
        let balance = snapshot.balance.saturating_add(unsynced);

        self.total_earned = self
            .total_earned
            .max(snapshot.total_earned.saturating_add(unsynced))
            .max(balance);
        self.balance = balance;
        self.owned = snapshot.owned.clone();
        self.applied = snapshot.upgrades.clone();
        self.production_rate = production_rate;
        self.manual_action_value = manual_action_value;
        self.total_clicks = snapshot.total_clicks;
        Ok(())
    }

    /// Current state in snapshot form.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            balance: self.balance,
            total_earned: self.total_earned,
            owned: self.owned.clone(),
            upgrades: self.applied.clone(),
            saved_at: None,
            total_clicks: self.total_clicks,
        }
    }

    pub fn available_upgrades(&self) -> Vec<UpgradeId> {
        econ::available_upgrades(&self.catalog, &self.owned, &self.applied)
            .into_iter()
            .map(|u| u.id)
            .collect()
    }

    pub fn generator_views(&self) -> Vec<GeneratorView> {
        self.catalog
            .generators
            .iter()
            .map(|def| {
                let owned = self.owned_count(&def.id);
                let next_cost = econ::purchase_cost(&self.catalog, &def.id, owned).ok();
                let rate = econ::effective_multiplier(&self.catalog, &def.id, &self.applied)
                    .ok()
                    .and_then(|m| m.checked_mul(def.base_rate))
                    .and_then(|r| r.checked_mul(Decimal::from(owned)))
                    .unwrap_or(Decimal::ZERO);
                GeneratorView {
                    id: def.id.clone(),
                    name: def.name.clone(),
                    owned,
                    next_cost,
                    rate,
                    affordable: next_cost.map_or(false, |c| c <= self.balance),
                }
            })
            .collect()
    }

    pub fn upgrade_views(&self) -> Vec<UpgradeView> {
        self.catalog
            .upgrades
            .iter()
            .map(|def| {
                let purchased = self.applied.contains(&def.id);
                let available = !purchased && econ::requirement_met(def, &self.owned);
                UpgradeView {
                    id: def.id,
                    name: def.name.clone(),
                    description: def.description.clone(),
                    cost: def.cost,
                    available,
                    purchased,
                    affordable: available && def.cost <= self.balance,
                }
            })
            .collect()
    }
}

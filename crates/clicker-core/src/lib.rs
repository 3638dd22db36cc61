#![deny(warnings)]

//! Core domain models and invariants for the clicker engine.
//!
//! This crate defines the static catalog (generators and upgrades), the
//! authoritative snapshot shape, and the identities carried by requests to the
//! remote authority, with validation helpers to guarantee basic invariants.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Identifier of a generator, e.g. "cursor", "grandma".
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeneratorId(pub String);

impl GeneratorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeneratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Numeric identifier of an upgrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpgradeId(pub u32);

impl fmt::Display for UpgradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A purchasable passive producer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneratorDef {
    /// Generator identifier.
    pub id: GeneratorId,
    /// Display name.
    pub name: String,
    /// Flavour text shown next to the buy button.
    #[serde(default)]
    pub description: String,
    /// Cost of the first unit (> 0).
    pub base_cost: Decimal,
    /// Resource produced per second by one unit (>= 0).
    pub base_rate: Decimal,
}

/// What an upgrade multiplies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeTarget {
    /// A single generator.
    Generator(GeneratorId),
    /// Every generator.
    Global,
}

/// Ownership threshold that makes an upgrade available.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub generator: GeneratorId,
    pub count: u32,
}

/// A one-time purchase doubling the production of its target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpgradeDef {
    pub id: UpgradeId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub target: UpgradeTarget,
    /// Flat purchase cost (> 0).
    pub cost: Decimal,
    /// Prerequisite; `None` means always available.
    #[serde(default)]
    pub requires: Option<Requirement>,
    /// Whether the upgrade also doubles the manual action value.
    #[serde(default)]
    pub boosts_manual_action: bool,
}

impl UpgradeDef {
    /// True when this upgrade multiplies the given generator.
    pub fn targets(&self, generator: &GeneratorId) -> bool {
        match &self.target {
            UpgradeTarget::Generator(id) => id == generator,
            UpgradeTarget::Global => true,
        }
    }
}

/// Immutable catalog loaded once per process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Catalog {
    /// Generators in display order (unique IDs).
    pub generators: Vec<GeneratorDef>,
    /// Upgrades in display order (unique IDs).
    pub upgrades: Vec<UpgradeDef>,
    /// Resource added by one manual action before upgrades.
    pub manual_action_base: Decimal,
}

impl Catalog {
    /// The five generators and four upgrades the game ships with.
    pub fn standard() -> Self {
        let generator = |id: &str, name: &str, description: &str, cost: Decimal, rate: Decimal| {
            GeneratorDef {
                id: GeneratorId::new(id),
                name: name.to_string(),
                description: description.to_string(),
                base_cost: cost,
                base_rate: rate,
            }
        };
        let generators = vec![
            generator(
                "cursor",
                "Cursor",
                "Autoclicks once every 10 seconds.",
                Decimal::new(15, 0),
                Decimal::new(1, 1),
            ),
            generator(
                "grandma",
                "Grandma",
                "A nice grandma to bake more cookies.",
                Decimal::new(100, 0),
                Decimal::new(1, 0),
            ),
            generator(
                "farm",
                "Farm",
                "Grows cookie plants from cookie seeds.",
                Decimal::new(1_100, 0),
                Decimal::new(8, 0),
            ),
            generator(
                "mine",
                "Mine",
                "Mines out cookie dough and chocolate chips.",
                Decimal::new(12_000, 0),
                Decimal::new(47, 0),
            ),
            generator(
                "factory",
                "Factory",
                "Produces large quantities of cookies.",
                Decimal::new(130_000, 0),
                Decimal::new(260, 0),
            ),
        ];

        let up = |id: u32, name: &str, target: &str, cost: i64, needs: u32, manual: bool| {
            let target = GeneratorId::new(target);
            UpgradeDef {
                id: UpgradeId(id),
                name: name.to_string(),
                description: format!("{}s are twice as efficient.", capitalize(target.as_str())),
                target: UpgradeTarget::Generator(target.clone()),
                cost: Decimal::new(cost, 0),
                requires: Some(Requirement {
                    generator: target,
                    count: needs,
                }),
                boosts_manual_action: manual,
            }
        };
        let upgrades = vec![
            up(1, "Reinforced index finger", "cursor", 100, 1, true),
            up(2, "Forwards from grandma", "grandma", 500, 1, false),
            up(3, "Steel-plated rolling pins", "grandma", 5_000, 5, false),
            up(4, "Lubricated dentures", "grandma", 50_000, 25, false),
        ];

        Self {
            generators,
            upgrades,
            manual_action_base: Decimal::ONE,
        }
    }

    /// Parse and validate a catalog from JSON.
    pub fn from_json_str(text: &str) -> Result<Self, ValidationError> {
        let catalog: Catalog =
            serde_json::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        validate_catalog(&catalog)?;
        Ok(catalog)
    }

    pub fn generator(&self, id: &GeneratorId) -> Option<&GeneratorDef> {
        self.generators.iter().find(|g| &g.id == id)
    }

    pub fn upgrade(&self, id: UpgradeId) -> Option<&UpgradeDef> {
        self.upgrades.iter().find(|u| u.id == id)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Authoritative progression state as returned by the remote authority.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Spendable resource (>= 0).
    pub balance: Decimal,
    /// Resource earned over the lifetime of the save (>= 0).
    pub total_earned: Decimal,
    /// Owned units per generator; absent means zero.
    #[serde(default)]
    pub owned: BTreeMap<GeneratorId, u32>,
    /// Applied upgrades.
    #[serde(default)]
    pub upgrades: BTreeSet<UpgradeId>,
    /// Time of the last successful save, if the authority reports one.
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    /// Manual actions accepted over the lifetime of the save.
    #[serde(default)]
    pub total_clicks: u64,
}

impl Snapshot {
    pub fn owned_count(&self, id: &GeneratorId) -> u32 {
        self.owned.get(id).copied().unwrap_or(0)
    }
}

/// Random per-session identifier, part of every request identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

/// Identity of one remote request. A retry reuses the same id so the
/// authority can recognise it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    pub session: SessionId,
    pub seq: u64,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}/{}", self.session.0, self.seq)
    }
}

/// Balance-affecting player action. Carries what was asked for, never a
/// client-computed result.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "target")]
pub enum Action {
    ManualAction,
    PurchaseGenerator(GeneratorId),
    PurchaseUpgrade(UpgradeId),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::ManualAction => f.write_str("manual action"),
            Action::PurchaseGenerator(id) => write!(f, "purchase {}", id),
            Action::PurchaseUpgrade(id) => write!(f, "upgrade {}", id),
        }
    }
}

/// Sequence numbers of one session the authority has processed, accepted
/// or rejected. Everything up to `through` plus the stragglers in `beyond`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqWindow {
    pub through: u64,
    #[serde(default)]
    pub beyond: BTreeSet<u64>,
}

impl SeqWindow {
    pub fn contains(&self, seq: u64) -> bool {
        seq <= self.through || self.beyond.contains(&seq)
    }

    pub fn insert(&mut self, seq: u64) {
        if self.contains(seq) {
            return;
        }
        self.beyond.insert(seq);
        while self.beyond.remove(&(self.through + 1)) {
            self.through += 1;
        }
    }
}

/// Request submitting an [`Action`] to the authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: RequestId,
    pub action: Action,
}

/// Explicit save. `accrued_total` is the cumulative passive income the
/// session has produced locally; the authority credits only what exceeds the
/// last watermark it saw for this session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistRequest {
    pub id: RequestId,
    pub accrued_total: Decimal,
}

/// Authority reply to an accepted request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub snapshot: Snapshot,
    /// Ledger revision, bumped by the authority on every change it applies.
    /// Answers can arrive in any order; the higher revision is the newer state.
    #[serde(default)]
    pub revision: u64,
    /// Highest `accrued_total` the authority has credited for the requesting
    /// session. Already included in `snapshot.balance`.
    #[serde(default)]
    pub acknowledged: Decimal,
    /// Requests of the requesting session already reflected in `snapshot`.
    #[serde(default)]
    pub processed: SeqWindow,
}

/// Structured rejection code returned by the authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("upgrade already applied")]
    AlreadyApplied,
    #[error("upgrade not available")]
    NotAvailable,
    #[error("unknown target")]
    UnknownTarget,
    #[error("{0}")]
    Other(String),
}

/// Validation errors for catalog and snapshot invariants.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    /// Two generators share an ID.
    #[error("duplicate generator id: {0}")]
    DuplicateGenerator(String),
    /// Two upgrades share an ID.
    #[error("duplicate upgrade id: {0}")]
    DuplicateUpgrade(u32),
    /// Costs must be strictly positive.
    #[error("cost must be > 0 for {0}")]
    NonPositiveCost(String),
    /// Balances and rates must be non-negative.
    #[error("negative amount is invalid")]
    NegativeAmount,
    /// Reference to a generator missing from the catalog.
    #[error("unknown generator: {0}")]
    UnknownGenerator(String),
    /// Reference to an upgrade missing from the catalog.
    #[error("unknown upgrade: {0}")]
    UnknownUpgrade(u32),
    /// Input could not be parsed.
    #[error("malformed catalog: {0}")]
    Malformed(String),
}

/// Validate a catalog, including cross-references from upgrades to generators.
pub fn validate_catalog(catalog: &Catalog) -> Result<(), ValidationError> {
    if catalog.manual_action_base <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveCost("manual action".to_string()));
    }
    let mut ids: BTreeSet<&GeneratorId> = BTreeSet::new();
    for g in &catalog.generators {
        if !ids.insert(&g.id) {
            return Err(ValidationError::DuplicateGenerator(g.id.0.clone()));
        }
        if g.base_cost <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveCost(g.id.0.clone()));
        }
        if g.base_rate < Decimal::ZERO {
            return Err(ValidationError::NegativeAmount);
        }
    }
    let mut upgrade_ids: BTreeSet<UpgradeId> = BTreeSet::new();
    for u in &catalog.upgrades {
        if !upgrade_ids.insert(u.id) {
            return Err(ValidationError::DuplicateUpgrade(u.id.0));
        }
        if u.cost <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveCost(u.name.clone()));
        }
        if let UpgradeTarget::Generator(target) = &u.target {
            if !ids.contains(target) {
                return Err(ValidationError::UnknownGenerator(target.0.clone()));
            }
        }
        if let Some(req) = &u.requires {
            if !ids.contains(&req.generator) {
                return Err(ValidationError::UnknownGenerator(req.generator.0.clone()));
            }
        }
    }
    Ok(())
}

/// Validate a snapshot against the catalog it claims to describe.
pub fn validate_snapshot(catalog: &Catalog, snapshot: &Snapshot) -> Result<(), ValidationError> {
    if snapshot.balance < Decimal::ZERO || snapshot.total_earned < Decimal::ZERO {
        return Err(ValidationError::NegativeAmount);
    }
    for id in snapshot.owned.keys() {
        if catalog.generator(id).is_none() {
            return Err(ValidationError::UnknownGenerator(id.0.clone()));
        }
    }
    for id in &snapshot.upgrades {
        if catalog.upgrade(*id).is_none() {
            return Err(ValidationError::UnknownUpgrade(id.0));
        }
    }
    Ok(())
}

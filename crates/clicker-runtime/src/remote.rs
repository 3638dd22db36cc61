//! The remote authority seam and two in-process implementations.
//!
//! The real game talks HTTP+JSON to its backend; that transport lives behind
//! [`RemoteAuthority`] and is not part of this crate. [`LocalAuthority`]
//! reproduces the backend rules for the CLI and tests, and [`FlakyAuthority`]
//! wraps any authority with seeded latency and transport loss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clicker_core::{
    Action, ActionRequest, Catalog, PersistRequest, Receipt, RejectReason, RequestId, SeqWindow,
    SessionId, Snapshot, UpgradeId,
};
use clicker_econ as econ;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::RemoteError;

/// Authoritative source of progression state.
///
/// Implementations must treat a repeated [`RequestId`] as the same request:
/// applying it at most once and answering consistently.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Current state for a new session.
    async fn fetch_snapshot(&self, session: SessionId) -> Result<Snapshot, RemoteError>;

    /// Apply a player action, recomputing its effect authoritatively.
    async fn submit(&self, request: ActionRequest) -> Result<Receipt, RemoteError>;

    /// Upgrades the authority currently considers purchasable.
    async fn available_upgrades(&self, session: SessionId) -> Result<Vec<UpgradeId>, RemoteError>;

    /// Save, crediting passive income above the session's last watermark.
    async fn persist(&self, request: PersistRequest) -> Result<Receipt, RemoteError>;
}

#[async_trait]
impl<T: RemoteAuthority + ?Sized> RemoteAuthority for Arc<T> {
    async fn fetch_snapshot(&self, session: SessionId) -> Result<Snapshot, RemoteError> {
        (**self).fetch_snapshot(session).await
    }

    async fn submit(&self, request: ActionRequest) -> Result<Receipt, RemoteError> {
        (**self).submit(request).await
    }

    async fn available_upgrades(&self, session: SessionId) -> Result<Vec<UpgradeId>, RemoteError> {
        (**self).available_upgrades(session).await
    }

    async fn persist(&self, request: PersistRequest) -> Result<Receipt, RemoteError> {
        (**self).persist(request).await
    }
}

#[derive(Debug, Default)]
struct Ledger {
    snapshot: Snapshot,
    /// Outcome of every request seen, keyed by id. `None` means accepted.
    seen: HashMap<RequestId, Option<RejectReason>>,
    watermarks: HashMap<SessionId, Decimal>,
    processed: HashMap<SessionId, SeqWindow>,
    revision: u64,
}

impl Ledger {
    fn receipt(&self, session: SessionId) -> Receipt {
        Receipt {
            snapshot: self.snapshot.clone(),
            acknowledged: self.watermarks.get(&session).copied().unwrap_or_default(),
            processed: self.processed.get(&session).cloned().unwrap_or_default(),
            revision: self.revision,
        }
    }

    fn mark_processed(&mut self, id: RequestId) {
        self.processed.entry(id.session).or_default().insert(id.seq);
    }

    fn credit(&mut self, amount: Decimal) {
        self.snapshot.balance = self.snapshot.balance.saturating_add(amount);
        self.snapshot.total_earned = self.snapshot.total_earned.saturating_add(amount);
    }

    fn apply(&mut self, catalog: &Catalog, action: &Action) -> Result<(), RejectReason> {
        let s = &mut self.snapshot;
        match action {
            Action::ManualAction => {
                let value = econ::manual_action_value(catalog, &s.upgrades)
                    .map_err(|e| RejectReason::Other(e.to_string()))?;
                self.credit(value);
                self.snapshot.total_clicks = self.snapshot.total_clicks.saturating_add(1);
            }
            Action::PurchaseGenerator(id) => {
                if catalog.generator(id).is_none() {
                    return Err(RejectReason::UnknownTarget);
                }
                let cost = econ::purchase_cost(catalog, id, s.owned_count(id))
                    .map_err(|_| RejectReason::InsufficientFunds)?;
                if s.balance < cost {
                    return Err(RejectReason::InsufficientFunds);
                }
                s.balance -= cost;
                *s.owned.entry(id.clone()).or_insert(0) += 1;
            }
            Action::PurchaseUpgrade(id) => {
                let def = catalog.upgrade(*id).ok_or(RejectReason::UnknownTarget)?;
                if s.upgrades.contains(id) {
                    return Err(RejectReason::AlreadyApplied);
                }
                if !econ::requirement_met(def, &s.owned) {
                    return Err(RejectReason::NotAvailable);
                }
                if s.balance < def.cost {
                    return Err(RejectReason::InsufficientFunds);
                }
                s.balance -= def.cost;
                s.upgrades.insert(*id);
            }
        }
        Ok(())
    }
}

/// In-process authority applying the same economy rules as the client.
pub struct LocalAuthority {
    catalog: Arc<Catalog>,
    ledger: Mutex<Ledger>,
}

impl LocalAuthority {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self::with_snapshot(catalog, Snapshot::default())
    }

    pub fn with_snapshot(catalog: Arc<Catalog>, snapshot: Snapshot) -> Self {
        Self {
            catalog,
            ledger: Mutex::new(Ledger {
                snapshot,
                ..Ledger::default()
            }),
        }
    }

    /// Copy of the authoritative state.
    pub async fn snapshot(&self) -> Snapshot {
        self.ledger.lock().await.snapshot.clone()
    }

    /// Overwrite the authoritative state, as another device would.
    pub async fn overwrite(&self, snapshot: Snapshot) {
        let mut ledger = self.ledger.lock().await;
        ledger.snapshot = snapshot;
        ledger.revision += 1;
    }
}

#[async_trait]
impl RemoteAuthority for LocalAuthority {
    async fn fetch_snapshot(&self, session: SessionId) -> Result<Snapshot, RemoteError> {
        let ledger = self.ledger.lock().await;
        debug!(session = session.0, "snapshot fetched");
        Ok(ledger.snapshot.clone())
    }

    async fn submit(&self, request: ActionRequest) -> Result<Receipt, RemoteError> {
        let mut ledger = self.ledger.lock().await;
        let previous = ledger.seen.get(&request.id).cloned();
        let outcome = match previous {
            Some(previous) => {
                debug!(id = %request.id, "duplicate request");
                previous
            }
            None => {
                let outcome = ledger.apply(&self.catalog, &request.action).err();
                if outcome.is_none() {
                    ledger.revision += 1;
                }
                ledger.seen.insert(request.id, outcome.clone());
                ledger.mark_processed(request.id);
                outcome
            }
        };
        match outcome {
            None => Ok(ledger.receipt(request.id.session)),
            Some(reason) => Err(RemoteError::Rejected(reason)),
        }
    }

    async fn available_upgrades(&self, _session: SessionId) -> Result<Vec<UpgradeId>, RemoteError> {
        let ledger = self.ledger.lock().await;
        Ok(
            econ::available_upgrades(&self.catalog, &ledger.snapshot.owned, &ledger.snapshot.upgrades)
                .into_iter()
                .map(|u| u.id)
                .collect(),
        )
    }

    async fn persist(&self, request: PersistRequest) -> Result<Receipt, RemoteError> {
        if request.accrued_total < Decimal::ZERO {
            return Err(RemoteError::Rejected(RejectReason::Other(
                "negative accrual".to_string(),
            )));
        }
        let mut ledger = self.ledger.lock().await;
        let session = request.id.session;
        let watermark = ledger.watermarks.get(&session).copied().unwrap_or_default();
        let excess = request.accrued_total - watermark;
        if excess > Decimal::ZERO {
            ledger.credit(excess);
            ledger.watermarks.insert(session, request.accrued_total);
        }
        ledger.snapshot.saved_at = Some(Utc::now());
        ledger.mark_processed(request.id);
        ledger.revision += 1;
        info!(id = %request.id, credited = %excess.max(Decimal::ZERO), "saved");
        Ok(ledger.receipt(session))
    }
}

/// Fault rates for [`FlakyAuthority`]. Probabilities are clamped to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultProfile {
    /// Upper bound of the uniform per-call latency.
    pub max_latency: Duration,
    /// Request never reaches the authority.
    pub request_loss: f64,
    /// Authority applies the request but the answer is lost.
    pub response_loss: f64,
    /// Answer is delayed by `stall` on top of the latency.
    pub stall_rate: f64,
    pub stall: Duration,
}

impl Default for FaultProfile {
    fn default() -> Self {
        Self {
            max_latency: Duration::from_millis(250),
            request_loss: 0.05,
            response_loss: 0.05,
            stall_rate: 0.02,
            stall: Duration::from_secs(10),
        }
    }
}

/// Wraps an authority with deterministic, seeded transport faults.
pub struct FlakyAuthority<A> {
    inner: A,
    profile: FaultProfile,
    rng: StdMutex<ChaCha8Rng>,
}

enum Fate {
    Lost,
    Deliver { latency: Duration, drop_answer: bool },
}

impl<A: RemoteAuthority> FlakyAuthority<A> {
    pub fn new(inner: A, profile: FaultProfile, seed: u64) -> Self {
        let clamp = |p: f64| if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
        Self {
            inner,
            profile: FaultProfile {
                request_loss: clamp(profile.request_loss),
                response_loss: clamp(profile.response_loss),
                stall_rate: clamp(profile.stall_rate),
                ..profile
            },
            rng: StdMutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    fn roll(&self) -> Fate {
        // A poisoned lock only means another caller panicked mid-roll.
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let p = &self.profile;
        let max_ms = u64::try_from(p.max_latency.as_millis()).unwrap_or(u64::MAX);
        let mut latency = Duration::from_millis(rng.gen_range(0..=max_ms));
        if rng.gen_bool(p.stall_rate) {
            latency += p.stall;
        }
        if rng.gen_bool(p.request_loss) {
            return Fate::Lost;
        }
        Fate::Deliver {
            latency,
            drop_answer: rng.gen_bool(p.response_loss),
        }
    }

    async fn call<T, F>(&self, what: &'static str, fut: F) -> Result<T, RemoteError>
    where
        F: std::future::Future<Output = Result<T, RemoteError>> + Send,
        T: Send,
    {
        match self.roll() {
            Fate::Lost => {
                debug!(what, "request lost");
                Err(RemoteError::Unreachable("connection reset".to_string()))
            }
            Fate::Deliver {
                latency,
                drop_answer,
            } => {
                tokio::time::sleep(latency).await;
                let answer = fut.await;
                if drop_answer {
                    debug!(what, "response lost");
                    return Err(RemoteError::Unreachable("response lost".to_string()));
                }
                answer
            }
        }
    }
}

#[async_trait]
impl<A: RemoteAuthority> RemoteAuthority for FlakyAuthority<A> {
    async fn fetch_snapshot(&self, session: SessionId) -> Result<Snapshot, RemoteError> {
        self.call("fetch", self.inner.fetch_snapshot(session)).await
    }

    async fn submit(&self, request: ActionRequest) -> Result<Receipt, RemoteError> {
        self.call("submit", self.inner.submit(request)).await
    }

    async fn available_upgrades(&self, session: SessionId) -> Result<Vec<UpgradeId>, RemoteError> {
        self.call("upgrades", self.inner.available_upgrades(session))
            .await
    }

    async fn persist(&self, request: PersistRequest) -> Result<Receipt, RemoteError> {
        self.call("persist", self.inner.persist(request)).await
    }
}

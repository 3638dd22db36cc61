//! Reconciliation of optimistic local actions against the remote authority.
//!
//! [`SyncEngine`] is a pure state machine: it never performs I/O. The session
//! worker feeds it issued requests and remote outcomes, and executes the
//! dispatches and resolutions it hands back in [`Step`].
//!
//! Rules enforced here:
//! - every request gets a sequence number at issue time and keeps it across
//!   retries;
//! - per [`Lane`], at most one request is in flight and later ones queue
//!   behind it in issue order;
//! - a spend waits until every earlier manual action has settled, so the
//!   authority has seen the credit the local decision relied on;
//! - a persist is a barrier: it is dispatched only once every earlier request
//!   has settled, and nothing issued after it is dispatched until it settles;
//! - outcomes are resolved strictly in issue order, so a late answer for
//!   request 1 holds back an early answer for request 2.

use std::collections::BTreeMap;
use std::sync::Arc;

use clicker_core::{
    validate_snapshot, Action, ActionRequest, Catalog, PersistRequest, Receipt, RejectReason,
    RequestId, SessionId,
};
use rust_decimal::Decimal;
use tracing::{debug, error, warn};

use crate::error::SyncError;

/// Serialization domain for in-flight requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Requests for the same action and target share a lane.
    Action(Action),
    Persist,
}

/// Request ready to be sent to the authority.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Action(ActionRequest),
    Persist(PersistRequest),
}

impl Outbound {
    pub fn id(&self) -> RequestId {
        match self {
            Outbound::Action(r) => r.id,
            Outbound::Persist(r) => r.id,
        }
    }

    pub fn lane(&self) -> Lane {
        match self {
            Outbound::Action(r) => Lane::Action(r.action.clone()),
            Outbound::Persist(_) => Lane::Persist,
        }
    }
}

/// One attempt to hand to the transport. `attempt` starts at 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub request: Outbound,
    pub attempt: u32,
}

/// What came back from a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Confirmed(Receipt),
    Rejected(RejectReason),
    TimedOut,
    Unreachable(String),
}

/// Settled request, emitted in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The authority accepted the action; its receipt replaces local state.
    Confirmed {
        id: RequestId,
        action: Action,
        receipt: Receipt,
    },
    /// The action failed for good; local state goes back to
    /// [`SyncEngine::last_confirmed`].
    Rejected {
        id: RequestId,
        action: Action,
        error: SyncError,
    },
    Persisted {
        id: RequestId,
        accrued_total: Decimal,
        receipt: Receipt,
    },
    /// Logged and dropped. The next persist carries the same watermark again.
    PersistFailed { id: RequestId, error: SyncError },
}

/// Output of one engine transition.
#[derive(Debug, Default, PartialEq)]
pub struct Step {
    pub dispatch: Vec<Dispatch>,
    pub resolutions: Vec<Resolution>,
}

/// Observable state of an unresolved request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    InFlight { attempt: u32 },
    /// Settled but waiting for an earlier request to resolve first.
    Buffered,
}

#[derive(Debug)]
enum Phase {
    Queued,
    InFlight,
    Settled(Result<Receipt, SyncError>),
}

#[derive(Debug)]
struct Entry {
    request: Outbound,
    attempts: u32,
    phase: Phase,
}

pub struct SyncEngine {
    session: SessionId,
    catalog: Arc<Catalog>,
    max_attempts: u32,
    next_seq: u64,
    entries: BTreeMap<u64, Entry>,
    last_confirmed: Receipt,
}

impl SyncEngine {
    pub fn new(
        session: SessionId,
        catalog: Arc<Catalog>,
        initial: Receipt,
        max_attempts: u32,
    ) -> Self {
        Self {
            session,
            catalog,
            max_attempts: max_attempts.max(1),
            next_seq: 1,
            entries: BTreeMap::new(),
            last_confirmed: initial,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Newest receipt accepted from the authority.
    pub fn last_confirmed(&self) -> &Receipt {
        &self.last_confirmed
    }

    /// Number of unresolved requests.
    pub fn outstanding(&self) -> usize {
        self.entries.len()
    }

    pub fn is_idle(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, id: RequestId) -> Option<RequestState> {
        if id.session != self.session {
            return None;
        }
        self.entries.get(&id.seq).map(|e| match e.phase {
            Phase::Queued => RequestState::Queued,
            Phase::InFlight => RequestState::InFlight {
                attempt: e.attempts,
            },
            Phase::Settled(_) => RequestState::Buffered,
        })
    }

    /// Actions not yet resolved and not already reflected in
    /// [`Self::last_confirmed`], in issue order. These are the optimistic
    /// changes to replay on top of that receipt.
    pub fn pending_actions(&self) -> impl Iterator<Item = &Action> + '_ {
        let processed = &self.last_confirmed.processed;
        self.entries
            .iter()
            .filter(move |(seq, _)| !processed.contains(**seq))
            .filter_map(|(_, e)| match &e.request {
                Outbound::Action(r) => Some(&r.action),
                Outbound::Persist(_) => None,
            })
    }

    fn next_id(&mut self) -> RequestId {
        let id = RequestId {
            session: self.session,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        id
    }

    /// Queue an action that has already been applied locally.
    pub fn issue(&mut self, action: Action) -> (RequestId, Step) {
        let id = self.next_id();
        debug!(%id, %action, "issue");
        self.entries.insert(
            id.seq,
            Entry {
                request: Outbound::Action(ActionRequest { id, action }),
                attempts: 0,
                phase: Phase::Queued,
            },
        );
        (id, self.pump())
    }

    /// Queue a persist of `accrued_total`. A persist that is still queued
    /// picks up the newer watermark instead of a second one being added.
    pub fn request_persist(&mut self, accrued_total: Decimal) -> (RequestId, Step) {
        let queued = self.entries.iter_mut().find_map(|(_, e)| match (&mut e.request, &e.phase) {
            (Outbound::Persist(r), Phase::Queued) => Some(r),
            _ => None,
        });
        if let Some(r) = queued {
            r.accrued_total = r.accrued_total.max(accrued_total);
            let id = r.id;
            debug!(%id, %accrued_total, "persist coalesced");
            return (id, self.pump());
        }
        let id = self.next_id();
        debug!(%id, %accrued_total, "persist");
        self.entries.insert(
            id.seq,
            Entry {
                request: Outbound::Persist(PersistRequest { id, accrued_total }),
                attempts: 0,
                phase: Phase::Queued,
            },
        );
        (id, self.pump())
    }

    /// Move queued requests in flight where the lane and barrier rules allow.
    fn pump(&mut self) -> Step {
        let mut busy: Vec<Lane> = Vec::new();
        let mut all_settled = true;
        let mut credit_pending = false;
        let mut dispatch = Vec::new();
        for entry in self.entries.values_mut() {
            if matches!(entry.phase, Phase::Settled(_)) {
                continue;
            }
            let lane = entry.request.lane();
            if matches!(entry.phase, Phase::Queued) {
                let ready = match &lane {
                    Lane::Persist => all_settled,
                    Lane::Action(Action::ManualAction) => !busy.contains(&lane),
                    Lane::Action(_) => !busy.contains(&lane) && !credit_pending,
                };
                if ready {
                    entry.phase = Phase::InFlight;
                    entry.attempts = 1;
                    dispatch.push(Dispatch {
                        request: entry.request.clone(),
                        attempt: 1,
                    });
                }
            }
            match lane {
                Lane::Persist => break,
                Lane::Action(Action::ManualAction) => credit_pending = true,
                Lane::Action(_) => {}
            }
            busy.push(lane);
            all_settled = false;
        }
        Step {
            dispatch,
            resolutions: Vec::new(),
        }
    }

    /// Record the outcome of `attempt` for request `id`.
    pub fn complete(&mut self, id: RequestId, attempt: u32, outcome: AttemptOutcome) -> Step {
        if id.session != self.session {
            debug!(%id, "completion for another session ignored");
            return Step::default();
        }
        let max_attempts = self.max_attempts;
        let Some(entry) = self.entries.get_mut(&id.seq) else {
            debug!(%id, "completion for unknown request ignored");
            return Step::default();
        };
        if !matches!(entry.phase, Phase::InFlight) || entry.attempts != attempt {
            debug!(%id, attempt, "stale completion ignored");
            return Step::default();
        }
        let is_persist = matches!(entry.request, Outbound::Persist(_));

        let settled = match outcome {
            AttemptOutcome::Confirmed(receipt) => {
                match validate_snapshot(&self.catalog, &receipt.snapshot) {
                    Ok(()) => Ok(receipt),
                    Err(e) => {
                        error!(%id, error = %e, "authority sent an invalid snapshot");
                        Err(SyncError::InvalidSnapshot(e.to_string()))
                    }
                }
            }
            AttemptOutcome::Rejected(reason) => {
                warn!(%id, %reason, "rejected by authority");
                Err(SyncError::RemoteRejected(reason))
            }
            AttemptOutcome::TimedOut | AttemptOutcome::Unreachable(_)
                if !is_persist && entry.attempts < max_attempts =>
            {
                entry.attempts += 1;
                warn!(%id, attempt = entry.attempts, "retrying");
                return Step {
                    dispatch: vec![Dispatch {
                        request: entry.request.clone(),
                        attempt: entry.attempts,
                    }],
                    resolutions: Vec::new(),
                };
            }
            AttemptOutcome::TimedOut => {
                warn!(%id, "gave up after timeout");
                Err(SyncError::RemoteTimeout)
            }
            AttemptOutcome::Unreachable(msg) => {
                warn!(%id, error = %msg, "gave up, authority unreachable");
                Err(SyncError::RemoteUnreachable(msg))
            }
        };
        entry.phase = Phase::Settled(settled);

        let resolutions = self.drain();
        let mut step = self.pump();
        step.resolutions = resolutions;
        step
    }

    fn adopt(&mut self, receipt: &Receipt) {
        if receipt.revision >= self.last_confirmed.revision {
            self.last_confirmed = receipt.clone();
        } else {
            debug!(
                revision = receipt.revision,
                current = self.last_confirmed.revision,
                "older receipt not adopted"
            );
        }
    }

    /// Pop settled requests from the front of the queue, in issue order.
    fn drain(&mut self) -> Vec<Resolution> {
        let mut out = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if !matches!(entry.get().phase, Phase::Settled(_)) {
                break;
            }
            let Entry { request, phase, .. } = entry.remove();
            let Phase::Settled(result) = phase else {
                unreachable!("checked above");
            };
            let resolution = match (request, result) {
                (Outbound::Action(r), Ok(receipt)) => {
                    debug!(id = %r.id, revision = receipt.revision, "confirmed");
                    self.adopt(&receipt);
                    Resolution::Confirmed {
                        id: r.id,
                        action: r.action,
                        receipt,
                    }
                }
                // Bought elsewhere: the authority already holds the result.
                (
                    Outbound::Action(ActionRequest {
                        id,
                        action: Action::PurchaseUpgrade(upgrade),
                    }),
                    Err(SyncError::RemoteRejected(RejectReason::AlreadyApplied)),
                ) => {
                    debug!(%id, %upgrade, "upgrade already applied by the authority");
                    let mut receipt = self.last_confirmed.clone();
                    receipt.snapshot.upgrades.insert(upgrade);
                    receipt.processed.insert(id.seq);
                    self.adopt(&receipt);
                    Resolution::Confirmed {
                        id,
                        action: Action::PurchaseUpgrade(upgrade),
                        receipt,
                    }
                }
                (Outbound::Action(r), Err(error)) => Resolution::Rejected {
                    id: r.id,
                    action: r.action,
                    error,
                },
                (Outbound::Persist(r), Ok(receipt)) => {
                    self.adopt(&receipt);
                    Resolution::Persisted {
                        id: r.id,
                        accrued_total: r.accrued_total,
                        receipt,
                    }
                }
                (Outbound::Persist(r), Err(error)) => {
                    warn!(id = %r.id, %error, "persist failed");
                    Resolution::PersistFailed { id: r.id, error }
                }
            };
            out.push(resolution);
        }
        out
    }
}

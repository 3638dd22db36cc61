//! Session worker and the handle used to drive it.
//!
//! One worker task owns the [`ProgressionState`] and the [`SyncEngine`] of a
//! session. Player actions, timer fires and remote completions all arrive on
//! channels and are processed one at a time, so no operation ever observes a
//! half-applied mutation. Remote calls run in their own tasks and report back
//! on a completion channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clicker_core::{Action, Catalog, GeneratorId, Receipt, RequestId, SessionId, UpgradeId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{FailureKind, RemoteError, SessionError, SyncError};
use crate::remote::RemoteAuthority;
use crate::scheduler::PersistenceScheduler;
use crate::state::{GeneratorView, ProgressionState, Purchase, UpgradeView};
use crate::sync::{AttemptOutcome, Dispatch, Outbound, Resolution, Step, SyncEngine};

/// Session timing and buffering. Durations are in milliseconds so the
/// struct reads naturally from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tick_interval_ms: u64,
    /// `None` disables autosave; teardown still persists.
    pub autosave_interval_ms: Option<u64>,
    pub request_timeout_ms: u64,
    /// Attempts per action request, including the first.
    pub max_attempts: u32,
    pub shutdown_grace_ms: u64,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            autosave_interval_ms: Some(30_000),
            request_timeout_ms: 5_000,
            max_attempts: 2,
            shutdown_grace_ms: 5_000,
            command_buffer: 64,
            event_buffer: 128,
        }
    }
}

impl SessionConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn autosave_interval(&self) -> Option<Duration> {
        self.autosave_interval_ms
            .map(|ms| Duration::from_millis(ms.max(1)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Local effect of an accepted action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Effect {
    Credited { amount: Decimal },
    Purchased(Purchase),
    Upgraded { upgrade: UpgradeId },
}

/// An action applied optimistically and sent to the authority as `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Applied {
    pub id: RequestId,
    pub effect: Effect,
}

/// Everything the UI shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session: SessionId,
    pub balance: Decimal,
    pub total_earned: Decimal,
    pub production_rate: Decimal,
    pub manual_action_value: Decimal,
    /// Lifetime manual actions, including ones still awaiting confirmation.
    pub total_clicks: u64,
    pub generators: Vec<GeneratorView>,
    pub upgrades: Vec<UpgradeView>,
    pub pending_requests: usize,
    pub last_saved: Option<DateTime<Utc>>,
}

impl SessionView {
    pub fn generator(&self, id: &str) -> Option<&GeneratorView> {
        self.generators.iter().find(|g| g.id.as_str() == id)
    }

    pub fn upgrade(&self, id: UpgradeId) -> Option<&UpgradeView> {
        self.upgrades.iter().find(|u| u.id == id)
    }
}

/// Remote outcomes, published in request order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Confirmed {
        id: RequestId,
        action: Action,
    },
    /// Transient, dismissable failure. Local state has been rolled back.
    Rejected {
        id: RequestId,
        action: Action,
        kind: FailureKind,
        error: SyncError,
    },
    Persisted {
        id: RequestId,
        saved_at: Option<DateTime<Utc>>,
    },
    PersistFailed {
        id: RequestId,
        error: SyncError,
    },
}

/// Summary returned once a session has been torn down.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub session: SessionId,
    pub final_persist: RequestId,
    /// Whether the final persist was acknowledged within the grace period.
    pub persisted: bool,
    /// Requests still unresolved when the grace period ran out.
    pub abandoned: usize,
    pub balance: Decimal,
    pub total_earned: Decimal,
}

pub(crate) enum Command {
    Act {
        action: Action,
        reply: oneshot::Sender<Result<Applied, SessionError>>,
    },
    View {
        reply: oneshot::Sender<SessionView>,
    },
    PersistNow {
        reply: oneshot::Sender<RequestId>,
    },
    VisibilityLost {
        reply: oneshot::Sender<RequestId>,
    },
    Settle {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<ShutdownReport>,
    },
    Tick,
    Autosave,
}

struct Completion {
    id: RequestId,
    attempt: u32,
    outcome: AttemptOutcome,
}

struct SessionWorker {
    state: ProgressionState,
    engine: SyncEngine,
    remote: Arc<dyn RemoteAuthority>,
    config: SessionConfig,
    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    events: broadcast::Sender<SessionEvent>,
    scheduler: PersistenceScheduler,
    last_tick: Instant,
    /// Cumulative passive income produced by this session.
    accrued: Decimal,
    /// Highest watermark handed to the engine so far.
    watermark_requested: Decimal,
    last_saved: Option<DateTime<Utc>>,
    last_persisted: Option<RequestId>,
    settle_waiters: Vec<oneshot::Sender<()>>,
}

impl SessionWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(done) = self.completions_rx.recv() => self.on_completion(done),
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        let report = self.shutdown().await;
                        if reply.send(report).is_err() {
                            debug!("shutdown reply dropped");
                        }
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Act { action, reply } => {
                let result = self.act(action);
                if reply.send(result).is_err() {
                    debug!("act reply dropped");
                }
            }
            Command::View { reply } => {
                if reply.send(self.view()).is_err() {
                    debug!("view reply dropped");
                }
            }
            Command::PersistNow { reply } => {
                let id = self.persist();
                let _ = reply.send(id);
            }
            Command::VisibilityLost { reply } => {
                info!(session = %self.engine.session().0, "visibility lost, flushing");
                let id = self.persist();
                let _ = reply.send(id);
            }
            Command::Settle { reply } => {
                if self.engine.is_idle() {
                    let _ = reply.send(());
                } else {
                    self.settle_waiters.push(reply);
                }
            }
            Command::Tick => self.credit_elapsed(),
            Command::Autosave => {
                debug!("autosave");
                self.persist();
            }
            Command::Shutdown { .. } => unreachable!("handled by run loop"),
        }
    }

    fn act(&mut self, action: Action) -> Result<Applied, SessionError> {
        let spends = action != Action::ManualAction;
        if spends {
            self.credit_elapsed();
        }
        let effect = match &action {
            Action::ManualAction => Effect::Credited {
                amount: self.state.apply_manual_action(),
            },
            Action::PurchaseGenerator(id) => Effect::Purchased(self.state.purchase_generator(id)?),
            Action::PurchaseUpgrade(id) => {
                self.state.apply_upgrade(*id)?;
                Effect::Upgraded { upgrade: *id }
            }
        };
        // The authority must see the passive income this spend relies on.
        if spends && self.accrued > self.watermark_requested {
            self.persist();
        }
        let (id, step) = self.engine.issue(action);
        self.apply_step(step);
        Ok(Applied { id, effect })
    }

    /// Credit income for the real time elapsed since the last credit.
    ///
    /// Only whole milliseconds are credited; the remainder carries over to
    /// the next call instead of being dropped.
    fn credit_elapsed(&mut self) {
        let elapsed = Instant::now().saturating_duration_since(self.last_tick);
        let whole = Duration::from_millis(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        self.last_tick += whole;
        match self.state.tick(whole) {
            Ok(delta) => self.accrued = self.accrued.saturating_add(delta),
            Err(e) => warn!(error = %e, elapsed_ms = whole.as_millis() as u64, "tick not credited"),
        }
    }

    fn persist(&mut self) -> RequestId {
        self.credit_elapsed();
        self.watermark_requested = self.watermark_requested.max(self.accrued);
        let (id, step) = self.engine.request_persist(self.accrued);
        self.apply_step(step);
        id
    }

    fn view(&self) -> SessionView {
        SessionView {
            session: self.engine.session(),
            balance: self.state.balance(),
            total_earned: self.state.total_earned(),
            production_rate: self.state.production_rate(),
            manual_action_value: self.state.manual_action_value(),
            total_clicks: self.state.total_clicks(),
            generators: self.state.generator_views(),
            upgrades: self.state.upgrade_views(),
            pending_requests: self.engine.outstanding(),
            last_saved: self.last_saved,
        }
    }

    fn apply_step(&mut self, step: Step) {
        for dispatch in step.dispatch {
            self.dispatch(dispatch);
        }
        if step.resolutions.is_empty() {
            return;
        }
        let events: Vec<SessionEvent> = step
            .resolutions
            .into_iter()
            .map(|r| self.resolve(r))
            .collect();
        self.rebase();
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    fn dispatch(&self, dispatch: Dispatch) {
        let remote = Arc::clone(&self.remote);
        let tx = self.completions_tx.clone();
        let timeout = self.config.request_timeout();
        let Dispatch { request, attempt } = dispatch;
        let id = request.id();
        debug!(%id, attempt, "dispatch");
        tokio::spawn(async move {
            let result = match request {
                Outbound::Action(r) => time::timeout(timeout, remote.submit(r)).await,
                Outbound::Persist(r) => time::timeout(timeout, remote.persist(r)).await,
            };
            let outcome = match result {
                Err(_) => AttemptOutcome::TimedOut,
                Ok(Ok(receipt)) => AttemptOutcome::Confirmed(receipt),
                Ok(Err(RemoteError::Rejected(reason))) => AttemptOutcome::Rejected(reason),
                Ok(Err(RemoteError::Unreachable(msg))) => AttemptOutcome::Unreachable(msg),
            };
            // The worker may already be gone after shutdown.
            let _ = tx.send(Completion {
                id,
                attempt,
                outcome,
            });
        });
    }

    fn on_completion(&mut self, done: Completion) {
        let step = self.engine.complete(done.id, done.attempt, done.outcome);
        self.apply_step(step);
        if self.engine.is_idle() {
            for waiter in self.settle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn resolve(&mut self, resolution: Resolution) -> SessionEvent {
        match resolution {
            Resolution::Confirmed { id, action, .. } => SessionEvent::Confirmed { id, action },
            Resolution::Rejected { id, action, error } => {
                warn!(%id, %action, %error, "rolling back");
                SessionEvent::Rejected {
                    id,
                    action,
                    kind: error.kind(),
                    error,
                }
            }
            Resolution::Persisted {
                id,
                accrued_total,
                receipt,
            } => {
                info!(%id, %accrued_total, "persisted");
                self.last_saved = receipt.snapshot.saved_at.or(self.last_saved);
                self.last_persisted = Some(id);
                SessionEvent::Persisted {
                    id,
                    saved_at: receipt.snapshot.saved_at,
                }
            }
            Resolution::PersistFailed { id, error } => {
                self.watermark_requested = self.engine.last_confirmed().acknowledged;
                SessionEvent::PersistFailed { id, error }
            }
        }
    }

    /// Replace local state with the newest confirmed receipt, keep income the
    /// authority has not acknowledged, then replay unanswered actions the
    /// receipt does not already reflect.
    fn rebase(&mut self) {
        let receipt = self.engine.last_confirmed();
        let unsynced = (self.accrued - receipt.acknowledged).max(Decimal::ZERO);
        if let Err(e) = self.state.reconcile(&receipt.snapshot, unsynced) {
            error!(error = %e, "cannot adopt authority snapshot, keeping local state");
            return;
        }
        for action in self.engine.pending_actions() {
            if let Err(e) = self.state.apply(action) {
                debug!(%action, error = %e, "pending action no longer applies locally");
            }
        }
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        self.scheduler.stop().await;
        let final_persist = self.persist();
        let deadline = Instant::now() + self.config.shutdown_grace();
        while !self.engine.is_idle() {
            match time::timeout_at(deadline, self.completions_rx.recv()).await {
                Ok(Some(done)) => self.on_completion(done),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        outstanding = self.engine.outstanding(),
                        "grace period over, abandoning requests"
                    );
                    break;
                }
            }
        }
        for waiter in self.settle_waiters.drain(..) {
            let _ = waiter.send(());
        }
        let report = ShutdownReport {
            session: self.engine.session(),
            final_persist,
            persisted: self.last_persisted == Some(final_persist),
            abandoned: self.engine.outstanding(),
            balance: self.state.balance(),
            total_earned: self.state.total_earned(),
        };
        info!(
            session = %report.session.0,
            persisted = report.persisted,
            balance = %report.balance,
            "session closed"
        );
        report
    }
}

/// Cloneable front end of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    session: SessionId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    remote: Arc<dyn RemoteAuthority>,
    request_timeout: Duration,
}

impl SessionHandle {
    pub fn session(&self) -> SessionId {
        self.session
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Apply `action` locally and submit it to the authority.
    pub async fn act(&self, action: Action) -> Result<Applied, SessionError> {
        self.request(|reply| Command::Act { action, reply }).await?
    }

    pub async fn manual_action(&self) -> Result<Applied, SessionError> {
        self.act(Action::ManualAction).await
    }

    pub async fn purchase_generator(&self, id: &str) -> Result<Applied, SessionError> {
        self.act(Action::PurchaseGenerator(GeneratorId::new(id))).await
    }

    pub async fn purchase_upgrade(&self, id: UpgradeId) -> Result<Applied, SessionError> {
        self.act(Action::PurchaseUpgrade(id)).await
    }

    pub async fn view(&self) -> Result<SessionView, SessionError> {
        self.request(|reply| Command::View { reply }).await
    }

    /// Queue a save of everything earned so far.
    pub async fn persist_now(&self) -> Result<RequestId, SessionError> {
        self.request(|reply| Command::PersistNow { reply }).await
    }

    /// The client went to the background: credit elapsed time and save.
    pub async fn visibility_lost(&self) -> Result<RequestId, SessionError> {
        self.request(|reply| Command::VisibilityLost { reply }).await
    }

    /// Wait until no request is outstanding.
    pub async fn settle(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Settle { reply }).await
    }

    /// Ask the authority which upgrades it currently offers.
    pub async fn refresh_upgrades(&self) -> Result<Vec<UpgradeId>, SessionError> {
        match time::timeout(
            self.request_timeout,
            self.remote.available_upgrades(self.session),
        )
        .await
        {
            Err(_) => Err(SyncError::RemoteTimeout.into()),
            Ok(result) => result.map_err(|e| SessionError::Sync(e.into())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stop the timers, save and wait for outstanding requests.
    pub async fn shutdown(&self) -> Result<ShutdownReport, SessionError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

async fn fetch_initial(
    remote: &dyn RemoteAuthority,
    session: SessionId,
    config: &SessionConfig,
) -> Result<clicker_core::Snapshot, SyncError> {
    let mut attempt = 1;
    loop {
        let error = match time::timeout(config.request_timeout(), remote.fetch_snapshot(session)).await
        {
            Ok(Ok(snapshot)) => return Ok(snapshot),
            Ok(Err(RemoteError::Rejected(reason))) => return Err(SyncError::RemoteRejected(reason)),
            Ok(Err(RemoteError::Unreachable(msg))) => SyncError::RemoteUnreachable(msg),
            Err(_) => SyncError::RemoteTimeout,
        };
        if attempt >= config.max_attempts.max(1) {
            return Err(error);
        }
        warn!(attempt, %error, "snapshot fetch failed, retrying");
        attempt += 1;
    }
}

/// Open a session: fetch the authoritative snapshot, spawn the worker and
/// start the tick and autosave timers.
pub async fn start(
    catalog: Arc<Catalog>,
    remote: Arc<dyn RemoteAuthority>,
    config: SessionConfig,
) -> Result<SessionHandle, SessionError> {
    let session = SessionId(rand::random());
    let snapshot = fetch_initial(remote.as_ref(), session, &config).await?;
    let state = ProgressionState::from_snapshot(Arc::clone(&catalog), &snapshot)?;
    let last_saved = snapshot.saved_at;
    let engine = SyncEngine::new(
        session,
        catalog,
        Receipt {
            snapshot,
            ..Receipt::default()
        },
        config.max_attempts,
    );

    let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(config.event_buffer.max(1));
    let scheduler = PersistenceScheduler::start(
        config.tick_interval(),
        config.autosave_interval(),
        cmd_tx.downgrade(),
    );

    info!(
        session = %session.0,
        balance = %state.balance(),
        rate = %state.production_rate(),
        autosave = scheduler.autosave_enabled(),
        "session started"
    );

    let handle = SessionHandle {
        session,
        commands: cmd_tx,
        events: events.clone(),
        remote: Arc::clone(&remote),
        request_timeout: config.request_timeout(),
    };
    let worker = SessionWorker {
        state,
        engine,
        remote,
        config,
        commands: cmd_rx,
        completions_tx,
        completions_rx,
        events,
        scheduler,
        last_tick: Instant::now(),
        accrued: Decimal::ZERO,
        watermark_requested: Decimal::ZERO,
        last_saved,
        last_persisted: None,
        settle_waiters: Vec::new(),
    };
    tokio::spawn(worker.run());
    Ok(handle)
}

//! Periodic sources feeding the session worker.
//!
//! Both timers post commands through a weak sender, so they never keep a
//! session alive on their own, and share one [`CancelToken`] so teardown
//! stops them together.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use crate::session::Command;

/// Cloneable cancellation flag backed by a `watch` channel.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

fn spawn_periodic(
    name: &'static str,
    period: Duration,
    token: CancelToken,
    commands: mpsc::WeakSender<Command>,
    make: fn() -> Command,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let Some(tx) = commands.upgrade() else { break };
                    match tx.try_send(make()) {
                        Ok(()) => {}
                        // Elapsed time is measured by the worker, a skipped fire loses nothing.
                        Err(TrySendError::Full(_)) => debug!(name, "session busy, fire skipped"),
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            }
        }
        debug!(name, "timer stopped");
    })
}

/// Owns the tick cadence and the autosave cadence of one session.
///
/// The worker credits elapsed time itself on every tick, so a delayed or
/// skipped timer fire never loses or duplicates income.
pub struct PersistenceScheduler {
    token: CancelToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PersistenceScheduler {
    pub(crate) fn start(
        tick: Duration,
        autosave: Option<Duration>,
        commands: mpsc::WeakSender<Command>,
    ) -> Self {
        let token = CancelToken::new();
        let mut tasks = vec![spawn_periodic(
            "tick",
            tick,
            token.clone(),
            commands.clone(),
            || Command::Tick,
        )];
        if let Some(period) = autosave {
            tasks.push(spawn_periodic(
                "autosave",
                period,
                token.clone(),
                commands,
                || Command::Autosave,
            ));
        }
        Self { token, tasks }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn autosave_enabled(&self) -> bool {
        self.tasks.len() > 1
    }

    /// Stop both timers and wait for their tasks to exit.
    pub async fn stop(&mut self) {
        self.token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                debug!(error = %e, "timer task ended abnormally");
            }
        }
    }
}

impl Drop for PersistenceScheduler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

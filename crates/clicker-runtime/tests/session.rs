use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clicker_core::{
    ActionRequest, Catalog, GeneratorId, PersistRequest, Receipt, RejectReason, RequestId,
    SessionId, Snapshot, UpgradeId,
};
use clicker_runtime::{
    start, Effect, FailureKind, LocalAuthority, RemoteAuthority, RemoteError, SessionConfig,
    SessionError, SessionEvent, SyncError,
};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};

/// What the scripted authority does with the next submitted action.
#[derive(Clone, Debug)]
enum Script {
    Delay(Duration),
    /// Apply at once, answer after the delay.
    LateAnswer(Duration),
    Hang,
    Reject(RejectReason),
}

#[derive(Debug)]
struct Call {
    id: RequestId,
    started: Instant,
    finished: Option<Instant>,
}

/// Backend with per-call scripted behaviour layered on the in-process rules.
struct Scripted {
    inner: LocalAuthority,
    script: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<Call>>,
}

impl Scripted {
    fn new(snapshot: Snapshot, script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalAuthority::with_snapshot(catalog(), snapshot),
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(u64, Instant, Option<Instant>)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| (c.id.seq, c.started, c.finished))
            .collect()
    }
}

#[async_trait]
impl RemoteAuthority for Scripted {
    async fn fetch_snapshot(&self, session: SessionId) -> Result<Snapshot, RemoteError> {
        self.inner.fetch_snapshot(session).await
    }

    async fn submit(&self, request: ActionRequest) -> Result<Receipt, RemoteError> {
        let step = self.script.lock().unwrap().pop_front();
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                id: request.id,
                started: Instant::now(),
                finished: None,
            });
            calls.len() - 1
        };
        let result = match step {
            None => self.inner.submit(request).await,
            Some(Script::Delay(d)) => {
                time::sleep(d).await;
                self.inner.submit(request).await
            }
            Some(Script::LateAnswer(d)) => {
                let answer = self.inner.submit(request).await;
                time::sleep(d).await;
                answer
            }
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Reject(reason)) => Err(RemoteError::Rejected(reason)),
        };
        self.calls.lock().unwrap()[index].finished = Some(Instant::now());
        result
    }

    async fn available_upgrades(&self, session: SessionId) -> Result<Vec<UpgradeId>, RemoteError> {
        self.inner.available_upgrades(session).await
    }

    async fn persist(&self, request: PersistRequest) -> Result<Receipt, RemoteError> {
        self.inner.persist(request).await
    }
}

fn catalog() -> Arc<Catalog> {
    Arc::new(Catalog::standard())
}

fn dec(n: i64) -> Decimal {
    Decimal::new(n, 0)
}

fn seeded(balance: i64, owned: &[(&str, u32)]) -> Snapshot {
    Snapshot {
        balance: dec(balance),
        total_earned: dec(balance),
        owned: owned
            .iter()
            .map(|(id, n)| (GeneratorId::new(*id), *n))
            .collect(),
        ..Snapshot::default()
    }
}

/// No timer fires during a test unless it asks for one.
fn quiet() -> SessionConfig {
    SessionConfig {
        tick_interval_ms: 3_600_000,
        autosave_interval_ms: None,
        ..SessionConfig::default()
    }
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn first_cursor_is_bought_after_fifteen_clicks() {
    let remote = Arc::new(LocalAuthority::new(catalog()));
    let handle = start(catalog(), remote.clone(), quiet()).await.unwrap();

    for _ in 0..7 {
        handle.manual_action().await.unwrap();
    }
    assert_eq!(handle.view().await.unwrap().balance, dec(7));

    let err = handle.purchase_generator("cursor").await.unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::InsufficientFunds));
    assert_eq!(handle.view().await.unwrap().generator("cursor").unwrap().owned, 0);

    for _ in 0..8 {
        handle.manual_action().await.unwrap();
    }
    let applied = handle.purchase_generator("cursor").await.unwrap();
    match applied.effect {
        Effect::Purchased(p) => {
            assert_eq!(p.cost, dec(15));
            assert_eq!(p.new_count, 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    handle.settle().await.unwrap();
    let view = handle.view().await.unwrap();
    assert_eq!(view.balance, Decimal::ZERO);
    assert_eq!(view.total_earned, dec(15));
    assert_eq!(view.production_rate, Decimal::new(1, 1));
    assert_eq!(view.generator("cursor").unwrap().next_cost, Some(Decimal::new(1725, 2)));
    assert_eq!(view.pending_requests, 0);
    assert_eq!(view.total_clicks, 15);

    let server = remote.snapshot().await;
    assert_eq!(server.balance, Decimal::ZERO);
    assert_eq!(server.owned_count(&GeneratorId::new("cursor")), 1);
    assert_eq!(server.total_clicks, 15);
}

#[tokio::test(start_paused = true)]
async fn rejection_rolls_back_to_last_confirmed() {
    let remote = Arc::new(LocalAuthority::with_snapshot(catalog(), seeded(20, &[])));
    let handle = start(catalog(), remote.clone(), quiet()).await.unwrap();
    let mut events = handle.subscribe();

    // Another device spends the balance behind this session's back.
    remote.overwrite(seeded(0, &[])).await;

    let applied = handle.purchase_generator("cursor").await.unwrap();
    assert_eq!(handle.view().await.unwrap().balance, dec(5));
    handle.settle().await.unwrap();

    let view = handle.view().await.unwrap();
    assert_eq!(view.generator("cursor").unwrap().owned, 0);
    assert_eq!(view.balance, dec(20));
    assert_eq!(view.production_rate, Decimal::ZERO);

    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Rejected {
            id: applied.id,
            action: clicker_core::Action::PurchaseGenerator(GeneratorId::new("cursor")),
            kind: FailureKind::RemoteRejected,
            error: SyncError::RemoteRejected(RejectReason::InsufficientFunds),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn timed_out_request_is_retried_with_same_id() {
    let remote = Scripted::new(seeded(100, &[]), vec![Script::Hang]);
    let handle = start(catalog(), remote.clone(), quiet()).await.unwrap();
    let mut events = handle.subscribe();

    let applied = handle.purchase_generator("grandma").await.unwrap();
    handle.settle().await.unwrap();

    let calls = remote.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(seq, _, _)| *seq == applied.id.seq));
    assert!(calls[1].1 - calls[0].1 >= Duration::from_secs(5));

    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Confirmed {
            id: applied.id,
            action: clicker_core::Action::PurchaseGenerator(GeneratorId::new("grandma")),
        }]
    );
    let server = remote.inner.snapshot().await;
    assert_eq!(server.balance, Decimal::ZERO);
    assert_eq!(server.owned_count(&GeneratorId::new("grandma")), 1);
    assert_eq!(handle.view().await.unwrap().production_rate, Decimal::ONE);
}

#[tokio::test(start_paused = true)]
async fn second_timeout_is_reported_and_rolled_back() {
    let remote = Scripted::new(seeded(100, &[]), vec![Script::Hang, Script::Hang]);
    let handle = start(catalog(), remote.clone(), quiet()).await.unwrap();
    let mut events = handle.subscribe();

    handle.purchase_generator("grandma").await.unwrap();
    handle.settle().await.unwrap();

    match &drain(&mut events)[..] {
        [SessionEvent::Rejected { kind, error, .. }] => {
            assert_eq!(*kind, FailureKind::RemoteTimeout);
            assert_eq!(*error, SyncError::RemoteTimeout);
        }
        other => panic!("unexpected {other:?}"),
    }
    let view = handle.view().await.unwrap();
    assert_eq!(view.balance, dec(100));
    assert_eq!(view.generator("grandma").unwrap().owned, 0);
    assert_eq!(remote.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn purchases_of_one_generator_never_overlap() {
    let remote = Scripted::new(
        seeded(1_000, &[]),
        vec![
            Script::Delay(Duration::from_secs(2)),
            Script::Delay(Duration::from_secs(2)),
        ],
    );
    let handle = start(catalog(), remote.clone(), quiet()).await.unwrap();

    let first = handle.purchase_generator("cursor").await.unwrap();
    let second = handle.purchase_generator("cursor").await.unwrap();
    assert_eq!(handle.view().await.unwrap().generator("cursor").unwrap().owned, 2);
    handle.settle().await.unwrap();

    let calls = remote.calls();
    assert_eq!(calls[0].0, first.id.seq);
    assert_eq!(calls[1].0, second.id.seq);
    let first_done = calls[0].2.unwrap();
    assert!(calls[1].1 >= first_done);

    // 15 + 17.25
    let server = remote.inner.snapshot().await;
    assert_eq!(server.balance, Decimal::new(96775, 2));
    assert_eq!(handle.view().await.unwrap().balance, Decimal::new(96775, 2));
}

#[tokio::test(start_paused = true)]
async fn answers_are_applied_in_request_order() {
    let remote = Scripted::new(
        seeded(1_000, &[]),
        vec![
            Script::Delay(Duration::from_secs(3)),
            Script::Delay(Duration::from_secs(1)),
        ],
    );
    let handle = start(catalog(), remote.clone(), quiet()).await.unwrap();
    let mut events = handle.subscribe();

    let r1 = handle.purchase_generator("cursor").await.unwrap();
    let r2 = handle.purchase_generator("grandma").await.unwrap();
    handle.settle().await.unwrap();

    let calls = remote.calls();
    // The grandma answer came back first.
    assert!(calls[1].2.unwrap() < calls[0].2.unwrap());

    let order: Vec<u64> = drain(&mut events)
        .into_iter()
        .map(|e| match e {
            SessionEvent::Confirmed { id, .. } => id.seq,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(order, vec![r1.id.seq, r2.id.seq]);

    let view = handle.view().await.unwrap();
    assert_eq!(view.balance, dec(885));
    assert_eq!(view.production_rate, Decimal::new(11, 1));
}

#[tokio::test(start_paused = true)]
async fn ticks_credit_production_each_interval() {
    let remote = Arc::new(LocalAuthority::with_snapshot(
        catalog(),
        seeded(0, &[("cursor", 10)]),
    ));
    let config = SessionConfig {
        tick_interval_ms: 1_000,
        autosave_interval_ms: None,
        ..SessionConfig::default()
    };
    let handle = start(catalog(), remote, config).await.unwrap();

    time::sleep(Duration::from_millis(10_500)).await;
    let view = handle.view().await.unwrap();
    assert_eq!(view.production_rate, Decimal::ONE);
    assert_eq!(view.balance, dec(10));
    assert_eq!(view.total_earned, dec(10));
}

#[tokio::test(start_paused = true)]
async fn suspension_is_credited_once_on_resume() {
    let remote = Arc::new(LocalAuthority::with_snapshot(
        catalog(),
        seeded(0, &[("grandma", 3)]),
    ));
    let handle = start(catalog(), remote.clone(), quiet()).await.unwrap();

    time::advance(Duration::from_secs(45)).await;
    handle.visibility_lost().await.unwrap();
    handle.settle().await.unwrap();

    let view = handle.view().await.unwrap();
    assert_eq!(view.balance, dec(135));
    assert!(view.last_saved.is_some());
    assert_eq!(remote.snapshot().await.balance, dec(135));

    // Flushing again without elapsed time credits nothing.
    handle.persist_now().await.unwrap();
    handle.settle().await.unwrap();
    assert_eq!(handle.view().await.unwrap().balance, dec(135));
    assert_eq!(remote.snapshot().await.balance, dec(135));
}

#[tokio::test(start_paused = true)]
async fn autosave_is_idempotent_and_shutdown_flushes() {
    let remote = Arc::new(LocalAuthority::with_snapshot(
        catalog(),
        seeded(0, &[("grandma", 1)]),
    ));
    let config = SessionConfig {
        tick_interval_ms: 1_000,
        autosave_interval_ms: Some(30_000),
        ..SessionConfig::default()
    };
    let handle = start(catalog(), remote.clone(), config).await.unwrap();
    let mut events = handle.subscribe();

    time::sleep(Duration::from_secs(95)).await;
    handle.settle().await.unwrap();
    assert_eq!(remote.snapshot().await.balance, dec(90));
    assert_eq!(handle.view().await.unwrap().balance, dec(95));
    let saves = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Persisted { .. }))
        .count();
    assert_eq!(saves, 3);

    let report = handle.shutdown().await.unwrap();
    assert!(report.persisted);
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.balance, dec(95));
    assert_eq!(remote.snapshot().await.balance, dec(95));

    assert_eq!(handle.view().await, Err(SessionError::Closed));
}

#[tokio::test(start_paused = true)]
async fn spend_flushes_passive_income_first() {
    let remote = Arc::new(LocalAuthority::with_snapshot(
        catalog(),
        seeded(0, &[("grandma", 1)]),
    ));
    let handle = start(catalog(), remote.clone(), quiet()).await.unwrap();

    // Two minutes of one grandma pays for a second one, but the authority
    // has not seen that income yet.
    time::advance(Duration::from_secs(120)).await;
    let applied = handle.purchase_generator("grandma").await.unwrap();
    handle.settle().await.unwrap();

    let server = remote.snapshot().await;
    assert_eq!(server.owned_count(&GeneratorId::new("grandma")), 2);
    let cost = match applied.effect {
        Effect::Purchased(p) => p.cost,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(cost, dec(115));
    assert_eq!(server.balance, dec(5));
    assert_eq!(handle.view().await.unwrap().balance, dec(5));
}

#[tokio::test(start_paused = true)]
async fn refresh_upgrades_asks_the_authority() {
    let remote = Arc::new(LocalAuthority::with_snapshot(
        catalog(),
        seeded(0, &[("cursor", 1)]),
    ));
    let handle = start(catalog(), remote, quiet()).await.unwrap();
    assert_eq!(handle.refresh_upgrades().await.unwrap(), vec![UpgradeId(1)]);
}

#[tokio::test(start_paused = true)]
async fn duplicate_upgrade_is_refused_locally() {
    let remote = Arc::new(LocalAuthority::with_snapshot(
        catalog(),
        seeded(300, &[("cursor", 1)]),
    ));
    let handle = start(catalog(), remote.clone(), quiet()).await.unwrap();

    handle.purchase_upgrade(UpgradeId(1)).await.unwrap();
    let err = handle.purchase_upgrade(UpgradeId(1)).await.unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::AlreadyApplied));
    handle.settle().await.unwrap();

    let view = handle.view().await.unwrap();
    assert_eq!(view.balance, dec(200));
    assert_eq!(view.manual_action_value, dec(2));
    assert!(view.upgrade(UpgradeId(1)).unwrap().purchased);
    assert_eq!(remote.snapshot().await.balance, dec(200));
}

#[tokio::test(start_paused = true)]
async fn rejected_click_is_taken_back() {
    let remote = Scripted::new(
        seeded(3, &[]),
        vec![Script::Reject(RejectReason::Other("rate limited".into()))],
    );
    let handle = start(catalog(), remote.clone(), quiet()).await.unwrap();
    let mut events = handle.subscribe();

    let applied = handle.manual_action().await.unwrap();
    assert_eq!(applied.effect, Effect::Credited { amount: Decimal::ONE });
    handle.manual_action().await.unwrap();
    handle.settle().await.unwrap();

    let events = drain(&mut events);
    assert!(matches!(
        &events[0],
        SessionEvent::Rejected { kind: FailureKind::RemoteRejected, .. }
    ));
    assert!(matches!(&events[1], SessionEvent::Confirmed { .. }));
    // Only the second click stuck.
    assert_eq!(handle.view().await.unwrap().balance, dec(4));
    assert_eq!(remote.inner.snapshot().await.balance, dec(4));
}

#[tokio::test(start_paused = true)]
async fn late_answer_for_an_applied_request_is_not_counted_twice() {
    let remote = Scripted::new(
        seeded(1_000, &[]),
        vec![
            Script::Delay(Duration::from_secs(2)),
            Script::LateAnswer(Duration::from_secs(4)),
        ],
    );
    let handle = start(catalog(), remote.clone(), quiet()).await.unwrap();

    handle.purchase_generator("cursor").await.unwrap();
    handle.purchase_generator("grandma").await.unwrap();

    // The cursor receipt already contains the grandma; its own answer is
    // still on the way.
    time::sleep(Duration::from_millis(2_100)).await;
    let view = handle.view().await.unwrap();
    assert_eq!(view.generator("cursor").unwrap().owned, 1);
    assert_eq!(view.generator("grandma").unwrap().owned, 1);
    assert_eq!(view.balance, dec(885));
    assert_eq!(view.production_rate, Decimal::new(11, 1));

    handle.settle().await.unwrap();
    let report = handle.shutdown().await.unwrap();
    assert!(report.persisted);

    // 885 plus four seconds at 1.1/s.
    let server = remote.inner.snapshot().await;
    assert_eq!(server.owned_count(&GeneratorId::new("grandma")), 1);
    assert_eq!(server.owned_count(&GeneratorId::new("cursor")), 1);
    assert_eq!(server.balance, Decimal::new(8_894, 1));
    assert_eq!(report.balance, Decimal::new(8_894, 1));
}

#[tokio::test(start_paused = true)]
async fn upgrade_bought_on_another_device_is_not_a_failure() {
    let remote = Arc::new(LocalAuthority::with_snapshot(
        catalog(),
        seeded(300, &[("cursor", 1)]),
    ));
    let handle = start(catalog(), remote.clone(), quiet()).await.unwrap();
    let mut events = handle.subscribe();

    let mut elsewhere = seeded(300, &[("cursor", 1)]);
    elsewhere.upgrades.insert(UpgradeId(1));
    remote.overwrite(elsewhere).await;

    let applied = handle.purchase_upgrade(UpgradeId(1)).await.unwrap();
    assert_eq!(handle.view().await.unwrap().balance, dec(200));
    handle.settle().await.unwrap();

    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Confirmed {
            id: applied.id,
            action: clicker_core::Action::PurchaseUpgrade(UpgradeId(1)),
        }]
    );
    let view = handle.view().await.unwrap();
    assert!(view.upgrade(UpgradeId(1)).unwrap().purchased);
    assert_eq!(view.manual_action_value, dec(2));
    assert_eq!(view.balance, dec(300));
    assert_eq!(remote.snapshot().await.balance, dec(300));
}

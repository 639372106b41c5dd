//! Integration tests for the relay protocol: ordering, locking, partial failure,
//! recovery, and the trigger/sweep drivers. Uses in-memory stores and scripted
//! fake destination APIs.

use async_trait::async_trait;
use relay::record::{Attachment, ChatMessage, ContactKey, RecordKey, RelayRecord, TicketComment};
use relay::relay::{AttemptOutcome, RelayEngine, RelayError};
use relay::retry::RetryPolicy;
use relay::sink::{
    ChatApi, ChatSink, NewThread, Sink, SinkError, TicketingApi, TicketingSink,
};
use relay::store::{
    ChangeEvent, EventType, LockOutcome, MemoryRelayStore, MemoryThreadDirectory, OpenThread,
    RelayStore, ReleaseOutcome, StoreError, ThreadDirectory,
};
use relay::sweep::LockSweeper;
use relay::trigger::TriggerAdapter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CONTACT: &str = "5511999";

#[derive(Debug, Clone, PartialEq)]
enum TicketCall {
    Create(NewThread),
    Append { thread_id: i64, requester_id: i64, body: String },
}

/// Ticketing API that records calls. Bodies listed in `failing` are rejected with a 500;
/// the first `transient` calls fail too.
#[derive(Clone, Default)]
struct FakeTicketing {
    calls: Arc<Mutex<Vec<TicketCall>>>,
    failing: Arc<Mutex<Vec<String>>>,
    transient: Arc<AtomicUsize>,
    delay: Duration,
}

impl FakeTicketing {
    fn calls(&self) -> Vec<TicketCall> {
        self.calls.lock().unwrap().clone()
    }

    fn bodies(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| match c {
                TicketCall::Create(t) => t.body,
                TicketCall::Append { body, .. } => body,
            })
            .collect()
    }

    fn fail_body(&self, body: &str) {
        self.failing.lock().unwrap().push(body.to_string());
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    async fn gate(&self, body: &str) -> Result<(), SinkError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let transient = self
            .transient
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient || self.failing.lock().unwrap().iter().any(|b| b == body) {
            return Err(SinkError::Api {
                status: 500,
                body: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TicketingApi for FakeTicketing {
    async fn create_thread(&self, new: &NewThread) -> Result<OpenThread, SinkError> {
        self.gate(&new.body).await?;
        let mut calls = self.calls.lock().unwrap();
        let created = calls
            .iter()
            .filter(|c| matches!(c, TicketCall::Create(_)))
            .count() as i64;
        calls.push(TicketCall::Create(new.clone()));
        Ok(OpenThread {
            thread_id: 100 + created,
            requester_id: 900,
        })
    }

    async fn append_comment(
        &self,
        thread_id: i64,
        requester_id: i64,
        body: &str,
    ) -> Result<(), SinkError> {
        self.gate(body).await?;
        self.calls.lock().unwrap().push(TicketCall::Append {
            thread_id,
            requester_id,
            body: body.to_string(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ChatCall {
    Text(String, String),
    Attachment(String, String),
}

#[derive(Clone, Default)]
struct FakeChat {
    calls: Arc<Mutex<Vec<ChatCall>>>,
}

#[async_trait]
impl ChatApi for FakeChat {
    async fn send_text(&self, recipient: &str, text: &str) -> Result<(), SinkError> {
        self.calls
            .lock()
            .unwrap()
            .push(ChatCall::Text(recipient.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_attachment(
        &self,
        recipient: &str,
        attachment: &Attachment,
    ) -> Result<(), SinkError> {
        self.calls.lock().unwrap().push(ChatCall::Attachment(
            recipient.to_string(),
            attachment.content_url.clone(),
        ));
        Ok(())
    }
}

/// Sink that records the stored flags of each record at the moment it is delivered.
struct ObservingSink {
    store: Arc<MemoryRelayStore<ChatMessage>>,
    seen: Arc<Mutex<Vec<(String, bool, bool)>>>,
}

#[async_trait]
impl Sink<ChatMessage> for ObservingSink {
    type Cursor = ();

    async fn begin(&self, _contact_key: &str) -> Result<(), RelayError> {
        Ok(())
    }

    async fn deliver(
        &self,
        _cursor: &mut (),
        record: &RelayRecord<ChatMessage>,
    ) -> Result<(), SinkError> {
        let stored = self
            .store
            .get(&record.contact_key, &record.record_key)
            .await
            .expect("record exists");
        self.seen
            .lock()
            .unwrap()
            .push((record.record_key.clone(), stored.handled, stored.lock));
        Ok(())
    }
}

/// Store wrapper whose lock or commit of one record key fails with a store error.
struct FlakyStore {
    inner: MemoryRelayStore<ChatMessage>,
    fail_lock: Mutex<Option<String>>,
    fail_commit: Mutex<Option<String>>,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryRelayStore::new(),
            fail_lock: Mutex::new(None),
            fail_commit: Mutex::new(None),
        }
    }

    fn trips(slot: &Mutex<Option<String>>, record_key: &str) -> bool {
        slot.lock().unwrap().as_deref() == Some(record_key)
    }
}

#[async_trait]
impl RelayStore<ChatMessage> for FlakyStore {
    async fn insert(&self, record: RelayRecord<ChatMessage>) -> Result<bool, StoreError> {
        self.inner.insert(record).await
    }

    async fn query_unhandled_unlocked(
        &self,
        contact_key: &str,
    ) -> Result<Vec<RelayRecord<ChatMessage>>, StoreError> {
        self.inner.query_unhandled_unlocked(contact_key).await
    }

    async fn try_lock(
        &self,
        contact_key: &str,
        record_key: &str,
        now_ms: i64,
    ) -> Result<LockOutcome, StoreError> {
        if Self::trips(&self.fail_lock, record_key) {
            return Err(StoreError::Unavailable("lock write failed".to_string()));
        }
        self.inner.try_lock(contact_key, record_key, now_ms).await
    }

    async fn commit(
        &self,
        contact_key: &str,
        record_key: &str,
        lock_stamp: i64,
    ) -> Result<ReleaseOutcome, StoreError> {
        if Self::trips(&self.fail_commit, record_key) {
            return Err(StoreError::Unavailable("commit write failed".to_string()));
        }
        self.inner.commit(contact_key, record_key, lock_stamp).await
    }

    async fn unlock(
        &self,
        contact_key: &str,
        record_key: &str,
        lock_stamp: i64,
    ) -> Result<ReleaseOutcome, StoreError> {
        self.inner.unlock(contact_key, record_key, lock_stamp).await
    }

    async fn release_expired_locks(
        &self,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Vec<(ContactKey, RecordKey)>, StoreError> {
        self.inner.release_expired_locks(now_ms, lease_ms).await
    }

    async fn idle_pending_contacts(
        &self,
        idle_before_ms: i64,
    ) -> Result<Vec<ContactKey>, StoreError> {
        self.inner.idle_pending_contacts(idle_before_ms).await
    }
}

fn msg(key: &str, ts: i64, body: &str) -> RelayRecord<ChatMessage> {
    RelayRecord::new(CONTACT, key, ts, ChatMessage::text("Ana", body))
}

type TicketEngine = RelayEngine<ChatMessage, TicketingSink<FakeTicketing>>;

struct Harness {
    store: Arc<MemoryRelayStore<ChatMessage>>,
    threads: Arc<MemoryThreadDirectory>,
    api: FakeTicketing,
}

impl Harness {
    fn new() -> Self {
        Self::with_api(FakeTicketing::default())
    }

    fn with_api(api: FakeTicketing) -> Self {
        Self {
            store: Arc::new(MemoryRelayStore::new()),
            threads: Arc::new(MemoryThreadDirectory::new()),
            api,
        }
    }

    fn engine(&self) -> TicketEngine {
        let store: Arc<dyn RelayStore<ChatMessage>> = self.store.clone();
        let threads: Arc<dyn ThreadDirectory> = self.threads.clone();
        RelayEngine::new(
            "whatsapp->zendesk",
            store,
            TicketingSink::new(self.api.clone(), threads, "wa.example"),
        )
    }

    async fn insert(&self, records: Vec<RelayRecord<ChatMessage>>) {
        for r in records {
            assert!(self.store.insert(r).await.unwrap());
        }
    }

    async fn flags(&self, key: &str) -> (bool, bool) {
        let r = self.store.get(CONTACT, key).await.expect("record exists");
        (r.handled, r.lock)
    }
}

async fn wait_until_handled(store: &MemoryRelayStore<ChatMessage>, keys: &[&str]) {
    for _ in 0..200 {
        let mut all = true;
        for k in keys {
            all &= store.get(CONTACT, k).await.is_some_and(|r| r.handled);
        }
        if all {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("records {:?} were not handled within 2s", keys);
}

#[tokio::test]
async fn scenario_a_delivers_in_timestamp_order_not_arrival_order() {
    let h = Harness::new();
    h.insert(vec![msg("m1", 200, "second"), msg("m0", 100, "first")]).await;

    let outcome = h.engine().run(CONTACT, &CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        AttemptOutcome::Delivered {
            delivered: 2,
            conflicts: 0
        }
    );

    let calls = h.api.calls();
    assert_eq!(calls.len(), 2);
    let TicketCall::Create(thread) = &calls[0] else {
        panic!("first call should create the thread: {:?}", calls[0]);
    };
    assert_eq!(thread.body, "first");
    assert_eq!(thread.subject, "WhatsApp 5511999 - Ana");
    assert_eq!(thread.requester_email, "5511999@wa.example");
    assert_eq!(
        calls[1],
        TicketCall::Append {
            thread_id: 100,
            requester_id: 900,
            body: "second".to_string()
        }
    );
    assert_eq!(h.flags("m0").await, (true, false));
    assert_eq!(h.flags("m1").await, (true, false));
    assert_eq!(
        h.threads.find_open(CONTACT).await.unwrap(),
        vec![OpenThread {
            thread_id: 100,
            requester_id: 900
        }]
    );
}

#[tokio::test]
async fn scenario_b_one_failure_releases_the_whole_batch() {
    let h = Harness::new();
    h.threads
        .register(CONTACT, OpenThread { thread_id: 7, requester_id: 70 })
        .await
        .unwrap();
    h.insert(vec![msg("a", 1, "one"), msg("b", 2, "two"), msg("c", 3, "three")]).await;
    h.api.fail_body("two");

    let err = h.engine().run(CONTACT, &CancellationToken::new()).await.unwrap_err();
    let RelayError::Delivery { failed } = err else {
        panic!("expected delivery error, got {:?}", err);
    };
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].record_key, "b");

    // Later records were still attempted; nothing is committed.
    assert_eq!(h.api.bodies(), vec!["one", "three"]);
    for k in ["a", "b", "c"] {
        assert_eq!(h.flags(k).await, (false, false), "record {}", k);
    }

    // Redelivery after the destination recovers relays everything (at-least-once).
    h.api.heal();
    h.engine().run(CONTACT, &CancellationToken::new()).await.unwrap();
    assert_eq!(h.api.bodies(), vec!["one", "three", "one", "two", "three"]);
    for k in ["a", "b", "c"] {
        assert_eq!(h.flags(k).await, (true, false), "record {}", k);
    }
}

#[tokio::test]
async fn scenario_c_locked_record_is_excluded_and_left_alone() {
    let h = Harness::new();
    h.insert(vec![msg("m1", 1, "owned elsewhere"), msg("m2", 2, "mine")]).await;
    assert_eq!(
        h.store.try_lock(CONTACT, "m1", 1).await.unwrap(),
        LockOutcome::Acquired
    );

    let outcome = h.engine().run(CONTACT, &CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        AttemptOutcome::Delivered {
            delivered: 1,
            conflicts: 0
        }
    );
    // m1 was locked before the fetch, so the fetch never returned it.
    assert_eq!(h.api.bodies(), vec!["mine"]);
    assert_eq!(h.flags("m1").await, (false, true));
    assert_eq!(h.flags("m2").await, (true, false));
}

#[tokio::test]
async fn lock_lost_between_fetch_and_lock_is_a_conflict() {
    let store = MemoryRelayStore::new();
    store.insert(msg("m1", 1, "x")).await.unwrap();
    store.insert(msg("m2", 2, "y")).await.unwrap();
    let batch = store.query_unhandled_unlocked(CONTACT).await.unwrap();
    // Another attempt wins m1 after our fetch.
    store.try_lock(CONTACT, "m1", 5).await.unwrap();

    let report = relay::relay::lock_batch(&store, batch, 6).await.unwrap();
    assert_eq!(report.locked.len(), 1);
    assert_eq!(report.locked[0].record_key, "m2");
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].record_key, "m1");
}

#[tokio::test]
async fn record_locked_by_another_attempt_is_never_fetched() {
    let h = Harness::new();
    h.insert(vec![msg("m1", 1, "x")]).await;
    let batch = h.store.query_unhandled_unlocked(CONTACT).await.unwrap();
    h.store.try_lock(CONTACT, "m1", 1).await.unwrap();
    let report = relay::relay::lock_batch(&*h.store, batch, 2).await.unwrap();
    assert!(report.locked.is_empty());

    let outcome = h.engine().run(CONTACT, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, AttemptOutcome::Empty);
    assert!(h.api.calls().is_empty());
}

#[tokio::test]
async fn scenario_d_two_open_threads_abort_without_mutation() {
    let h = Harness::new();
    h.threads
        .insert_unchecked(CONTACT, OpenThread { thread_id: 1, requester_id: 10 })
        .await;
    h.threads
        .insert_unchecked(CONTACT, OpenThread { thread_id: 2, requester_id: 10 })
        .await;
    h.insert(vec![msg("m1", 1, "hello")]).await;

    let err = h.engine().run(CONTACT, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RelayError::InvariantViolation(_)), "{:?}", err);
    assert!(!err.is_retryable());
    assert!(h.api.calls().is_empty());
    assert_eq!(h.flags("m1").await, (false, false));
}

#[tokio::test]
async fn empty_contact_is_a_no_op() {
    let h = Harness::new();
    let outcome = h.engine().run("nobody", &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, AttemptOutcome::Empty);
    assert!(h.api.calls().is_empty());
}

#[tokio::test]
async fn concurrent_attempts_never_deliver_a_record_twice() {
    let api = FakeTicketing {
        delay: Duration::from_millis(5),
        ..FakeTicketing::default()
    };
    let h = Harness::with_api(api);
    h.threads
        .register(CONTACT, OpenThread { thread_id: 7, requester_id: 70 })
        .await
        .unwrap();
    let records: Vec<_> = (0..8)
        .map(|i| msg(&format!("m{}", i), i, &format!("body {}", i)))
        .collect();
    h.insert(records).await;

    let (first, second) = (h.engine(), h.engine());
    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(first.run(CONTACT, &cancel), second.run(CONTACT, &cancel));
    let delivered = |o: AttemptOutcome| match o {
        AttemptOutcome::Delivered { delivered, .. } => delivered,
        _ => 0,
    };
    assert_eq!(delivered(a.unwrap()) + delivered(b.unwrap()), 8);

    let mut bodies = h.api.bodies();
    bodies.sort();
    bodies.dedup();
    assert_eq!(bodies.len(), 8);
    assert_eq!(h.api.calls().len(), 8);
}

#[tokio::test]
async fn records_are_not_committed_before_delivery() {
    let store = Arc::new(MemoryRelayStore::new());
    store.insert(msg("m1", 1, "x")).await.unwrap();
    store.insert(msg("m2", 2, "y")).await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = ObservingSink {
        store: store.clone(),
        seen: seen.clone(),
    };
    let dyn_store: Arc<dyn RelayStore<ChatMessage>> = store.clone();
    let engine = RelayEngine::new("observe", dyn_store, sink);

    engine.run(CONTACT, &CancellationToken::new()).await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("m1".to_string(), false, true),
            ("m2".to_string(), false, true)
        ]
    );
    assert!(store.get(CONTACT, "m2").await.unwrap().handled);
}

#[tokio::test]
async fn store_failure_while_locking_releases_earlier_locks() {
    let store = Arc::new(FlakyStore::new());
    store.insert(msg("m1", 1, "x")).await.unwrap();
    store.insert(msg("m2", 2, "y")).await.unwrap();
    store.insert(msg("m3", 3, "z")).await.unwrap();
    *store.fail_lock.lock().unwrap() = Some("m2".to_string());

    let api = FakeTicketing::default();
    let dyn_store: Arc<dyn RelayStore<ChatMessage>> = store.clone();
    let engine = RelayEngine::new(
        "flaky",
        dyn_store,
        TicketingSink::new(api.clone(), Arc::new(MemoryThreadDirectory::new()), "wa.example"),
    );

    let err = engine.run(CONTACT, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RelayError::Persistence(_)), "{:?}", err);
    assert!(err.is_retryable());
    assert!(api.calls().is_empty());
    for k in ["m1", "m2", "m3"] {
        assert!(store.inner.get(CONTACT, k).await.unwrap().is_pending(), "record {}", k);
    }
}

#[tokio::test]
async fn partial_commit_failure_is_reported_and_recovered_by_the_sweep() {
    let store = Arc::new(FlakyStore::new());
    store.insert(msg("m1", 1, "x")).await.unwrap();
    store.insert(msg("m2", 2, "y")).await.unwrap();
    *store.fail_commit.lock().unwrap() = Some("m2".to_string());

    let api = FakeTicketing::default();
    let dyn_store: Arc<dyn RelayStore<ChatMessage>> = store.clone();
    let engine = RelayEngine::new(
        "flaky",
        dyn_store,
        TicketingSink::new(api.clone(), Arc::new(MemoryThreadDirectory::new()), "wa.example"),
    );
    let cancel = CancellationToken::new();

    let err = engine.run(CONTACT, &cancel).await.unwrap_err();
    let RelayError::CommitIncomplete { stuck } = &err else {
        panic!("expected CommitIncomplete, got {:?}", err);
    };
    assert_eq!(stuck, &vec!["m2".to_string()]);
    let m2 = store.inner.get(CONTACT, "m2").await.unwrap();
    assert!(m2.lock && !m2.handled);
    assert!(store.inner.get(CONTACT, "m1").await.unwrap().handled);

    *store.fail_commit.lock().unwrap() = None;
    let trigger = Arc::new(TriggerAdapter::new(engine, RetryPolicy::none(), cancel));
    let sweeper = LockSweeper::new(trigger, Duration::ZERO, Duration::from_secs(60));
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.released, vec![(CONTACT.to_string(), "m2".to_string())]);
    assert!(report.resumed.is_empty());

    wait_until_handled(&store.inner, &["m1", "m2"]).await;
    // m2 was delivered again after the lost commit.
    assert_eq!(api.bodies(), vec!["x", "y", "y"]);
}

#[tokio::test]
async fn cancelled_attempt_unlocks_everything() {
    let h = Harness::new();
    h.insert(vec![msg("m1", 1, "x")]).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h.engine().run(CONTACT, &cancel).await.unwrap_err();
    assert!(matches!(err, RelayError::Cancelled));
    assert!(h.api.calls().is_empty());
    assert_eq!(h.flags("m1").await, (false, false));
}

#[tokio::test]
async fn thread_created_concurrently_elsewhere_is_an_invariant_violation() {
    let api = FakeTicketing::default();
    let threads = Arc::new(MemoryThreadDirectory::new());
    let sink = TicketingSink::new(api.clone(), threads.clone(), "wa.example");

    let mut cursor = sink.begin(CONTACT).await.unwrap();
    // Another attempt registers its thread between our begin and first delivery.
    threads
        .register(CONTACT, OpenThread { thread_id: 55, requester_id: 5 })
        .await
        .unwrap();

    let err = sink.deliver(&mut cursor, &msg("m1", 1, "hi")).await.unwrap_err();
    assert!(matches!(err, SinkError::Invariant(_)), "{:?}", err);
    assert_eq!(threads.find_open(CONTACT).await.unwrap().len(), 1);
}

#[tokio::test]
async fn trigger_runs_one_attempt_per_insert_and_ignores_other_events() {
    let h = Harness::new();
    h.insert(vec![msg("m1", 1, "x")]).await;
    let adapter = TriggerAdapter::new(h.engine(), RetryPolicy::none(), CancellationToken::new());

    let modify = ChangeEvent {
        event_type: EventType::Modify,
        ..ChangeEvent::insert(CONTACT, "m1")
    };
    let remove = ChangeEvent {
        event_type: EventType::Remove,
        ..ChangeEvent::insert(CONTACT, "m1")
    };
    let report = adapter
        .handle_events(&[
            modify,
            ChangeEvent::insert(CONTACT, "m1"),
            remove,
            ChangeEvent::insert(CONTACT, "m1"),
        ])
        .await;

    assert!(report.is_success());
    let outcomes: Vec<AttemptOutcome> = report.succeeded.iter().map(|(_, o)| *o).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::Delivered {
                delivered: 1,
                conflicts: 0
            },
            AttemptOutcome::Empty
        ]
    );
    assert_eq!(h.api.calls().len(), 1);
}

#[tokio::test]
async fn failed_event_marks_the_report_for_redelivery() {
    let h = Harness::new();
    h.insert(vec![msg("m1", 1, "x")]).await;
    h.api.fail_body("x");
    let adapter = TriggerAdapter::new(h.engine(), RetryPolicy::none(), CancellationToken::new());

    let report = adapter.handle_events(&[ChangeEvent::insert(CONTACT, "m1")]).await;
    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
}

#[tokio::test]
async fn relay_retries_transient_failures() {
    let api = FakeTicketing::default();
    api.transient.store(2, Ordering::SeqCst);
    let h = Harness::with_api(api);
    h.insert(vec![msg("m1", 1, "x")]).await;
    let retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 2,
    };
    let adapter = TriggerAdapter::new(h.engine(), retry, CancellationToken::new());

    let outcome = adapter.relay(CONTACT).await.unwrap();
    assert!(matches!(outcome, AttemptOutcome::Delivered { delivered: 1, .. }));
    assert_eq!(h.flags("m1").await, (true, false));
}

#[tokio::test]
async fn relay_gives_up_after_max_attempts() {
    let api = FakeTicketing::default();
    api.transient.store(5, Ordering::SeqCst);
    let h = Harness::with_api(api);
    h.insert(vec![msg("m1", 1, "x")]).await;
    let retry = RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 1,
        max_delay_ms: 1,
    };
    let adapter = TriggerAdapter::new(h.engine(), retry, CancellationToken::new());

    assert!(matches!(
        adapter.relay(CONTACT).await,
        Err(RelayError::Delivery { .. })
    ));
    assert_eq!(h.api.transient.load(Ordering::SeqCst), 3);
    assert_eq!(h.flags("m1").await, (false, false));
}

#[tokio::test]
async fn invariant_violation_is_not_retried() {
    let h = Harness::new();
    h.threads
        .insert_unchecked(CONTACT, OpenThread { thread_id: 1, requester_id: 1 })
        .await;
    h.threads
        .insert_unchecked(CONTACT, OpenThread { thread_id: 2, requester_id: 1 })
        .await;
    h.insert(vec![msg("m1", 1, "x")]).await;
    // A retry would sleep for a minute and trip the timeout.
    let retry = RetryPolicy {
        max_attempts: 5,
        base_delay_ms: 60_000,
        max_delay_ms: 60_000,
    };
    let adapter = TriggerAdapter::new(h.engine(), retry, CancellationToken::new());

    let result = tokio::time::timeout(Duration::from_secs(5), adapter.relay(CONTACT))
        .await
        .expect("no retry delay");
    assert!(matches!(result, Err(RelayError::InvariantViolation(_))));
}

#[tokio::test]
async fn change_feed_runner_relays_new_records() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    let adapter = Arc::new(TriggerAdapter::new(
        h.engine(),
        RetryPolicy::none(),
        cancel.clone(),
    ));
    h.threads
        .register(CONTACT, OpenThread { thread_id: 7, requester_id: 70 })
        .await
        .unwrap();
    let runner = adapter.spawn(h.store.subscribe());

    h.insert(vec![msg("m0", 100, "first"), msg("m1", 200, "second")]).await;
    wait_until_handled(&h.store, &["m0", "m1"]).await;

    cancel.cancel();
    runner.await.unwrap();
    let mut bodies = h.api.bodies();
    bodies.sort();
    assert_eq!(bodies, vec!["first", "second"]);
}

#[tokio::test]
async fn sweep_releases_only_expired_locks() {
    let h = Harness::new();
    h.insert(vec![msg("old", 1, "x"), msg("fresh", 2, "y")]).await;
    let now = relay::relay::now_ms();
    h.store.try_lock(CONTACT, "old", now - 120_000).await.unwrap();
    h.store.try_lock(CONTACT, "fresh", now).await.unwrap();

    let trigger = Arc::new(TriggerAdapter::new(
        h.engine(),
        RetryPolicy::none(),
        CancellationToken::new(),
    ));
    let sweeper = LockSweeper::new(trigger, Duration::from_secs(60), Duration::from_secs(60));
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.released, vec![(CONTACT.to_string(), "old".to_string())]);
    assert!(report.resumed.is_empty());

    wait_until_handled(&h.store, &["old"]).await;
    assert_eq!(h.flags("fresh").await, (false, true));
    assert_eq!(h.api.bodies(), vec!["x"]);
}

#[tokio::test]
async fn sweep_resumes_records_left_pending_after_retries_ran_out() {
    let h = Harness::new();
    h.insert(vec![msg("m1", 1, "x")]).await;
    h.api.fail_body("x");
    let retry = RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 1,
        max_delay_ms: 1,
    };
    let trigger = Arc::new(TriggerAdapter::new(h.engine(), retry, CancellationToken::new()));
    assert!(trigger.relay(CONTACT).await.is_err());
    assert_eq!(h.flags("m1").await, (false, false));
    h.api.heal();

    // Touched moments ago: not idle for a 60s lease.
    let patient = LockSweeper::new(trigger.clone(), Duration::from_secs(60), Duration::from_secs(60));
    let report = patient.sweep_once().await.unwrap();
    assert!(report.released.is_empty());
    assert!(report.resumed.is_empty());
    assert_eq!(h.flags("m1").await, (false, false));

    let eager = LockSweeper::new(trigger, Duration::ZERO, Duration::from_secs(60));
    let report = eager.sweep_once().await.unwrap();
    assert!(report.released.is_empty());
    assert_eq!(report.resumed, vec![CONTACT.to_string()]);
    wait_until_handled(&h.store, &["m1"]).await;
    assert_eq!(h.api.bodies(), vec!["x"]);
}

#[tokio::test]
async fn attempt_outliving_its_lease_leaves_the_new_owner_alone() {
    let h = Harness::with_api(FakeTicketing {
        delay: Duration::from_millis(300),
        ..FakeTicketing::default()
    });
    h.insert(vec![msg("m1", 1, "x")]).await;
    let engine = h.engine();
    let stale = tokio::spawn(async move { engine.run(CONTACT, &CancellationToken::new()).await });

    // While the first attempt is still delivering, its lease expires and a second
    // attempt takes the record over.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.flags("m1").await, (false, true));
    let now = relay::relay::now_ms();
    let released = h.store.release_expired_locks(now + 1, 0).await.unwrap();
    assert_eq!(released.len(), 1);
    let takeover = now + 10_000;
    assert_eq!(
        h.store.try_lock(CONTACT, "m1", takeover).await.unwrap(),
        LockOutcome::Acquired
    );

    let outcome = stale.await.unwrap().unwrap();
    assert!(matches!(outcome, AttemptOutcome::Delivered { delivered: 1, .. }));
    let r = h.store.get(CONTACT, "m1").await.unwrap();
    assert!(r.lock && !r.handled);
    assert_eq!(r.locked_at, Some(takeover));
    assert_eq!(
        h.store.try_lock(CONTACT, "m1", takeover + 1).await.unwrap(),
        LockOutcome::Conflict
    );
}

#[tokio::test]
async fn chat_direction_sends_text_then_attachments() {
    let store = Arc::new(MemoryRelayStore::new());
    let mut comment = TicketComment::plain(1, "hello&nbsp;there ");
    comment.attachments = vec![
        Attachment {
            content_url: "https://files.example/1.png".to_string(),
            file_name: None,
            content_type: Some("image/png".to_string()),
        },
        Attachment {
            content_url: "https://files.example/2.pdf".to_string(),
            file_name: Some("2.pdf".to_string()),
            content_type: Some("application/pdf".to_string()),
        },
    ];
    store
        .insert(RelayRecord::new(CONTACT, "c2", 2_000, comment))
        .await
        .unwrap();
    store
        .insert(RelayRecord::new(CONTACT, "c1", 1_000, TicketComment::plain(1, "  ")))
        .await
        .unwrap();

    let chat = FakeChat::default();
    let dyn_store: Arc<dyn RelayStore<TicketComment>> = store.clone();
    let engine = RelayEngine::new("zendesk->whatsapp", dyn_store, ChatSink::new(chat.clone()));
    engine.run(CONTACT, &CancellationToken::new()).await.unwrap();

    assert_eq!(
        *chat.calls.lock().unwrap(),
        vec![
            ChatCall::Text(CONTACT.to_string(), "hello there".to_string()),
            ChatCall::Attachment(CONTACT.to_string(), "https://files.example/1.png".to_string()),
            ChatCall::Attachment(CONTACT.to_string(), "https://files.example/2.pdf".to_string()),
        ]
    );
    assert!(store.get(CONTACT, "c1").await.unwrap().handled);
    assert!(store.get(CONTACT, "c2").await.unwrap().handled);
}

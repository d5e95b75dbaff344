//! Engine behavior against an in-memory remote authority.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use fieldsync_common::{
    AuthToken, Collection, Error, OperationKind, RecordId, Result, Session, SyncStatus, UserInfo,
};
use fieldsync_store::SqliteStore;
use fieldsync_sync::{ConnectivityMonitor, LoginResponse, RemoteAuthority, SyncConfig, SyncEngine};

#[derive(Default)]
struct MockState {
    next_id: i64,
    collections: BTreeMap<&'static str, BTreeMap<i64, Value>>,
    /// Order of data calls, e.g. `create children` / `update children 3`.
    call_log: Vec<String>,
}

/// In-memory stand-in for the remote authority with failure injection.
struct MockAuthority {
    state: Mutex<MockState>,
    /// Simulates transport failure for all data calls.
    offline: AtomicBool,
    /// When set, payloads containing `"reject": true` get a 422.
    honor_reject: AtomicBool,
    /// Artificial latency per data call, in milliseconds.
    delay_ms: AtomicU64,
    data_calls: AtomicUsize,
}

impl MockAuthority {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_id: 1,
                ..MockState::default()
            }),
            offline: AtomicBool::new(false),
            honor_reject: AtomicBool::new(true),
            delay_ms: AtomicU64::new(0),
            data_calls: AtomicUsize::new(0),
        })
    }

    async fn gate(&self) -> Result<()> {
        self.data_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Unreachable);
        }
        Ok(())
    }

    fn check_reject(&self, payload: &Value) -> Result<()> {
        if self.honor_reject.load(Ordering::SeqCst)
            && payload.get("reject") == Some(&json!(true))
        {
            return Err(Error::RemoteRejected {
                status: 422,
                message: "rejected by test authority".into(),
            });
        }
        Ok(())
    }

    async fn record(&self, collection: Collection, id: i64) -> Option<Value> {
        let state = self.state.lock().await;
        state
            .collections
            .get(collection.as_str())
            .and_then(|records| records.get(&id))
            .cloned()
    }

    async fn seed(&self, collection: Collection, id: i64, mut payload: Value) {
        payload["id"] = json!(id);
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(id + 1);
        state
            .collections
            .entry(collection.as_str())
            .or_default()
            .insert(id, payload);
    }
}

#[async_trait]
impl RemoteAuthority for MockAuthority {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Unreachable);
        }
        if password != "pw" {
            return Err(Error::RemoteRejected {
                status: 401,
                message: "bad credentials".into(),
            });
        }
        Ok(LoginResponse {
            user: UserInfo {
                id: 1,
                username: username.to_string(),
            },
            token: "mock-token".into(),
        })
    }

    async fn logout(&self, _token: &AuthToken) -> Result<()> {
        Ok(())
    }

    async fn create(
        &self,
        collection: Collection,
        payload: &Value,
        _token: &AuthToken,
    ) -> Result<Value> {
        self.gate().await?;
        self.check_reject(payload)?;
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        let mut stored = payload.clone();
        stored["id"] = json!(id);
        state
            .collections
            .entry(collection.as_str())
            .or_default()
            .insert(id, stored.clone());
        state.call_log.push(format!("create {collection}"));
        Ok(stored)
    }

    async fn update(
        &self,
        collection: Collection,
        id: i64,
        payload: &Value,
        _token: &AuthToken,
    ) -> Result<Value> {
        self.gate().await?;
        self.check_reject(payload)?;
        let mut state = self.state.lock().await;
        let records = state.collections.entry(collection.as_str()).or_default();
        if !records.contains_key(&id) {
            return Err(Error::RemoteRejected {
                status: 404,
                message: format!("{collection}/{id} not found"),
            });
        }
        let mut stored = payload.clone();
        stored["id"] = json!(id);
        records.insert(id, stored.clone());
        state.call_log.push(format!("update {collection} {id}"));
        Ok(stored)
    }

    async fn delete(&self, collection: Collection, id: i64, _token: &AuthToken) -> Result<()> {
        self.gate().await?;
        let mut state = self.state.lock().await;
        let removed = state
            .collections
            .entry(collection.as_str())
            .or_default()
            .remove(&id);
        if removed.is_none() {
            return Err(Error::RemoteRejected {
                status: 404,
                message: format!("{collection}/{id} not found"),
            });
        }
        state.call_log.push(format!("delete {collection} {id}"));
        Ok(())
    }

    async fn list(
        &self,
        collection: Collection,
        filter: Option<(&str, i64)>,
        _token: &AuthToken,
    ) -> Result<Vec<Value>> {
        self.gate().await?;
        let state = self.state.lock().await;
        let records = state
            .collections
            .get(collection.as_str())
            .map(|records| records.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(match filter {
            Some((field, value)) => records
                .into_iter()
                .filter(|record| record.get(field) == Some(&json!(value)))
                .collect(),
            None => records,
        })
    }
}

struct Harness {
    engine: Arc<SyncEngine<MockAuthority>>,
    remote: Arc<MockAuthority>,
    store: Arc<SqliteStore>,
    monitor: Arc<ConnectivityMonitor>,
}

async fn harness(reachable: bool) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let remote = MockAuthority::new();
    let monitor = Arc::new(ConnectivityMonitor::new(reachable));
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&store),
        Arc::clone(&remote),
        Arc::clone(&monitor),
    ));
    // Sessions are normally created by login; tests seed one directly so
    // offline scenarios start authenticated.
    store
        .put_session(&Session::new(
            UserInfo {
                id: 1,
                username: "chw1".into(),
            },
            AuthToken::new("mock-token"),
        ))
        .await
        .unwrap();
    Harness {
        engine,
        remote,
        store,
        monitor,
    }
}

#[tokio::test]
async fn offline_mutation_is_pending_with_one_queue_entry() {
    let h = harness(false).await;
    let result = h
        .engine
        .mutate(
            Collection::Children,
            OperationKind::Create,
            json!({"fullName": "Baby X"}),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.status, SyncStatus::Pending);
    let record = result.record.unwrap();
    assert!(!record.id.is_server());

    // Read-your-writes: the mutation is immediately observable.
    let all = h.store.get_all(Collection::Children).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].payload["fullName"], json!("Baby X"));
    assert_eq!(all[0].sync_status, SyncStatus::Pending);

    let queued = h.store.queued_operations(Collection::Children).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].record_id, record.id);
    assert_eq!(queued[0].user, "chw1");
}

#[tokio::test]
async fn online_create_writes_through_synced() {
    let h = harness(true).await;
    let result = h
        .engine
        .mutate(
            Collection::Children,
            OperationKind::Create,
            json!({"fullName": "Baby Y"}),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.status, SyncStatus::Synced);
    let record = result.record.unwrap();
    assert_eq!(record.id, RecordId::Server(1));
    assert_eq!(h.store.queue_len().await.unwrap(), 0);
    assert!(h.remote.record(Collection::Children, 1).await.is_some());
}

#[tokio::test]
async fn two_children_created_offline_sync_once() {
    let h = harness(false).await;
    for name in ["Baby X", "Baby Y"] {
        let result = h
            .engine
            .mutate(
                Collection::Children,
                OperationKind::Create,
                json!({"fullName": name}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.status, SyncStatus::Pending);
    }
    assert_eq!(h.store.queue_len().await.unwrap(), 2);

    h.monitor.set_reachable(true);
    let report = h.engine.sync_pending().await.unwrap();
    assert_eq!(report.confirmed, 2);
    assert_eq!(report.failed, 0);

    let all = h.store.get_all(Collection::Children).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|r| r.sync_status == SyncStatus::Synced));
    assert!(all.iter().all(|r| r.id.is_server()));
    assert_eq!(h.store.queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn offline_sequence_replays_in_original_order() {
    let h = harness(false).await;
    let created = h
        .engine
        .mutate(
            Collection::Children,
            OperationKind::Create,
            json!({"fullName": "Baby X"}),
            None,
        )
        .await
        .unwrap()
        .record
        .unwrap();
    h.engine
        .mutate(
            Collection::Children,
            OperationKind::Update,
            json!({"fullName": "Baby X", "village": "Kanyama"}),
            Some(created.id.clone()),
        )
        .await
        .unwrap();
    h.engine
        .mutate(
            Collection::Children,
            OperationKind::Update,
            json!({"fullName": "Baby X", "village": "Matero"}),
            Some(created.id.clone()),
        )
        .await
        .unwrap();

    h.monitor.set_reachable(true);
    // First pass confirms the create and re-targets the queued updates to
    // the server id; the updates need no second pass because the remap
    // happens before they replay.
    let report = h.engine.sync_pending().await.unwrap();
    assert_eq!(report.confirmed, 3);
    assert_eq!(h.store.queue_len().await.unwrap(), 0);

    // Same final state as if the mutations had been applied online in order.
    let remote = h.remote.record(Collection::Children, 1).await.unwrap();
    assert_eq!(remote["village"], json!("Matero"));

    let log = h.remote.state.lock().await.call_log.clone();
    assert_eq!(
        log,
        vec!["create children", "update children 1", "update children 1"]
    );
}

#[tokio::test]
async fn failing_operation_does_not_block_the_rest() {
    let h = harness(false).await;
    let rejected = h
        .engine
        .mutate(
            Collection::Children,
            OperationKind::Create,
            json!({"fullName": "Bad", "reject": true}),
            None,
        )
        .await
        .unwrap()
        .record
        .unwrap();
    h.engine
        .mutate(
            Collection::Children,
            OperationKind::Create,
            json!({"fullName": "Good"}),
            None,
        )
        .await
        .unwrap();

    h.monitor.set_reachable(true);
    let report = h.engine.sync_pending().await.unwrap();
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.failed, 1);

    // The rejected record is marked error and still queued; the other
    // one is synced.
    let failed = h
        .store
        .get(Collection::Children, &rejected.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.sync_status, SyncStatus::Error);
    assert_eq!(h.store.queue_len().await.unwrap(), 1);

    // Error records retry on the next pass, not auto-discard.
    h.remote.honor_reject.store(false, Ordering::SeqCst);
    let report = h.engine.sync_pending().await.unwrap();
    assert_eq!(report.confirmed, 1);
    assert_eq!(h.store.queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn offline_delete_replays_remotely() {
    let h = harness(true).await;
    h.remote
        .seed(Collection::Referrals, 5, json!({"childId": 1}))
        .await;
    h.store
        .put(
            Collection::Referrals,
            fieldsync_common::Record::new_synced(5, json!({"childId": 1, "id": 5})),
        )
        .await
        .unwrap();

    h.monitor.set_reachable(false);
    let result = h
        .engine
        .mutate(
            Collection::Referrals,
            OperationKind::Delete,
            Value::Null,
            Some(RecordId::Server(5)),
        )
        .await
        .unwrap();
    assert_eq!(result.status, SyncStatus::Pending);
    assert!(h
        .store
        .get(Collection::Referrals, &RecordId::Server(5))
        .await
        .unwrap()
        .is_none());

    h.monitor.set_reachable(true);
    let report = h.engine.sync_pending().await.unwrap();
    assert_eq!(report.confirmed, 1);
    assert!(h.remote.record(Collection::Referrals, 5).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_pending_is_single_flight() {
    let h = harness(false).await;
    h.engine
        .mutate(
            Collection::Children,
            OperationKind::Create,
            json!({"fullName": "Baby X"}),
            None,
        )
        .await
        .unwrap();
    h.monitor.set_reachable(true);
    h.remote.delay_ms.store(200, Ordering::SeqCst);

    let engine = Arc::clone(&h.engine);
    let slow = tokio::spawn(async move { engine.sync_pending().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Concurrent invocation is a no-op returning immediately.
    let report = h.engine.sync_pending().await.unwrap();
    assert!(report.already_running);

    let slow_report = slow.await.unwrap().unwrap();
    assert_eq!(slow_report.confirmed, 1);
    assert_eq!(h.store.queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn sync_pending_preconditions() {
    let h = harness(false).await;
    assert!(matches!(
        h.engine.sync_pending().await,
        Err(Error::Unreachable)
    ));

    h.monitor.set_reachable(true);
    h.store.clear_session().await.unwrap();
    assert!(matches!(
        h.engine.sync_pending().await,
        Err(Error::Unauthenticated)
    ));
}

#[tokio::test]
async fn refresh_overwrites_synced_but_preserves_pending() {
    let h = harness(true).await;
    h.remote
        .seed(Collection::Children, 1, json!({"fullName": "Server One"}))
        .await;
    h.remote
        .seed(Collection::Children, 2, json!({"fullName": "Server Two"}))
        .await;

    // A stale synced copy of record 1, and a pending offline create.
    h.store
        .put(
            Collection::Children,
            fieldsync_common::Record::new_synced(1, json!({"fullName": "Stale", "id": 1})),
        )
        .await
        .unwrap();
    h.monitor.set_reachable(false);
    let pending = h
        .engine
        .mutate(
            Collection::Children,
            OperationKind::Create,
            json!({"fullName": "Offline Baby"}),
            None,
        )
        .await
        .unwrap()
        .record
        .unwrap();
    h.monitor.set_reachable(true);

    let refreshed = h.engine.refresh_all().await.unwrap();
    assert_eq!(refreshed, 2);

    let one = h
        .store
        .get(Collection::Children, &RecordId::Server(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(one.payload["fullName"], json!("Server One"));
    assert_eq!(one.sync_status, SyncStatus::Synced);

    // Pending record untouched, queue intact.
    let kept = h
        .store
        .get(Collection::Children, &pending.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kept.sync_status, SyncStatus::Pending);
    assert_eq!(h.store.queue_len().await.unwrap(), 1);

    let session = h.store.session().await.unwrap().unwrap();
    assert!(session.last_full_sync.is_some());
}

#[tokio::test]
async fn refresh_does_not_resurrect_offline_deletes() {
    let h = harness(true).await;
    h.remote
        .seed(Collection::Children, 1, json!({"fullName": "Baby X"}))
        .await;
    h.store
        .put(
            Collection::Children,
            fieldsync_common::Record::new_synced(1, json!({"fullName": "Baby X", "id": 1})),
        )
        .await
        .unwrap();

    h.monitor.set_reachable(false);
    h.engine
        .mutate(
            Collection::Children,
            OperationKind::Delete,
            Value::Null,
            Some(RecordId::Server(1)),
        )
        .await
        .unwrap();

    // The authority still lists the record, but the queued delete wins
    // locally until it replays.
    h.monitor.set_reachable(true);
    h.engine.refresh_all().await.unwrap();
    assert!(h
        .store
        .get(Collection::Children, &RecordId::Server(1))
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.store.queue_len().await.unwrap(), 1);

    let report = h.engine.sync_pending().await.unwrap();
    assert_eq!(report.confirmed, 1);
    assert!(h.remote.record(Collection::Children, 1).await.is_none());
}

#[tokio::test]
async fn refresh_requires_reachability() {
    let h = harness(false).await;
    assert!(matches!(
        h.engine.refresh_all().await,
        Err(Error::Unreachable)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn logout_discards_in_flight_replay_result() {
    let h = harness(false).await;
    let created = h
        .engine
        .mutate(
            Collection::Children,
            OperationKind::Create,
            json!({"fullName": "Baby X"}),
            None,
        )
        .await
        .unwrap()
        .record
        .unwrap();
    h.monitor.set_reachable(true);
    h.remote.delay_ms.store(200, Ordering::SeqCst);

    let engine = Arc::clone(&h.engine);
    let replay = tokio::spawn(async move { engine.sync_pending().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.engine.logout().await.unwrap();

    // The in-flight result is discarded: the pass errors out and the
    // confirmation was not applied.
    assert!(matches!(
        replay.await.unwrap(),
        Err(Error::Unauthenticated)
    ));
    assert_eq!(h.store.queue_len().await.unwrap(), 1);
    let record = h
        .store
        .get(Collection::Children, &created.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.id.is_server());
}

#[tokio::test]
async fn login_persists_session_and_refreshes() {
    let h = harness(true).await;
    h.store.clear_session().await.unwrap();
    h.remote
        .seed(Collection::Screenings, 3, json!({"childId": 1, "muacMm": 118}))
        .await;

    let session = h.engine.login("chw1", "pw").await.unwrap();
    assert_eq!(session.user.username, "chw1");

    let stored = h.store.session().await.unwrap().unwrap();
    assert_eq!(stored.user.username, "chw1");
    // Post-login refresh pulled remote state down.
    let screenings = h.store.get_all(Collection::Screenings).await.unwrap();
    assert_eq!(screenings.len(), 1);

    assert!(matches!(
        h.engine.login("chw1", "wrong").await,
        Err(Error::RemoteRejected { status: 401, .. })
    ));
}

#[tokio::test]
async fn remote_transport_failure_flips_monitor() {
    let h = harness(true).await;
    h.remote.offline.store(true, Ordering::SeqCst);

    // Mutation still succeeds locally (falls back to pending) and the
    // failed call corroborates unreachability.
    let result = h
        .engine
        .mutate(
            Collection::Children,
            OperationKind::Create,
            json!({"fullName": "Baby X"}),
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.status, SyncStatus::Pending);
    assert!(!h.monitor.is_reachable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn became_reachable_triggers_replay_and_shutdown_is_deterministic() {
    let h = harness(false).await;
    h.engine
        .mutate(
            Collection::Children,
            OperationKind::Create,
            json!({"fullName": "Baby X"}),
            None,
        )
        .await
        .unwrap();

    let handle = h
        .engine
        .start(SyncConfig::default().with_sync_interval(Duration::from_secs(3600)));

    h.monitor.set_reachable(true);
    let mut drained = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if h.store.queue_len().await.unwrap() == 0 {
            drained = true;
            break;
        }
    }
    assert!(drained, "became-reachable did not trigger a replay pass");

    handle.shutdown().await;
}

//! Core reconciliation engine.
//!
//! Per record the engine drives the state machine
//! `Synced -> (local mutation) -> Pending -> (remote confirms) -> Synced`,
//! with `Pending -> Error` on rejection or transport failure. `Error`
//! records stay queued and are retried on the next replay pass.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use fieldsync_common::{
    AuthToken, Collection, Error, OperationKind, PendingOperation, Record, RecordId, Result,
    Session, SyncStatus,
};
use fieldsync_store::SqliteStore;

use crate::connectivity::ConnectivityMonitor;
use crate::remote::RemoteAuthority;
use crate::scheduler::{spawn_sync_task, SyncConfig, SyncTaskHandle};

/// Result of a queue replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Operations confirmed by the authority and dequeued.
    pub confirmed: usize,
    /// Operations that failed and remain queued.
    pub failed: usize,
    /// Set when another replay pass was already in flight and this call
    /// was a no-op.
    pub already_running: bool,
}

impl SyncReport {
    pub fn already_running() -> Self {
        Self {
            already_running: true,
            ..Self::default()
        }
    }
}

/// Outcome of [`SyncEngine::mutate`], observable immediately by the
/// caller whether the mutation went through remotely or was queued.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult {
    /// The record as held locally after the mutation; `None` for deletes.
    pub record: Option<Record>,
    /// `Synced` when the authority confirmed immediately, `Pending` when
    /// the mutation was queued for later replay.
    pub status: SyncStatus,
}

/// Orchestrates local mutations, queue replay and full-state refresh
/// against the remote authority.
///
/// One engine instance exists per process; construct it at startup,
/// inject it where needed, and stop its background task via
/// [`SyncTaskHandle::shutdown`] on teardown.
pub struct SyncEngine<R: RemoteAuthority> {
    store: Arc<SqliteStore>,
    remote: Arc<R>,
    monitor: Arc<ConnectivityMonitor>,
    /// Queue replay is single-flight: only one pass at a time, so a given
    /// PendingOperation never has more than one outbound attempt.
    replay_in_flight: AtomicBool,
    /// Bumped on logout; in-flight remote results from an older
    /// generation are discarded instead of written back.
    session_generation: AtomicU64,
}

impl<R: RemoteAuthority> SyncEngine<R> {
    pub fn new(store: Arc<SqliteStore>, remote: Arc<R>, monitor: Arc<ConnectivityMonitor>) -> Self {
        Self {
            store,
            remote,
            monitor,
            replay_in_flight: AtomicBool::new(false),
            session_generation: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    /// The current session, if one is held.
    pub async fn session(&self) -> Result<Option<Session>> {
        self.store.session().await
    }

    /// Authenticate against the remote authority and persist the session.
    ///
    /// On success a full-state refresh is attempted; its failure is
    /// logged, not fatal, since pending work reconciles later anyway.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
        let response = self.remote.login(username, password).await.map_err(|err| {
            self.note_remote_failure(&err);
            err
        })?;
        let session = Session::new(response.user, AuthToken::new(response.token));
        self.store.put_session(&session).await?;
        info!(user = %session.user.username, "logged in");

        if let Err(err) = self.refresh_all().await {
            warn!(error = %err, "post-login refresh failed");
        }
        Ok(session)
    }

    /// Clear the session. Results of remote calls still in flight under
    /// the old session are discarded.
    pub async fn logout(&self) -> Result<()> {
        self.session_generation.fetch_add(1, Ordering::SeqCst);
        let session = self.store.session().await?;
        self.store.clear_session().await?;

        if let Some(session) = session {
            info!(user = %session.user.username, "logged out");
            if self.monitor.is_reachable() {
                if let Err(err) = self.remote.logout(&session.token).await {
                    debug!(error = %err, "remote logout failed");
                }
            }
        }
        Ok(())
    }

    /// Apply a mutation, online or offline.
    ///
    /// Reachable: the remote call is attempted first and on success the
    /// authoritative result is written through marked `Synced`. On any
    /// failure (including unreachable) the mutation lands in the local
    /// store marked `Pending` with a queue entry, so the caller always
    /// observes their own write.
    pub async fn mutate(
        &self,
        collection: Collection,
        kind: OperationKind,
        payload: Value,
        id: Option<RecordId>,
    ) -> Result<MutationResult> {
        let session = self.store.session().await?.ok_or(Error::Unauthenticated)?;
        let generation = self.generation();

        match kind {
            OperationKind::Create => {
                if self.monitor.is_reachable() {
                    match self.remote.create(collection, &payload, &session.token).await {
                        Ok(returned) => {
                            self.check_generation(generation)?;
                            let id = server_id_of(&returned)?;
                            let record =
                                self.store.put(collection, Record::new_synced(id, returned)).await?;
                            return Ok(MutationResult {
                                record: Some(record),
                                status: SyncStatus::Synced,
                            });
                        }
                        Err(err) => self.note_remote_failure(&err),
                    }
                }
                let (record, _op) = self
                    .store
                    .apply_local_upsert(
                        collection,
                        Record::new_local(payload),
                        OperationKind::Create,
                        &session.user.username,
                    )
                    .await?;
                Ok(MutationResult {
                    record: Some(record),
                    status: SyncStatus::Pending,
                })
            }

            OperationKind::Update => {
                let id = id.ok_or_else(|| {
                    Error::InvalidInput("update requires a record id".into())
                })?;
                if self.monitor.is_reachable() {
                    if let Some(server_id) = id.server_id() {
                        match self
                            .remote
                            .update(collection, server_id, &payload, &session.token)
                            .await
                        {
                            Ok(returned) => {
                                self.check_generation(generation)?;
                                let record = self
                                    .store
                                    .put(collection, Record::new_synced(server_id, returned))
                                    .await?;
                                return Ok(MutationResult {
                                    record: Some(record),
                                    status: SyncStatus::Synced,
                                });
                            }
                            Err(err) => self.note_remote_failure(&err),
                        }
                    }
                }
                let record = Record {
                    id,
                    payload,
                    sync_status: SyncStatus::Pending,
                    last_modified: Utc::now(),
                };
                let (record, _op) = self
                    .store
                    .apply_local_upsert(
                        collection,
                        record,
                        OperationKind::Update,
                        &session.user.username,
                    )
                    .await?;
                Ok(MutationResult {
                    record: Some(record),
                    status: SyncStatus::Pending,
                })
            }

            OperationKind::Delete => {
                let id = id.ok_or_else(|| {
                    Error::InvalidInput("delete requires a record id".into())
                })?;
                if self.monitor.is_reachable() {
                    if let Some(server_id) = id.server_id() {
                        match self.remote.delete(collection, server_id, &session.token).await {
                            Ok(()) => {
                                self.check_generation(generation)?;
                                self.store.delete(collection, &id).await?;
                                return Ok(MutationResult {
                                    record: None,
                                    status: SyncStatus::Synced,
                                });
                            }
                            Err(err) => self.note_remote_failure(&err),
                        }
                    }
                }
                self.store
                    .apply_local_delete(collection, &id, &session.user.username)
                    .await?;
                Ok(MutationResult {
                    record: None,
                    status: SyncStatus::Pending,
                })
            }
        }
    }

    /// Replay the pending-operation queue against the remote authority.
    ///
    /// Single-flight: a call while a pass is in flight is a no-op that
    /// returns immediately. Requires reachability and a session; per
    /// collection the queue replays in enqueue order, and one failing
    /// operation never blocks the rest.
    pub async fn sync_pending(&self) -> Result<SyncReport> {
        if self
            .replay_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("queue replay already in flight; skipping");
            return Ok(SyncReport::already_running());
        }
        let _guard = ReplayGuard(&self.replay_in_flight);

        if !self.monitor.is_reachable() {
            return Err(Error::Unreachable);
        }
        let session = self.store.session().await?.ok_or(Error::Unauthenticated)?;
        let generation = self.generation();

        let mut report = SyncReport::default();
        for collection in Collection::ALL {
            let ops = self.store.queued_operations(collection).await?;
            for op in ops {
                // Confirming an earlier create may have re-targeted this
                // entry to the server id; replay the current row.
                let Some(op) = self.store.queued_operation(op.seq).await? else {
                    continue;
                };
                match self.replay_one(&op, &session, generation).await {
                    Ok(()) => report.confirmed += 1,
                    // Session cleared mid-pass: discard and stop.
                    Err(Error::Unauthenticated) => {
                        info!("session cleared during replay; discarding pass");
                        return Err(Error::Unauthenticated);
                    }
                    Err(err) => {
                        report.failed += 1;
                        warn!(
                            %collection,
                            seq = op.seq,
                            error = %err,
                            "replay failed; operation left in queue"
                        );
                        self.note_remote_failure(&err);
                        // Deletes may have no local record to flag.
                        if let Err(mark_err) = self
                            .store
                            .set_sync_status(collection, &op.record_id, SyncStatus::Error)
                            .await
                        {
                            debug!(error = %mark_err, "could not mark record error");
                        }
                    }
                }
            }
        }

        info!(
            confirmed = report.confirmed,
            failed = report.failed,
            "queue replay finished"
        );
        Ok(report)
    }

    async fn replay_one(
        &self,
        op: &PendingOperation,
        session: &Session,
        generation: u64,
    ) -> Result<()> {
        match op.kind {
            OperationKind::Create => {
                let payload = op
                    .payload
                    .as_ref()
                    .ok_or_else(|| Error::InvalidInput("queued create without payload".into()))?;
                let returned = self.remote.create(op.collection, payload, &session.token).await?;
                self.check_generation(generation)?;
                let record = Record::new_synced(server_id_of(&returned)?, returned);
                self.store
                    .confirm_operation(op.seq, op.collection, &op.record_id, Some(&record))
                    .await
            }
            OperationKind::Update => {
                let server_id = op.record_id.server_id().ok_or_else(|| {
                    // The create this update depends on has not been
                    // confirmed yet; retried next pass after the remap.
                    Error::InvalidInput("update target has no server id yet".into())
                })?;
                let payload = op
                    .payload
                    .as_ref()
                    .ok_or_else(|| Error::InvalidInput("queued update without payload".into()))?;
                let returned = self
                    .remote
                    .update(op.collection, server_id, payload, &session.token)
                    .await?;
                self.check_generation(generation)?;
                let record = Record::new_synced(server_id, returned);
                self.store
                    .confirm_operation(op.seq, op.collection, &op.record_id, Some(&record))
                    .await
            }
            OperationKind::Delete => {
                let server_id = op.record_id.server_id().ok_or_else(|| {
                    Error::InvalidInput("delete target has no server id yet".into())
                })?;
                self.remote.delete(op.collection, server_id, &session.token).await?;
                self.check_generation(generation)?;
                self.store
                    .confirm_operation(op.seq, op.collection, &op.record_id, None)
                    .await
            }
        }
    }

    /// Pull full collection state from the authority and overwrite local
    /// records marked `Synced`.
    ///
    /// Records currently `Pending` or `Error` keep their local payload;
    /// they reconcile on the next replay pass and are never silently
    /// dropped by a refresh. Returns the number of records refreshed.
    pub async fn refresh_all(&self) -> Result<usize> {
        if !self.monitor.is_reachable() {
            return Err(Error::Unreachable);
        }
        let mut session = self.store.session().await?.ok_or(Error::Unauthenticated)?;
        let generation = self.generation();

        let mut refreshed = 0;
        for collection in Collection::ALL {
            let values = self
                .remote
                .list(collection, None, &session.token)
                .await
                .map_err(|err| {
                    self.note_remote_failure(&err);
                    err
                })?;
            self.check_generation(generation)?;

            let queued: HashSet<RecordId> = self
                .store
                .queued_operations(collection)
                .await?
                .into_iter()
                .map(|op| op.record_id)
                .collect();

            for value in values {
                let Some(id) = value.get("id").and_then(Value::as_i64) else {
                    warn!(%collection, "skipping listed record without integer id");
                    continue;
                };
                let record_id = RecordId::Server(id);
                // Records with queued work keep their local state; in
                // particular a queued delete has already removed the row
                // and writing the listed copy back would undo it.
                if queued.contains(&record_id) {
                    continue;
                }
                if let Some(existing) = self.store.get(collection, &record_id).await? {
                    if existing.sync_status != SyncStatus::Synced {
                        continue;
                    }
                }
                self.store.put(collection, Record::new_synced(id, value)).await?;
                refreshed += 1;
            }
        }

        // Do not resurrect a session cleared while we were refreshing.
        self.check_generation(generation)?;
        session.last_full_sync = Some(Utc::now());
        self.store.put_session(&session).await?;
        info!(refreshed, "full refresh complete");
        Ok(refreshed)
    }

    fn generation(&self) -> u64 {
        self.session_generation.load(Ordering::SeqCst)
    }

    fn check_generation(&self, observed: u64) -> Result<()> {
        if self.generation() == observed {
            Ok(())
        } else {
            Err(Error::Unauthenticated)
        }
    }

    fn note_remote_failure(&self, err: &Error) {
        match err {
            Error::Http(_) | Error::Unreachable => self.monitor.report_remote_failure(),
            _ => {}
        }
    }
}

impl<R: RemoteAuthority + 'static> SyncEngine<R> {
    /// Spawn the periodic replay task; see [`spawn_sync_task`].
    pub fn start(self: &Arc<Self>, config: SyncConfig) -> SyncTaskHandle {
        spawn_sync_task(Arc::clone(self), config)
    }
}

struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn server_id_of(value: &Value) -> Result<i64> {
    value
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::InvalidInput("authority response missing integer id".into()))
}

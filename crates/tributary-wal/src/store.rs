//! The single-writer WAL store.
//!
//! LSNs come from one in-process counter, advanced together with buffer
//! insertion inside a single critical section, so an assigned LSN always
//! has a buffered entry behind it and the sequence stays gap-free. Pages
//! flush on a background task when they fill, when the flush interval
//! elapses, or on an explicit `flush()`.
//!
//! # Unpersisted LSNs
//!
//! When a flush fails, the batch is re-queued at the buffer head and the
//! store becomes *wedged*: new appends fail with `Storage` until the
//! re-queued batch persists on a later flush. This is the "refuse new
//! appends until the assigned LSN succeeds" recovery strategy; assigned
//! LSNs are never abandoned and never reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tributary_core::metrics::{
    WAL_APPEND_COUNT, WAL_APPEND_LATENCY, WAL_BUFFERED_ENTRIES, WAL_CURRENT_LSN, WAL_DURABLE_LSN,
    WAL_FLUSH_COUNT,
};
use tributary_core::{
    AppendAck, AppendRequest, BranchId, CoreError, CoreResult, Lsn, WalConfig, WalEntry,
};

use crate::backend::WalBackend;
use crate::buffer::PageBuffer;

/// Point-in-time view of the store for the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct WalStats {
    pub current_lsn: Lsn,
    pub durable_lsn: Lsn,
    pub buffered_entries: usize,
    pub buffer_capacity: usize,
    /// Set while the store refuses appends pending a flush retry.
    pub wedged: Option<String>,
}

struct Inner {
    buffer: PageBuffer,
    wedged: Option<String>,
}

/// Durable, strictly ordered append log. See the module docs for the
/// buffering and recovery protocol.
pub struct WalStore {
    backend: Arc<dyn WalBackend>,
    config: WalConfig,
    enabled: bool,
    inner: Mutex<Inner>,
    /// Last assigned LSN. Mutated only inside the append critical section;
    /// loads are lock-free.
    last_lsn: AtomicU64,
    /// Highest LSN known persisted.
    durable_lsn: AtomicU64,
    /// Signalled by the flusher when buffer space frees up.
    space: Notify,
    /// Signalled by appenders when a page seals.
    flush_wanted: Notify,
    /// Serializes flushes so retry batches keep LSN order.
    flush_serial: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl WalStore {
    /// Opens the store, recovering the LSN counter from the backend's
    /// highest persisted entry, and starts the background flusher.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the recovery scan fails.
    pub async fn open(
        backend: Arc<dyn WalBackend>,
        config: WalConfig,
        enabled: bool,
    ) -> CoreResult<Arc<Self>> {
        let recovered = if enabled {
            backend.max_lsn().await?
        } else {
            Lsn::ZERO
        };

        let store = Arc::new(Self {
            backend,
            inner: Mutex::new(Inner {
                buffer: PageBuffer::new(config.page_size, config.page_count),
                wedged: None,
            }),
            last_lsn: AtomicU64::new(recovered.value()),
            durable_lsn: AtomicU64::new(recovered.value()),
            space: Notify::new(),
            flush_wanted: Notify::new(),
            flush_serial: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            enabled,
            config,
        });

        if enabled {
            info!(recovered_lsn = recovered.value(), "wal store opened");
            WAL_CURRENT_LSN.set(i64::try_from(recovered.value()).unwrap_or(i64::MAX));
            WAL_DURABLE_LSN.set(i64::try_from(recovered.value()).unwrap_or(i64::MAX));
            Self::spawn_flusher(&store);
        }
        Ok(store)
    }

    fn spawn_flusher(store: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(store);
        let shutdown = store.shutdown.clone();
        let interval = store.config.flush_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let Some(store) = weak.upgrade() else { break };
                tokio::select! {
                    () = shutdown.cancelled() => {
                        let _ = store.flush().await;
                        break;
                    }
                    _ = ticker.tick() => {
                        let _ = store.flush().await;
                    }
                    () = store.flush_wanted.notified() => {
                        let _ = store.flush().await;
                    }
                }
            }
            debug!("wal flusher stopped");
        });
    }

    /// Appends one entry; the returned ack carries the assigned LSN.
    ///
    /// Blocks only while the buffer is full (backpressure). Once the LSN is
    /// assigned the append can no longer be cancelled; cancellation at that
    /// point means "succeeded, caller did not wait".
    ///
    /// # Errors
    ///
    /// `Disabled`, `Validation`, `Storage` (wedged store), or `Cancelled`.
    pub async fn append(
        &self,
        request: AppendRequest,
        cancel: &CancellationToken,
    ) -> CoreResult<AppendAck> {
        let operation = request.operation;
        let started = Instant::now();
        let result = self.append_batch(vec![request], cancel).await;

        WAL_APPEND_LATENCY
            .with_label_values(&[operation.as_str()])
            .observe(started.elapsed().as_secs_f64());
        match result {
            Ok(acks) => {
                WAL_APPEND_COUNT
                    .with_label_values(&[operation.as_str(), "ok"])
                    .inc();
                Ok(acks[0])
            }
            Err(err) => {
                WAL_APPEND_COUNT
                    .with_label_values(&[operation.as_str(), err.code()])
                    .inc();
                Err(err)
            }
        }
    }

    /// Appends a batch; all entries receive consecutive LSNs assigned in
    /// one critical section and share one timestamp.
    ///
    /// # Errors
    ///
    /// As [`append`](Self::append); additionally `Validation` when the
    /// batch exceeds total buffer capacity.
    pub async fn append_batch(
        &self,
        requests: Vec<AppendRequest>,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<AppendAck>> {
        self.ensure_enabled()?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        for request in &requests {
            request.validate()?;
        }

        let needed = requests.len();
        {
            let inner = self.inner.lock();
            if needed > inner.buffer.capacity() {
                return Err(CoreError::validation(format!(
                    "batch of {needed} exceeds buffer capacity {}",
                    inner.buffer.capacity()
                )));
            }
        }

        let mut requests = Some(requests);
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            // Arm the waiter before re-checking, so a flush that completes
            // between the check and the await is not missed.
            let space = self.space.notified();

            {
                let mut inner = self.inner.lock();
                if let Some(message) = &inner.wedged {
                    return Err(CoreError::storage(format!(
                        "wal store is wedged pending flush retry: {message}"
                    )));
                }
                if inner.buffer.free() >= needed {
                    let batch = requests.take().expect("batch consumed once");
                    let timestamp = Utc::now();
                    let mut acks = Vec::with_capacity(needed);
                    let mut sealed = false;
                    for request in batch {
                        let lsn = Lsn::new(self.last_lsn.load(Ordering::Relaxed)).next();
                        self.last_lsn.store(lsn.value(), Ordering::Release);
                        sealed |= inner.buffer.push(request.into_entry(lsn, timestamp));
                        acks.push(AppendAck { lsn, timestamp });
                    }
                    WAL_CURRENT_LSN
                        .set(i64::try_from(self.last_lsn.load(Ordering::Relaxed)).unwrap_or(i64::MAX));
                    WAL_BUFFERED_ENTRIES.set(inner.buffer.len() as i64);
                    drop(inner);

                    if sealed {
                        self.flush_wanted.notify_one();
                    }
                    return Ok(acks);
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(CoreError::Cancelled),
                () = self.shutdown.cancelled() => {
                    return Err(CoreError::storage("wal store is shutting down"));
                }
                () = space => {}
            }
        }
    }

    /// Persists every buffered entry. Serialized; concurrent callers queue.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the backend rejects the batch; the batch is
    /// re-queued and the store wedges until a retry succeeds.
    pub async fn flush(&self) -> CoreResult<()> {
        let _serial = self.flush_serial.lock().await;

        let batch = {
            let mut inner = self.inner.lock();
            inner.buffer.drain_all()
        };
        if batch.is_empty() {
            return Ok(());
        }

        let last = batch[batch.len() - 1].lsn;
        match self.backend.persist(&batch).await {
            Ok(()) => {
                self.durable_lsn.store(last.value(), Ordering::Release);
                WAL_DURABLE_LSN.set(i64::try_from(last.value()).unwrap_or(i64::MAX));
                WAL_FLUSH_COUNT.with_label_values(&["ok"]).inc();
                let was_wedged = {
                    let mut inner = self.inner.lock();
                    WAL_BUFFERED_ENTRIES.set(inner.buffer.len() as i64);
                    inner.wedged.take().is_some()
                };
                if was_wedged {
                    info!(durable_lsn = last.value(), "wal store unwedged");
                }
                self.space.notify_waiters();
                Ok(())
            }
            Err(err) => {
                WAL_FLUSH_COUNT.with_label_values(&["error"]).inc();
                let message = err.to_string();
                {
                    let mut inner = self.inner.lock();
                    inner.buffer.requeue_front(batch);
                    inner.wedged = Some(message.clone());
                }
                warn!(error = %message, "wal flush failed; store wedged until retry");
                Err(err)
            }
        }
    }

    /// Last assigned LSN (not necessarily durable yet).
    #[must_use]
    pub fn current_lsn(&self) -> Lsn {
        Lsn::new(self.last_lsn.load(Ordering::Acquire))
    }

    /// Highest LSN known persisted.
    #[must_use]
    pub fn durable_lsn(&self) -> Lsn {
        Lsn::new(self.durable_lsn.load(Ordering::Acquire))
    }

    /// Store statistics for the monitor.
    #[must_use]
    pub fn stats(&self) -> WalStats {
        let inner = self.inner.lock();
        WalStats {
            current_lsn: self.current_lsn(),
            durable_lsn: self.durable_lsn(),
            buffered_entries: inner.buffer.len(),
            buffer_capacity: inner.buffer.capacity(),
            wedged: inner.wedged.clone(),
        }
    }

    /// Entries with `start <= lsn <= end`, strictly ascending.
    ///
    /// Reads flush first, so every LSN assigned before the call is visible.
    ///
    /// # Errors
    ///
    /// `Disabled`, `Storage`, or `Cancelled`.
    pub async fn get_range(
        &self,
        start: Lsn,
        end: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<WalEntry>> {
        self.read_through(cancel, self.backend.load_range(start, end))
            .await
    }

    /// Entries tagged to `branch_id` within `[start, end]`.
    ///
    /// # Errors
    ///
    /// `Disabled`, `Storage`, or `Cancelled`.
    pub async fn get_branch_entries(
        &self,
        branch_id: BranchId,
        start: Lsn,
        end: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<WalEntry>> {
        self.read_through(cancel, self.backend.load_branch_range(branch_id, start, end))
            .await
    }

    /// Entries targeting `collection` within `[start, end]`.
    ///
    /// # Errors
    ///
    /// `Disabled`, `Storage`, or `Cancelled`.
    pub async fn get_collection_entries(
        &self,
        collection: &str,
        start: Lsn,
        end: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<WalEntry>> {
        self.read_through(
            cancel,
            self.backend.load_collection_range(collection, start, end),
        )
        .await
    }

    /// Highest LSN whose timestamp is `<= timestamp`, ties broken by
    /// highest LSN; `Lsn::ZERO` when none qualifies.
    ///
    /// # Errors
    ///
    /// `Disabled`, `Storage`, or `Cancelled`.
    pub async fn find_lsn_at_or_before(
        &self,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> CoreResult<Lsn> {
        self.read_through(cancel, self.backend.lsn_at_or_before(timestamp))
            .await
    }

    /// Highest LSN tagged to `branch_id`; the reconciliation input for
    /// effective branch heads.
    ///
    /// # Errors
    ///
    /// `Disabled`, `Storage`, or `Cancelled`.
    pub async fn max_branch_lsn(
        &self,
        branch_id: BranchId,
        cancel: &CancellationToken,
    ) -> CoreResult<Lsn> {
        self.read_through(cancel, self.backend.max_branch_lsn(branch_id))
            .await
    }

    /// Distinct collections touched in `[start, end]`.
    ///
    /// # Errors
    ///
    /// `Disabled`, `Storage`, or `Cancelled`.
    pub async fn modified_collections(
        &self,
        start: Lsn,
        end: Lsn,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<String>> {
        self.read_through(cancel, self.backend.collections_in_range(start, end))
            .await
    }

    /// Flushes outstanding pages and stops the background flusher.
    ///
    /// # Errors
    ///
    /// Returns the final flush's error, if any.
    pub async fn close(&self) -> CoreResult<()> {
        self.shutdown.cancel();
        if self.enabled {
            self.flush().await
        } else {
            Ok(())
        }
    }

    fn ensure_enabled(&self) -> CoreResult<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(CoreError::Disabled)
        }
    }

    async fn read_through<T>(
        &self,
        cancel: &CancellationToken,
        load: impl std::future::Future<Output = CoreResult<T>>,
    ) -> CoreResult<T> {
        self.ensure_enabled()?;
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        // Push pending pages down first so the read observes every LSN
        // assigned before it began.
        self.flush().await?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CoreError::Cancelled),
            result = load => result,
        }
    }
}

impl Drop for WalStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tributary_core::{Document, DocumentId, ProjectId};

    use crate::memory::MemoryWalBackend;

    fn insert_req(project: ProjectId, branch: BranchId, n: u64) -> AppendRequest {
        AppendRequest::insert(
            project,
            branch,
            "users",
            DocumentId::from_string(format!("doc-{n}")),
            Document::new(),
        )
    }

    fn small_config() -> WalConfig {
        WalConfig {
            page_size: 2,
            page_count: 2,
            flush_interval: Duration::from_millis(5),
        }
    }

    async fn open_store(backend: Arc<MemoryWalBackend>) -> Arc<WalStore> {
        WalStore::open(backend, small_config(), true).await.unwrap()
    }

    #[tokio::test]
    async fn lsns_start_at_one_and_are_gap_free() {
        let store = open_store(Arc::new(MemoryWalBackend::new())).await;
        let cancel = CancellationToken::new();
        let project = ProjectId::new();
        let branch = BranchId::new();

        for expected in 1..=5u64 {
            let ack = store
                .append(insert_req(project, branch, expected), &cancel)
                .await
                .unwrap();
            assert_eq!(ack.lsn, Lsn::new(expected));
        }
        assert_eq!(store.current_lsn(), Lsn::new(5));
    }

    #[tokio::test]
    async fn batch_lsns_are_consecutive() {
        let store = open_store(Arc::new(MemoryWalBackend::new())).await;
        let cancel = CancellationToken::new();
        let project = ProjectId::new();
        let branch = BranchId::new();

        let acks = store
            .append_batch(
                (1..=3).map(|n| insert_req(project, branch, n)).collect(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(
            acks.iter().map(|a| a.lsn.value()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn reads_observe_every_assigned_lsn() {
        let store = open_store(Arc::new(MemoryWalBackend::new())).await;
        let cancel = CancellationToken::new();
        let project = ProjectId::new();
        let branch = BranchId::new();

        store
            .append(insert_req(project, branch, 1), &cancel)
            .await
            .unwrap();
        let entries = store
            .get_range(Lsn::new(1), store.current_lsn(), &cancel)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].lsn, Lsn::new(1));
    }

    #[tokio::test]
    async fn restart_resumes_the_sequence() {
        let backend = Arc::new(MemoryWalBackend::new());
        let cancel = CancellationToken::new();
        let project = ProjectId::new();
        let branch = BranchId::new();

        let store = open_store(backend.clone()).await;
        for n in 1..=3 {
            store.append(insert_req(project, branch, n), &cancel).await.unwrap();
        }
        store.close().await.unwrap();
        drop(store);

        let reopened = open_store(backend).await;
        assert_eq!(reopened.current_lsn(), Lsn::new(3));
        let ack = reopened
            .append(insert_req(project, branch, 4), &cancel)
            .await
            .unwrap();
        assert_eq!(ack.lsn, Lsn::new(4));
    }

    #[tokio::test]
    async fn flush_failure_wedges_until_retry_succeeds() {
        let backend = Arc::new(MemoryWalBackend::new());
        let store = WalStore::open(
            backend.clone(),
            WalConfig {
                page_size: 8,
                page_count: 2,
                // Long interval keeps the background flusher out of the way.
                flush_interval: Duration::from_secs(3600),
            },
            true,
        )
        .await
        .unwrap();
        let cancel = CancellationToken::new();
        let project = ProjectId::new();
        let branch = BranchId::new();

        store.append(insert_req(project, branch, 1), &cancel).await.unwrap();
        backend.inject_persist_failures(1);
        assert!(matches!(
            store.flush().await,
            Err(CoreError::Storage { .. })
        ));
        assert!(store.stats().wedged.is_some());

        // Wedged store refuses new appends.
        assert!(matches!(
            store.append(insert_req(project, branch, 2), &cancel).await,
            Err(CoreError::Storage { .. })
        ));

        // Retry drains the re-queued batch and unwedges.
        store.flush().await.unwrap();
        assert!(store.stats().wedged.is_none());
        let ack = store.append(insert_req(project, branch, 2), &cancel).await.unwrap();
        assert_eq!(ack.lsn, Lsn::new(2));

        store.flush().await.unwrap();
        assert_eq!(backend.len(), 2);
    }

    #[tokio::test]
    async fn full_buffer_applies_backpressure() {
        let backend = Arc::new(MemoryWalBackend::new());
        let store = WalStore::open(
            backend,
            WalConfig {
                page_size: 1,
                page_count: 1,
                flush_interval: Duration::from_millis(5),
            },
            true,
        )
        .await
        .unwrap();
        let cancel = CancellationToken::new();
        let project = ProjectId::new();
        let branch = BranchId::new();

        // Capacity is one entry; the second append must wait for the
        // background flusher to drain the first.
        store.append(insert_req(project, branch, 1), &cancel).await.unwrap();
        let slow = tokio::time::timeout(
            Duration::from_secs(5),
            store.append(insert_req(project, branch, 2), &cancel),
        )
        .await
        .expect("backpressured append should complete once a flush runs")
        .unwrap();
        assert_eq!(slow.lsn, Lsn::new(2));
    }

    #[tokio::test]
    async fn cancellation_before_assignment_leaves_no_trace() {
        let store = open_store(Arc::new(MemoryWalBackend::new())).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = store
            .append(insert_req(ProjectId::new(), BranchId::new(), 1), &cancel)
            .await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
        assert_eq!(store.current_lsn(), Lsn::ZERO);
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let store = open_store(Arc::new(MemoryWalBackend::new())).await;
        let cancel = CancellationToken::new();
        let project = ProjectId::new();
        let branch = BranchId::new();

        let result = store
            .append_batch(
                (1..=5).map(|n| insert_req(project, branch, n)).collect(),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(CoreError::Validation { .. })));
    }

    #[tokio::test]
    async fn disabled_store_is_inert() {
        let store = WalStore::open(Arc::new(MemoryWalBackend::new()), small_config(), false)
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        assert!(matches!(
            store
                .append(insert_req(ProjectId::new(), BranchId::new(), 1), &cancel)
                .await,
            Err(CoreError::Disabled)
        ));
        assert!(matches!(
            store.get_range(Lsn::new(1), Lsn::new(10), &cancel).await,
            Err(CoreError::Disabled)
        ));
    }

    #[tokio::test]
    async fn time_index_resolves_through_the_store() {
        let store = open_store(Arc::new(MemoryWalBackend::new())).await;
        let cancel = CancellationToken::new();
        let project = ProjectId::new();
        let branch = BranchId::new();

        let first = store.append(insert_req(project, branch, 1), &cancel).await.unwrap();
        let second = store.append(insert_req(project, branch, 2), &cancel).await.unwrap();

        let at_first = store
            .find_lsn_at_or_before(first.timestamp, &cancel)
            .await
            .unwrap();
        assert!(at_first >= first.lsn);
        let at_second = store
            .find_lsn_at_or_before(second.timestamp, &cancel)
            .await
            .unwrap();
        assert_eq!(at_second, second.lsn);
    }
}

//! Historical state reconstruction.
//!
//! A branch's visible history is described by ancestry windows: its own
//! entries up to the target LSN, plus each ancestor's entries up to the
//! fork point recorded when the branch (or an intermediate ancestor) was
//! created. Replay admits exactly the entries whose `(branch, lsn)` falls
//! in a window and applies them in LSN order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tributary_core::metrics::MATERIALIZE_LATENCY;
use tributary_core::{
    BranchDescriptor, BranchId, CoreError, CoreResult, Document, DocumentId, Lsn, OperationKind,
    Payload, SnapshotCacheConfig, WalEntry,
};
use tributary_registry::Registry;
use tributary_wal::WalStore;

use crate::cache::{CollectionState, SnapshotCache, SnapshotKey};

/// All collections of a branch at one LSN, keyed by collection name.
/// Collections with no live documents are omitted.
pub type BranchState = HashMap<String, CollectionState>;

/// One ancestry hop: entries tagged `branch_id` with `lsn <= max_lsn` are
/// visible.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VisibilityWindow {
    pub branch_id: BranchId,
    pub max_lsn: Lsn,
}

/// Reconstructs document state by replaying WAL entries visible to a
/// branch up to a target LSN.
pub struct Materializer {
    wal: Arc<WalStore>,
    registry: Arc<Registry>,
    cache: SnapshotCache,
}

impl Materializer {
    #[must_use]
    pub fn new(
        wal: Arc<WalStore>,
        registry: Arc<Registry>,
        cache_config: &SnapshotCacheConfig,
    ) -> Self {
        Self {
            wal,
            registry,
            cache: SnapshotCache::new(cache_config),
        }
    }

    /// The branch's maximum reachable position: the registry pointer or
    /// the highest WAL entry tagged to the branch, whichever is greater.
    /// WAL entries are authoritative, so this exceeds `head_lsn` when a
    /// head update is still outstanding or the head was reset backward.
    /// Restore validation and previews bound targets with this; default
    /// reads deliberately do not (a reset head must stay reset).
    ///
    /// # Errors
    ///
    /// `Disabled`, `Storage`, or `Cancelled`.
    pub async fn effective_head(
        &self,
        branch: &BranchDescriptor,
        cancel: &CancellationToken,
    ) -> CoreResult<Lsn> {
        let max_entry = self.wal.max_branch_lsn(branch.branch_id, cancel).await?;
        Ok(branch.head_lsn.max(max_entry))
    }

    /// Live documents of `collection` as of `target_lsn` on the branch.
    /// `None` targets the branch head.
    ///
    /// # Errors
    ///
    /// `NotFound` for the branch, `OutOfRange` when the target is beyond
    /// the log end, `Disabled`, `Storage`, or `Cancelled`.
    pub async fn materialize_collection(
        &self,
        branch_id: BranchId,
        collection: &str,
        target_lsn: Option<Lsn>,
        cancel: &CancellationToken,
    ) -> CoreResult<Arc<CollectionState>> {
        let started = Instant::now();
        let branch = self.registry.get_branch_by_id(branch_id).await?;
        let target = self.resolve_target(&branch, target_lsn)?;

        let key = SnapshotKey {
            branch_id,
            collection: collection.to_string(),
            lsn: target,
        };
        if let Some(snapshot) = self.cache.get(&key).await {
            return Ok(snapshot);
        }

        let windows = self.visibility_windows(&branch, target).await?;
        let entries = self
            .wal
            .get_collection_entries(collection, Lsn::new(1), target, cancel)
            .await?;

        let mut state = CollectionState::new();
        for entry in entries.iter().filter(|entry| admitted(&windows, entry)) {
            apply_entry(&mut state, entry);
        }

        debug!(
            branch = %branch.name,
            collection,
            target = target.value(),
            documents = state.len(),
            "materialized collection"
        );
        let snapshot = Arc::new(state);
        self.cache.insert(key, snapshot.clone()).await;
        MATERIALIZE_LATENCY
            .with_label_values(&["collection"])
            .observe(started.elapsed().as_secs_f64());
        Ok(snapshot)
    }

    /// Every collection of the branch as of `target_lsn`, in one scan.
    ///
    /// # Errors
    ///
    /// As [`materialize_collection`](Self::materialize_collection).
    pub async fn materialize_branch(
        &self,
        branch_id: BranchId,
        target_lsn: Option<Lsn>,
        cancel: &CancellationToken,
    ) -> CoreResult<BranchState> {
        let started = Instant::now();
        let branch = self.registry.get_branch_by_id(branch_id).await?;
        let target = self.resolve_target(&branch, target_lsn)?;
        let windows = self.visibility_windows(&branch, target).await?;

        let entries = self.wal.get_range(Lsn::new(1), target, cancel).await?;
        let mut state = BranchState::new();
        for entry in entries.iter().filter(|entry| admitted(&windows, entry)) {
            let Some(collection) = entry.collection() else {
                continue;
            };
            let collection_state = state.entry(collection.to_string()).or_default();
            apply_entry(collection_state, entry);
        }
        state.retain(|_, docs| !docs.is_empty());

        MATERIALIZE_LATENCY
            .with_label_values(&["branch"])
            .observe(started.elapsed().as_secs_f64());
        Ok(state)
    }

    /// Single-document path: replays only the entries that can affect the
    /// requested document (its own entries plus collection drops).
    ///
    /// # Errors
    ///
    /// As [`materialize_collection`](Self::materialize_collection).
    pub async fn find_document(
        &self,
        branch_id: BranchId,
        collection: &str,
        document_id: &DocumentId,
        target_lsn: Option<Lsn>,
        cancel: &CancellationToken,
    ) -> CoreResult<Option<Document>> {
        let started = Instant::now();
        let branch = self.registry.get_branch_by_id(branch_id).await?;
        let target = self.resolve_target(&branch, target_lsn)?;
        let windows = self.visibility_windows(&branch, target).await?;

        let entries = self
            .wal
            .get_collection_entries(collection, Lsn::new(1), target, cancel)
            .await?;

        let mut current: Option<Document> = None;
        for entry in entries.iter().filter(|entry| admitted(&windows, entry)) {
            match entry.operation {
                OperationKind::DropCollection => current = None,
                _ if entry.document_id.as_ref() != Some(document_id) => {}
                OperationKind::Insert => {
                    if let Payload::Document(doc) = &entry.payload {
                        current = Some(doc.clone());
                    }
                }
                OperationKind::Update => match &entry.payload {
                    Payload::PostImage(doc) if current.is_some() => current = Some(doc.clone()),
                    Payload::Delta(delta) => {
                        if let Some(doc) = current.as_mut() {
                            delta.apply(doc);
                        }
                    }
                    // Update to a missing document is a no-op.
                    _ => {}
                },
                OperationKind::Delete => current = None,
                _ => {}
            }
        }

        MATERIALIZE_LATENCY
            .with_label_values(&["document"])
            .observe(started.elapsed().as_secs_f64());
        Ok(current)
    }

    /// Resolves an explicit target against the log end, or defaults to the
    /// branch head. The head pointer, not the branch's maximum entry, is
    /// the default: a deliberately reset head must keep bounding "latest"
    /// reads, and the interceptor advances the head (with retries) before
    /// reporting success, so the pointer tracks appends.
    fn resolve_target(&self, branch: &BranchDescriptor, target_lsn: Option<Lsn>) -> CoreResult<Lsn> {
        match target_lsn {
            Some(target) => {
                let current = self.wal.current_lsn();
                if target > current {
                    return Err(CoreError::out_of_range(format!(
                        "target {target} is beyond the log end {current}"
                    )));
                }
                Ok(target)
            }
            None => Ok(branch.head_lsn),
        }
    }

    /// Walks `branch -> parent -> ...`, clipping the cutoff to each fork
    /// point. The walk stops at the root or at a deleted ancestor.
    pub(crate) async fn visibility_windows(
        &self,
        branch: &BranchDescriptor,
        target_lsn: Lsn,
    ) -> CoreResult<Vec<VisibilityWindow>> {
        let mut windows = Vec::new();
        let mut seen: HashSet<BranchId> = HashSet::new();
        let mut cutoff = target_lsn;
        let mut current = branch.clone();

        loop {
            if !seen.insert(current.branch_id) {
                break;
            }
            windows.push(VisibilityWindow {
                branch_id: current.branch_id,
                max_lsn: cutoff,
            });

            let (Some(parent_id), Some(fork_lsn)) = (current.parent_branch_id, current.fork_lsn)
            else {
                break;
            };
            cutoff = cutoff.min(fork_lsn);
            match self.registry.get_branch_by_id(parent_id).await {
                Ok(parent) => current = parent,
                // History below a deleted ancestor is no longer reachable.
                Err(CoreError::NotFound { .. }) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(windows)
    }
}

/// An entry is visible when its `(branch, lsn)` pair falls inside any
/// ancestry window. Project-level entries carry no branch tag and never
/// affect document state.
pub(crate) fn admitted(windows: &[VisibilityWindow], entry: &WalEntry) -> bool {
    let Some(branch_id) = entry.branch_id else {
        return false;
    };
    windows
        .iter()
        .any(|window| window.branch_id == branch_id && entry.lsn <= window.max_lsn)
}

/// Applies one visible entry to a collection state map.
pub(crate) fn apply_entry(state: &mut CollectionState, entry: &WalEntry) {
    match entry.operation {
        OperationKind::Insert => {
            if let (Some(id), Payload::Document(doc)) = (&entry.document_id, &entry.payload) {
                // Insert with an existing id upserts.
                state.insert(id.clone(), doc.clone());
            }
        }
        OperationKind::Update => {
            let Some(id) = &entry.document_id else { return };
            match &entry.payload {
                Payload::PostImage(doc) => {
                    // Replace only a live document; updating a deleted or
                    // never-inserted document is a no-op.
                    if state.contains_key(id) {
                        state.insert(id.clone(), doc.clone());
                    }
                }
                Payload::Delta(delta) => {
                    if let Some(doc) = state.get_mut(id) {
                        delta.apply(doc);
                    }
                }
                _ => {}
            }
        }
        OperationKind::Delete => {
            if let Some(id) = &entry.document_id {
                state.remove(id);
            }
        }
        OperationKind::DropCollection => state.clear(),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tributary_core::{AppendRequest, DocumentDelta, ProjectId};

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn entry_at(lsn: u64, request: AppendRequest) -> WalEntry {
        request.into_entry(Lsn::new(lsn), Utc::now())
    }

    #[test]
    fn replay_applies_insert_update_delete_in_order() {
        let project = ProjectId::new();
        let branch = BranchId::new();
        let id = DocumentId::from_string("a");
        let mut state = CollectionState::new();

        apply_entry(
            &mut state,
            &entry_at(
                1,
                AppendRequest::insert(project, branch, "users", id.clone(), doc(json!({"n": 1}))),
            ),
        );
        assert_eq!(state.get(&id).unwrap().get("n"), Some(&json!(1)));

        apply_entry(
            &mut state,
            &entry_at(
                2,
                AppendRequest::update(
                    project,
                    branch,
                    "users",
                    id.clone(),
                    DocumentDelta::new().set("n", json!(2)).unset("tmp"),
                ),
            ),
        );
        assert_eq!(state.get(&id).unwrap().get("n"), Some(&json!(2)));

        apply_entry(
            &mut state,
            &entry_at(3, AppendRequest::delete(project, branch, "users", id.clone())),
        );
        assert!(state.is_empty());
    }

    #[test]
    fn update_and_delete_of_missing_documents_are_no_ops() {
        let project = ProjectId::new();
        let branch = BranchId::new();
        let id = DocumentId::from_string("ghost");
        let mut state = CollectionState::new();

        apply_entry(
            &mut state,
            &entry_at(
                1,
                AppendRequest::update(
                    project,
                    branch,
                    "users",
                    id.clone(),
                    DocumentDelta::new().set("n", json!(1)),
                ),
            ),
        );
        apply_entry(
            &mut state,
            &entry_at(
                2,
                AppendRequest::replace(project, branch, "users", id.clone(), doc(json!({"n": 2}))),
            ),
        );
        apply_entry(
            &mut state,
            &entry_at(3, AppendRequest::delete(project, branch, "users", id)),
        );
        assert!(state.is_empty());
    }

    #[test]
    fn insert_with_existing_id_upserts() {
        let project = ProjectId::new();
        let branch = BranchId::new();
        let id = DocumentId::from_string("a");
        let mut state = CollectionState::new();

        for n in [1, 2] {
            apply_entry(
                &mut state,
                &entry_at(
                    n,
                    AppendRequest::insert(
                        project,
                        branch,
                        "users",
                        id.clone(),
                        doc(json!({"n": n})),
                    ),
                ),
            );
        }
        assert_eq!(state.len(), 1);
        assert_eq!(state.get(&id).unwrap().get("n"), Some(&json!(2)));
    }

    #[test]
    fn drop_collection_clears_state() {
        let project = ProjectId::new();
        let branch = BranchId::new();
        let mut state = CollectionState::new();

        apply_entry(
            &mut state,
            &entry_at(
                1,
                AppendRequest::insert(
                    project,
                    branch,
                    "users",
                    DocumentId::from_string("a"),
                    doc(json!({})),
                ),
            ),
        );
        apply_entry(
            &mut state,
            &entry_at(
                2,
                AppendRequest::collection_op(
                    project,
                    branch,
                    OperationKind::DropCollection,
                    "users",
                ),
            ),
        );
        assert!(state.is_empty());
    }

    #[test]
    fn admission_is_window_scoped() {
        let ours = BranchId::new();
        let other = BranchId::new();
        let windows = vec![VisibilityWindow {
            branch_id: ours,
            max_lsn: Lsn::new(5),
        }];

        let visible = entry_at(
            4,
            AppendRequest::insert(
                ProjectId::new(),
                ours,
                "users",
                DocumentId::from_string("a"),
                doc(json!({})),
            ),
        );
        let too_late = entry_at(
            6,
            AppendRequest::insert(
                ProjectId::new(),
                ours,
                "users",
                DocumentId::from_string("b"),
                doc(json!({})),
            ),
        );
        let foreign = entry_at(
            3,
            AppendRequest::insert(
                ProjectId::new(),
                other,
                "users",
                DocumentId::from_string("c"),
                doc(json!({})),
            ),
        );

        assert!(admitted(&windows, &visible));
        assert!(!admitted(&windows, &too_late));
        assert!(!admitted(&windows, &foreign));
    }
}

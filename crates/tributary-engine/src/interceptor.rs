//! Change interceptor.
//!
//! Translates driver-level collection operations on a branch into WAL
//! entries, then advances the branch head to the assigned LSN. The append
//! is the authoritative step: once it returns, the entry is globally
//! visible by LSN, and a failed head update is repaired by the
//! materializer's effective-head rule, so head advancement retries briefly
//! and then defers to read-side reconciliation instead of failing the
//! caller.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tributary_core::{
    AppendAck, AppendRequest, BranchDescriptor, BranchId, CoreError, CoreResult, Document,
    DocumentDelta, DocumentId, Lsn, OperationKind,
};
use tributary_registry::Registry;
use tributary_wal::WalStore;

const HEAD_UPDATE_RETRIES: u32 = 3;
const HEAD_UPDATE_BACKOFF: Duration = Duration::from_millis(10);

/// Longest accepted collection name.
pub const MAX_COLLECTION_NAME_LEN: usize = 255;

/// Validates a caller-supplied collection name.
///
/// # Errors
///
/// Returns `Validation` for empty, oversized, `$`-bearing, or
/// `system.`-prefixed names.
pub fn validate_collection_name(name: &str) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::validation("collection name must not be empty"));
    }
    if name.len() > MAX_COLLECTION_NAME_LEN {
        return Err(CoreError::validation(format!(
            "collection name exceeds {MAX_COLLECTION_NAME_LEN} characters"
        )));
    }
    if name.contains('$') {
        return Err(CoreError::validation(
            "collection name must not contain `$`",
        ));
    }
    if name.starts_with("system.") {
        return Err(CoreError::validation(
            "the `system.` collection namespace is reserved",
        ));
    }
    Ok(())
}

/// Turns logical collection operations into WAL entries and keeps the
/// branch head current.
pub struct Interceptor {
    wal: Arc<WalStore>,
    registry: Arc<Registry>,
}

impl Interceptor {
    #[must_use]
    pub fn new(wal: Arc<WalStore>, registry: Arc<Registry>) -> Self {
        Self { wal, registry }
    }

    /// Inserts a document. Adopts the document's `_id` as its logical key,
    /// generating and injecting one when absent. Inserting an existing id
    /// upserts on replay.
    ///
    /// # Errors
    ///
    /// `NotFound` for a dead branch, `Validation`, `Disabled`, `Storage`,
    /// or `Cancelled`.
    pub async fn insert_one(
        &self,
        branch_id: BranchId,
        collection: &str,
        mut document: Document,
        cancel: &CancellationToken,
    ) -> CoreResult<(DocumentId, AppendAck)> {
        let branch = self.live_branch(branch_id, collection).await?;
        let document_id = match document.id() {
            Some(id) => id,
            None => {
                let id = DocumentId::generate();
                document.set_id(&id);
                id
            }
        };

        let request = AppendRequest::insert(
            branch.project_id,
            branch_id,
            collection,
            document_id.clone(),
            document,
        );
        let ack = self.wal.append(request, cancel).await?;
        self.advance_head(&branch, ack.lsn, cancel).await;

        debug!(
            branch = %branch.name,
            collection,
            document = %document_id,
            lsn = ack.lsn.value(),
            "intercepted insert"
        );
        Ok((document_id, ack))
    }

    /// Applies a field-level `{set, unset}` update to a document.
    ///
    /// # Errors
    ///
    /// As [`insert_one`](Self::insert_one); an empty delta is `Validation`.
    pub async fn update_one(
        &self,
        branch_id: BranchId,
        collection: &str,
        document_id: DocumentId,
        delta: DocumentDelta,
        cancel: &CancellationToken,
    ) -> CoreResult<AppendAck> {
        let branch = self.live_branch(branch_id, collection).await?;
        let request =
            AppendRequest::update(branch.project_id, branch_id, collection, document_id, delta);
        let ack = self.wal.append(request, cancel).await?;
        self.advance_head(&branch, ack.lsn, cancel).await;
        Ok(ack)
    }

    /// Replaces a document wholesale with a post-image. A replacement of a
    /// document that is dead at replay time is a no-op there.
    ///
    /// # Errors
    ///
    /// As [`insert_one`](Self::insert_one).
    pub async fn replace_one(
        &self,
        branch_id: BranchId,
        collection: &str,
        document_id: DocumentId,
        mut document: Document,
        cancel: &CancellationToken,
    ) -> CoreResult<AppendAck> {
        let branch = self.live_branch(branch_id, collection).await?;
        document.set_id(&document_id);
        let request = AppendRequest::replace(
            branch.project_id,
            branch_id,
            collection,
            document_id,
            document,
        );
        let ack = self.wal.append(request, cancel).await?;
        self.advance_head(&branch, ack.lsn, cancel).await;
        Ok(ack)
    }

    /// Deletes a document. Deleting a missing document still appends (the
    /// entry is a no-op on replay), matching driver semantics where a
    /// delete of an absent id succeeds with zero effect.
    ///
    /// # Errors
    ///
    /// As [`insert_one`](Self::insert_one).
    pub async fn delete_one(
        &self,
        branch_id: BranchId,
        collection: &str,
        document_id: DocumentId,
        cancel: &CancellationToken,
    ) -> CoreResult<AppendAck> {
        let branch = self.live_branch(branch_id, collection).await?;
        let request =
            AppendRequest::delete(branch.project_id, branch_id, collection, document_id);
        let ack = self.wal.append(request, cancel).await?;
        self.advance_head(&branch, ack.lsn, cancel).await;
        Ok(ack)
    }

    /// Records collection creation.
    ///
    /// # Errors
    ///
    /// As [`insert_one`](Self::insert_one).
    pub async fn create_collection(
        &self,
        branch_id: BranchId,
        collection: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<AppendAck> {
        self.collection_op(branch_id, collection, OperationKind::CreateCollection, cancel)
            .await
    }

    /// Records a collection drop; replay clears the collection's state.
    ///
    /// # Errors
    ///
    /// As [`insert_one`](Self::insert_one).
    pub async fn drop_collection(
        &self,
        branch_id: BranchId,
        collection: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<AppendAck> {
        self.collection_op(branch_id, collection, OperationKind::DropCollection, cancel)
            .await
    }

    async fn collection_op(
        &self,
        branch_id: BranchId,
        collection: &str,
        operation: OperationKind,
        cancel: &CancellationToken,
    ) -> CoreResult<AppendAck> {
        let branch = self.live_branch(branch_id, collection).await?;
        let request =
            AppendRequest::collection_op(branch.project_id, branch_id, operation, collection);
        let ack = self.wal.append(request, cancel).await?;
        self.advance_head(&branch, ack.lsn, cancel).await;
        Ok(ack)
    }

    /// Rejects operations on unknown or deleted branches and bad
    /// collection names before anything reaches the log.
    async fn live_branch(
        &self,
        branch_id: BranchId,
        collection: &str,
    ) -> CoreResult<BranchDescriptor> {
        validate_collection_name(collection)?;
        let branch = self.registry.get_branch_by_id(branch_id).await?;
        self.registry.get_project(branch.project_id).await?;
        Ok(branch)
    }

    async fn advance_head(&self, branch: &BranchDescriptor, lsn: Lsn, cancel: &CancellationToken) {
        for attempt in 1..=HEAD_UPDATE_RETRIES {
            match self.registry.update_head(branch.branch_id, lsn, cancel).await {
                Ok(()) => return,
                Err(CoreError::Cancelled) => break,
                Err(err) => {
                    debug!(
                        branch = %branch.name,
                        lsn = lsn.value(),
                        attempt,
                        error = %err,
                        "head update attempt failed"
                    );
                    tokio::time::sleep(HEAD_UPDATE_BACKOFF * attempt).await;
                }
            }
        }
        // The entry is already in the log; readers reconcile the head from
        // the branch's maximum entry LSN.
        warn!(
            branch = %branch.name,
            lsn = lsn.value(),
            "head update exhausted retries; deferring to read-side reconciliation"
        );
    }
}

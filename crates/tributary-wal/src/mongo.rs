//! MongoDB-backed WAL persistence.
//!
//! Entries live in the `wal_entries` collection of a dedicated logical
//! database, with a unique index on `lsn` and secondary indexes on
//! `(branch_id, lsn)`, `(timestamp, lsn)` and `(collection, lsn)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, from_bson, to_bson, Bson};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use tracing::info;
use tributary_core::{
    BranchId, CoreError, CoreResult, DocumentId, Lsn, OperationKind, Payload, ProjectId, WalEntry,
};

use crate::backend::WalBackend;

/// Collection holding the log.
pub const WAL_COLLECTION: &str = "wal_entries";

/// Stored form of a [`WalEntry`].
///
/// Ids persist as strings, the LSN as `i64`, the timestamp as a BSON
/// datetime (millisecond precision), and the payload as a BSON tree.
#[derive(Debug, Serialize, Deserialize)]
struct WalEntryRecord {
    lsn: i64,
    timestamp: mongodb::bson::DateTime,
    project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch_id: Option<String>,
    operation: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_id: Option<Bson>,
    payload: Bson,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    metadata: std::collections::BTreeMap<String, String>,
}

impl WalEntryRecord {
    fn encode(entry: &WalEntry) -> CoreResult<Self> {
        Ok(Self {
            lsn: lsn_to_i64(entry.lsn)?,
            timestamp: mongodb::bson::DateTime::from_millis(entry.timestamp.timestamp_millis()),
            project_id: entry.project_id.to_string(),
            branch_id: entry.branch_id.map(|id| id.to_string()),
            operation: entry.operation,
            collection: entry.collection.clone(),
            document_id: entry
                .document_id
                .as_ref()
                .map(|id| to_bson(id.as_value()).map_err(storage_err))
                .transpose()?,
            payload: to_bson(&entry.payload).map_err(storage_err)?,
            metadata: entry.metadata.clone(),
        })
    }

    fn decode(self) -> CoreResult<WalEntry> {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(self.timestamp.timestamp_millis())
            .ok_or_else(|| CoreError::storage("wal entry carries an unrepresentable timestamp"))?;
        Ok(WalEntry {
            lsn: Lsn::new(u64::try_from(self.lsn).map_err(|_| {
                CoreError::storage(format!("negative lsn {} in wal_entries", self.lsn))
            })?),
            timestamp,
            project_id: parse_id::<ProjectId>("project_id", &self.project_id)?,
            branch_id: self
                .branch_id
                .as_deref()
                .map(|raw| parse_id::<BranchId>("branch_id", raw))
                .transpose()?,
            operation: self.operation,
            collection: self.collection,
            document_id: self
                .document_id
                .map(|bson| from_bson::<serde_json::Value>(bson).map_err(storage_err))
                .transpose()?
                .map(DocumentId::new),
            payload: from_bson::<Payload>(self.payload).map_err(storage_err)?,
            metadata: self.metadata,
        })
    }
}

/// WAL backend over a MongoDB deployment.
pub struct MongoWalBackend {
    entries: Collection<WalEntryRecord>,
}

impl MongoWalBackend {
    /// Opens the backend over an existing database handle and creates the
    /// required indexes.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when index creation fails.
    pub async fn new(database: &Database) -> CoreResult<Self> {
        let backend = Self {
            entries: database.collection(WAL_COLLECTION),
        };
        backend.ensure_indexes().await?;
        Ok(backend)
    }

    /// Connects to `uri` and opens the backend on `db_name`.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on connection or index-creation failure.
    pub async fn connect(uri: &str, db_name: &str) -> CoreResult<Self> {
        let client = Client::with_uri_str(uri).await.map_err(storage_err)?;
        info!(db = db_name, "connected WAL backend");
        Self::new(&client.database(db_name)).await
    }

    async fn ensure_indexes(&self) -> CoreResult<()> {
        let indexes = vec![
            IndexModel::builder()
                .keys(doc! { "lsn": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            IndexModel::builder()
                .keys(doc! { "branch_id": 1, "lsn": 1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "timestamp": 1, "lsn": 1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "collection": 1, "lsn": 1 })
                .build(),
        ];
        self.entries
            .create_indexes(indexes)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn load_with_filter(&self, filter: mongodb::bson::Document) -> CoreResult<Vec<WalEntry>> {
        let mut cursor = self
            .entries
            .find(filter)
            .sort(doc! { "lsn": 1 })
            .await
            .map_err(storage_err)?;

        let mut out = Vec::new();
        while let Some(record) = cursor.try_next().await.map_err(storage_err)? {
            out.push(record.decode()?);
        }
        Ok(out)
    }
}

#[async_trait]
impl WalBackend for MongoWalBackend {
    async fn persist(&self, entries: &[WalEntry]) -> CoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let records = entries
            .iter()
            .map(WalEntryRecord::encode)
            .collect::<CoreResult<Vec<_>>>()?;
        let first = records[0].lsn;
        let last = records[records.len() - 1].lsn;

        if let Err(err) = self.entries.insert_many(records).ordered(true).await {
            // An ordered bulk insert can land a prefix of the batch. Undo
            // it so the batch stays all-or-none and the store can retry.
            let _ = self
                .entries
                .delete_many(doc! { "lsn": { "$gte": first, "$lte": last } })
                .await;
            return Err(storage_err(err));
        }
        Ok(())
    }

    async fn max_lsn(&self) -> CoreResult<Lsn> {
        let newest = self
            .entries
            .find_one(doc! {})
            .sort(doc! { "lsn": -1 })
            .await
            .map_err(storage_err)?;
        Ok(newest.map_or(Lsn::ZERO, |record| {
            Lsn::new(record.lsn.max(0).unsigned_abs())
        }))
    }

    async fn load_range(&self, start: Lsn, end: Lsn) -> CoreResult<Vec<WalEntry>> {
        self.load_with_filter(doc! {
            "lsn": { "$gte": lsn_to_i64(start)?, "$lte": lsn_to_i64(end)? }
        })
        .await
    }

    async fn load_branch_range(
        &self,
        branch_id: BranchId,
        start: Lsn,
        end: Lsn,
    ) -> CoreResult<Vec<WalEntry>> {
        self.load_with_filter(doc! {
            "branch_id": branch_id.to_string(),
            "lsn": { "$gte": lsn_to_i64(start)?, "$lte": lsn_to_i64(end)? }
        })
        .await
    }

    async fn load_collection_range(
        &self,
        collection: &str,
        start: Lsn,
        end: Lsn,
    ) -> CoreResult<Vec<WalEntry>> {
        self.load_with_filter(doc! {
            "collection": collection,
            "lsn": { "$gte": lsn_to_i64(start)?, "$lte": lsn_to_i64(end)? }
        })
        .await
    }

    async fn lsn_at_or_before(&self, timestamp: DateTime<Utc>) -> CoreResult<Lsn> {
        let cutoff = mongodb::bson::DateTime::from_millis(timestamp.timestamp_millis());
        let found = self
            .entries
            .find_one(doc! { "timestamp": { "$lte": cutoff } })
            .sort(doc! { "lsn": -1 })
            .await
            .map_err(storage_err)?;
        Ok(found.map_or(Lsn::ZERO, |record| {
            Lsn::new(record.lsn.max(0).unsigned_abs())
        }))
    }

    async fn max_branch_lsn(&self, branch_id: BranchId) -> CoreResult<Lsn> {
        let found = self
            .entries
            .find_one(doc! { "branch_id": branch_id.to_string() })
            .sort(doc! { "lsn": -1 })
            .await
            .map_err(storage_err)?;
        Ok(found.map_or(Lsn::ZERO, |record| {
            Lsn::new(record.lsn.max(0).unsigned_abs())
        }))
    }

    async fn collections_in_range(&self, start: Lsn, end: Lsn) -> CoreResult<Vec<String>> {
        let names = self
            .entries
            .distinct(
                "collection",
                doc! {
                    "collection": { "$type": "string" },
                    "lsn": { "$gte": lsn_to_i64(start)?, "$lte": lsn_to_i64(end)? }
                },
            )
            .await
            .map_err(storage_err)?;

        let mut out: Vec<String> = names
            .into_iter()
            .filter_map(|value| match value {
                Bson::String(name) => Some(name),
                _ => None,
            })
            .collect();
        out.sort();
        Ok(out)
    }
}

fn lsn_to_i64(lsn: Lsn) -> CoreResult<i64> {
    i64::try_from(lsn.value())
        .map_err(|_| CoreError::storage(format!("{lsn} exceeds the storable i64 range")))
}

fn parse_id<T: std::str::FromStr>(field: &str, raw: &str) -> CoreResult<T> {
    raw.parse()
        .map_err(|_| CoreError::storage(format!("malformed {field} `{raw}` in wal_entries")))
}

fn storage_err(err: impl std::fmt::Display) -> CoreError {
    CoreError::storage(err.to_string())
}

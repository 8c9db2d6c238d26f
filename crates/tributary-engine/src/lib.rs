//! Tributary branching engine.
//!
//! Git-like branches, time travel, and point-in-time restore over a
//! standard MongoDB deployment, built on a single-writer WAL with
//! LSN-addressed branch pointers.
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use tributary_core::{Document, EngineConfig};
//! use tributary_engine::Engine;
//!
//! #[tokio::main]
//! async fn main() -> tributary_core::CoreResult<()> {
//!     let engine = Engine::in_memory(EngineConfig::default()).await?;
//!     let cancel = CancellationToken::new();
//!
//!     let project = engine.registry().create_project("demo", &cancel).await?;
//!     let main = engine.resolve_branch("demo", "main").await?;
//!
//!     let doc = Document::from_value(serde_json::json!({"_id": "a", "n": 1}))?;
//!     engine
//!         .interceptor()
//!         .insert_one(main.branch_id, "users", doc, &cancel)
//!         .await?;
//!
//!     let state = engine
//!         .materializer()
//!         .materialize_collection(main.branch_id, "users", None, &cancel)
//!         .await?;
//!     assert_eq!(state.len(), 1);
//!
//!     let _ = project;
//!     engine.shutdown().await
//! }
//! ```

pub mod cache;
pub mod engine;
pub mod interceptor;
pub mod materializer;
pub mod monitor;
pub mod restore;
pub mod timetravel;

pub use cache::CollectionState;
pub use engine::Engine;
pub use interceptor::{validate_collection_name, Interceptor, MAX_COLLECTION_NAME_LEN};
pub use materializer::{BranchState, Materializer};
pub use monitor::{HealthReport, Monitor};
pub use restore::{RestorePreview, RestoreService};
pub use timetravel::{TimeTravel, TimeTravelInfo};

//! Shared helpers for the engine integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tributary_core::{
    Document, DocumentId, EngineConfig, SnapshotCacheConfig, WalConfig,
};
use tributary_engine::Engine;

/// Small pages and a fast flusher keep the suites quick while still
/// exercising the paged buffer.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        enable_wal: true,
        wal: WalConfig {
            page_size: 4,
            page_count: 8,
            flush_interval: Duration::from_millis(5),
        },
        cache: SnapshotCacheConfig::default(),
    }
}

pub async fn engine() -> Arc<Engine> {
    Engine::in_memory(test_config()).await.expect("in-memory engine")
}

pub fn doc(value: serde_json::Value) -> Document {
    Document::from_value(value).expect("object payload")
}

pub fn id(key: &str) -> DocumentId {
    DocumentId::from_string(key)
}

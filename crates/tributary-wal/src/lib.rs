//! Write-ahead log for the Tributary branching engine.
//!
//! One strictly ordered, gap-free log spans every project and branch; the
//! `WalStore` assigns LSNs and buffers entries into pages that a background
//! task flushes to a durable backend. Backends implement [`WalBackend`]:
//! MongoDB (`wal_entries` collection) in production, an in-memory twin for
//! tests and embedded use.

pub mod backend;
mod buffer;
pub mod memory;
pub mod mongo;
pub mod store;

pub use backend::WalBackend;
pub use memory::MemoryWalBackend;
pub use mongo::{MongoWalBackend, WAL_COLLECTION};
pub use store::{WalStore, WalStats};

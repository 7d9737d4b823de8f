//! Key-value storage boundary.
//!
//! The node persists decided consensus instances and participation records
//! through the [`Database`] trait; the engine behind it (RocksDB, badger,
//! anything namespaced) is injected by the host. [`MemDb`] is the in-memory
//! implementation used in tests and as the default when no engine is wired.

mod kv;

pub use kv::{Database, MemDb, StorageError, Txn};

//! Durable key-value persistence behind the sdk: one store instance backs
//! both the DNS answer cache and the append-only log records.

use crate::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;

#[cfg(test)]
pub(crate) mod common_tests;
pub mod kv;
pub mod mem;

pub use kv::KvDataStore;
pub use mem::MemDataStore;

/// Logical namespaces inside a single store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Column {
    /// Raw DNS-over-HTTPS response bodies, keyed by hostname.
    Dns,
    /// Log entries, derivation secret and writability markers.
    Core,
}

/// Generic storage for the sdk. The same interface is implemented for an
/// in-memory map and for an on-disk sled database, so every layer above is
/// oblivious to whether the instance is persistent.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    fn new(path: PathBuf) -> Self
    where
        Self: Sized;

    /// Opens the backing storage. Must be called before any other operation
    /// and must fail with `Error::StorageConflict` when another live
    /// instance already holds the same path.
    async fn init(&self) -> Result<()>;

    async fn contains(&self, col: Column, key: &[u8]) -> Result<bool>;

    async fn get(&self, col: Column, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn put(&self, col: Column, key: &[u8], value: &[u8]) -> Result<()>;

    async fn remove(&self, col: Column, key: &[u8]) -> Result<()>;

    /// All pairs in a column whose key starts with `prefix`, ordered by key.
    async fn list(&self, col: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Flushes and releases the backing storage. The path must be reusable
    /// by a fresh instance once this returns.
    async fn close(&self) -> Result<()>;
}

/// Key prefixing used by both implementations to keep columns disjoint
/// inside one keyspace.
fn key_with_column(col: Column, key: &[u8]) -> Vec<u8> {
    let prefix: &[u8] = match col {
        Column::Dns => b"dns/",
        Column::Core => b"core/",
    };
    let mut out = Vec::with_capacity(prefix.len() + key.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(key);
    out
}

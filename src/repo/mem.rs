//! Volatile datastore for in-memory instances and tests.

use crate::error::Result;
use crate::repo::{key_with_column, Column, DataStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// An ordered in-memory map behind the `DataStore` interface. The path given
/// at construction is ignored, nothing ever touches the disk.
#[derive(Debug, Default)]
pub struct MemDataStore {
    inner: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

#[async_trait]
impl DataStore for MemDataStore {
    fn new(_path: PathBuf) -> Self {
        MemDataStore::default()
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn contains(&self, col: Column, key: &[u8]) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.contains_key(&key_with_column(col, key)))
    }

    async fn get(&self, col: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.get(&key_with_column(col, key)).cloned())
    }

    async fn put(&self, col: Column, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(key_with_column(col, key), value.to_vec());
        Ok(())
    }

    async fn remove(&self, col: Column, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(&key_with_column(col, key));
        Ok(())
    }

    async fn list(&self, col: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let full_prefix = key_with_column(col, prefix);
        let strip = full_prefix.len() - prefix.len();
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .range(full_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&full_prefix))
            .map(|(k, v)| (k[strip..].to_vec(), v.clone()))
            .collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
crate::datastore_interface_tests!(interface_tests, crate::repo::mem::MemDataStore::new);

//! Persistent datastore on top of sled.

use crate::error::{Error, Result};
use crate::repo::{key_with_column, Column, DataStore};
use async_trait::async_trait;
use sled::{self, Config as DbConfig, Db};
use std::path::PathBuf;
use std::sync::RwLock;

/// sled-backed implementation. The database holds an exclusive file lock for
/// as long as it is open, which is what turns a second instance on the same
/// directory into `Error::StorageConflict`.
#[derive(Debug)]
pub struct KvDataStore {
    path: PathBuf,
    // sled::Db is cheap to clone, the slot is emptied on close so the file
    // lock is released without dropping the store itself
    db: RwLock<Option<Db>>,
}

impl KvDataStore {
    fn get_db(&self) -> Result<Db> {
        let guard = self.db.read().unwrap();
        guard.as_ref().cloned().ok_or(Error::Closed)
    }
}

#[async_trait]
impl DataStore for KvDataStore {
    fn new(path: PathBuf) -> KvDataStore {
        KvDataStore {
            path,
            db: RwLock::new(None),
        }
    }

    async fn init(&self) -> Result<()> {
        let mut guard = self.db.write().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        let config = DbConfig::new().path(&self.path);
        let db = match config.open() {
            Ok(db) => db,
            Err(sled::Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(Error::StorageConflict {
                    path: self.path.clone(),
                })
            }
            Err(e) if e.to_string().contains("lock") => {
                return Err(Error::StorageConflict {
                    path: self.path.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        *guard = Some(db);
        Ok(())
    }

    async fn contains(&self, col: Column, key: &[u8]) -> Result<bool> {
        let db = self.get_db()?;
        Ok(db.contains_key(key_with_column(col, key))?)
    }

    async fn get(&self, col: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let db = self.get_db()?;
        Ok(db
            .get(key_with_column(col, key))?
            .map(|ivec| ivec.to_vec()))
    }

    async fn put(&self, col: Column, key: &[u8], value: &[u8]) -> Result<()> {
        let db = self.get_db()?;
        db.insert(key_with_column(col, key), value)?;
        db.flush_async().await?;
        Ok(())
    }

    async fn remove(&self, col: Column, key: &[u8]) -> Result<()> {
        let db = self.get_db()?;
        db.remove(key_with_column(col, key))?;
        db.flush_async().await?;
        Ok(())
    }

    async fn list(&self, col: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let db = self.get_db()?;
        let full_prefix = key_with_column(col, prefix);
        let strip = full_prefix.len() - prefix.len();
        let mut out = Vec::new();
        for pair in db.scan_prefix(&full_prefix) {
            let (k, v) = pair?;
            out.push((k[strip..].to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    async fn close(&self) -> Result<()> {
        let db = { self.db.write().unwrap().take() };
        if let Some(db) = db {
            db.flush_async().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
crate::datastore_interface_tests!(interface_tests, crate::repo::kv::KvDataStore::new);

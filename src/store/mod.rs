//! Log storage: key derivation from the instance secret, the open-log
//! registry, and the type-erased view replication runs against.

use crate::error::{Error, Result};
use crate::identifier::KEY_BYTES;
use crate::repo::{Column, DataStore};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub mod core;

pub use self::core::RawCore;

const SECRET_RECORD: &[u8] = b"secret";

fn writable_record_key(key: &[u8; KEY_BYTES]) -> Vec<u8> {
    format!("writable.{}", crate::identifier::encode_key_hex(key)).into_bytes()
}

/// Object-safe replication view of one log, the only shape the in-process
/// swarm ever sees.
#[async_trait]
pub trait Replicable: Send + Sync + 'static {
    /// Process-unique identity, used to dedup mirror tasks.
    fn replica_id(&self) -> u64;

    fn discovery_key(&self) -> [u8; KEY_BYTES];

    fn writable(&self) -> bool;

    fn replica_len(&self) -> u64;

    fn replica_entry(&self, seq: u64) -> Option<Vec<u8>>;

    /// Delivers remote entries starting at `base`. Writable logs and stale
    /// deliveries are ignored without error.
    async fn ingest(&self, base: u64, entries: Vec<Vec<u8>>) -> Result<()>;

    /// Receiver observing the log length, bumped on every append, delivery
    /// and close.
    fn subscribe_len(&self) -> watch::Receiver<u64>;

    fn is_closed(&self) -> bool;
}

/// What a peer exposes to the network layer: lookup of its open logs by
/// discovery key.
pub trait CoreSource: Send + Sync + 'static {
    fn core_by_discovery(&self, topic: &[u8; KEY_BYTES]) -> Option<Arc<dyn Replicable>>;

    fn replicable_cores(&self) -> Vec<Arc<dyn Replicable>>;
}

/// Registry of open logs plus the name derivation secret.
///
/// Log keys derived from a name are deterministic per instance: the secret
/// is persisted on first open, so reopening the same storage directory
/// yields the same keys for the same names.
pub struct Corestore<TStore: DataStore> {
    store: Arc<TStore>,
    secret: [u8; KEY_BYTES],
    cores: Mutex<HashMap<[u8; KEY_BYTES], Arc<RawCore<TStore>>>>,
}

impl<TStore: DataStore> Corestore<TStore> {
    pub async fn open(store: Arc<TStore>) -> Result<Arc<Corestore<TStore>>> {
        let secret = match store.get(Column::Core, SECRET_RECORD).await? {
            Some(bytes) => {
                if bytes.len() != KEY_BYTES {
                    return Err(Error::Corrupt("derivation secret record".into()));
                }
                let mut secret = [0u8; KEY_BYTES];
                secret.copy_from_slice(&bytes);
                secret
            }
            None => {
                use rand::RngCore;
                let mut secret = [0u8; KEY_BYTES];
                rand::thread_rng().fill_bytes(&mut secret);
                store.put(Column::Core, SECRET_RECORD, &secret).await?;
                secret
            }
        };
        Ok(Arc::new(Corestore {
            store,
            secret,
            cores: Mutex::new(HashMap::new()),
        }))
    }

    /// Key of the log a (namespace, name) pair maps to on this instance.
    pub fn derive_key(&self, namespace: &str, name: &str) -> [u8; KEY_BYTES] {
        let mut hasher = Sha256::new();
        hasher.update(b"hyper-sdk name");
        hasher.update(self.secret);
        hasher.update((namespace.len() as u64).to_le_bytes());
        hasher.update(namespace.as_bytes());
        hasher.update(name.as_bytes());
        hasher.finalize().into()
    }

    /// Topic announced on the network for a key. Derivable by anyone who
    /// holds the key, not reversible to it.
    pub fn discovery_key(key: &[u8; KEY_BYTES]) -> [u8; KEY_BYTES] {
        let mut hasher = Sha256::new();
        hasher.update(b"hyper-sdk discovery");
        hasher.update(key);
        hasher.finalize().into()
    }

    /// Stable identity of this instance towards peers.
    pub fn public_key(&self) -> [u8; KEY_BYTES] {
        let mut hasher = Sha256::new();
        hasher.update(b"hyper-sdk identity");
        hasher.update(self.secret);
        hasher.finalize().into()
    }

    /// Opens a writable log by local name, creating it on first use.
    pub async fn get_by_name(
        &self,
        namespace: &str,
        name: &str,
        persist: bool,
    ) -> Result<Arc<RawCore<TStore>>> {
        let key = self.derive_key(namespace, name);
        if let Some(existing) = self.cores.lock().unwrap().get(&key) {
            return Ok(existing.clone());
        }
        if persist {
            // writability marker lets a later open-by-key know this log is ours
            self.store
                .put(Column::Core, &writable_record_key(&key), b"1")
                .await?;
        }
        self.open_raw(key, true, persist).await
    }

    /// Opens a log by key. The log is writable only when this instance
    /// previously created it from a name.
    pub async fn get_by_key(
        &self,
        key: [u8; KEY_BYTES],
        persist: bool,
    ) -> Result<Arc<RawCore<TStore>>> {
        if let Some(existing) = self.cores.lock().unwrap().get(&key) {
            return Ok(existing.clone());
        }
        let writable = persist
            && self
                .store
                .contains(Column::Core, &writable_record_key(&key))
                .await?;
        self.open_raw(key, writable, persist).await
    }

    async fn open_raw(
        &self,
        key: [u8; KEY_BYTES],
        writable: bool,
        persist: bool,
    ) -> Result<Arc<RawCore<TStore>>> {
        let raw = RawCore::load(
            self.store.clone(),
            key,
            Self::discovery_key(&key),
            writable,
            persist,
        )
        .await?;
        let mut cores = self.cores.lock().unwrap();
        // lost the race: someone registered the key while we were loading
        if let Some(existing) = cores.get(&key) {
            return Ok(existing.clone());
        }
        cores.insert(key, raw.clone());
        Ok(raw)
    }

    /// Drops a closed log from the registry so a later open starts fresh.
    pub(crate) fn remove(&self, key: &[u8; KEY_BYTES]) {
        self.cores.lock().unwrap().remove(key);
    }

    pub fn open_cores(&self) -> Vec<Arc<RawCore<TStore>>> {
        self.cores.lock().unwrap().values().cloned().collect()
    }
}

impl<TStore: DataStore> CoreSource for Corestore<TStore> {
    fn core_by_discovery(&self, topic: &[u8; KEY_BYTES]) -> Option<Arc<dyn Replicable>> {
        let cores = self.cores.lock().unwrap();
        cores
            .values()
            .find(|core| &core.discovery_key() == topic)
            .map(|core| core.clone() as Arc<dyn Replicable>)
    }

    fn replicable_cores(&self) -> Vec<Arc<dyn Replicable>> {
        let cores = self.cores.lock().unwrap();
        cores
            .values()
            .map(|core| core.clone() as Arc<dyn Replicable>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemDataStore;
    use std::path::PathBuf;

    fn mem_store() -> Arc<MemDataStore> {
        Arc::new(MemDataStore::new(PathBuf::new()))
    }

    #[tokio::test]
    async fn name_derivation_is_stable_per_store() {
        let store = mem_store();
        let first = Corestore::open(store.clone()).await.unwrap();
        let key = first.derive_key("ns", "example");
        assert_ne!(key, first.derive_key("ns", "other"));
        assert_ne!(key, first.derive_key("other", "example"));

        // same backing store, same secret, same keys
        let second = Corestore::open(store).await.unwrap();
        assert_eq!(key, second.derive_key("ns", "example"));

        // a fresh store has a fresh secret
        let third = Corestore::open(mem_store()).await.unwrap();
        assert_ne!(key, third.derive_key("ns", "example"));
    }

    #[tokio::test]
    async fn open_by_name_then_key_is_the_same_log() {
        let cs = Corestore::open(mem_store()).await.unwrap();
        let by_name = cs.get_by_name("ns", "example", true).await.unwrap();
        assert!(by_name.writable());

        let by_key = cs.get_by_key(by_name.key(), true).await.unwrap();
        assert_eq!(by_name.replica_id(), by_key.replica_id());
    }

    #[tokio::test]
    async fn entries_survive_reopen_through_the_store() {
        let store = mem_store();
        let key = {
            let cs = Corestore::open(store.clone()).await.unwrap();
            let raw = cs.get_by_name("ns", "example", true).await.unwrap();
            raw.append(b"one").await.unwrap();
            raw.append(b"two").await.unwrap();
            raw.close().await.unwrap();
            cs.remove(&raw.key());
            raw.key()
        };

        let cs = Corestore::open(store).await.unwrap();
        let raw = cs.get_by_key(key, true).await.unwrap();
        assert!(raw.writable(), "writability marker persisted");
        assert_eq!(raw.len(), 2);
        assert_eq!(raw.entry(0), Some(b"one".to_vec()));
        assert_eq!(raw.entry(1), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn append_requires_writability() {
        let cs = Corestore::open(mem_store()).await.unwrap();
        let raw = cs.get_by_key([7u8; KEY_BYTES], true).await.unwrap();
        assert!(!raw.writable());
        assert!(matches!(
            raw.append(b"nope").await,
            Err(Error::NotWritable)
        ));
    }

    #[tokio::test]
    async fn ingest_extends_read_only_logs_in_order() {
        let cs = Corestore::open(mem_store()).await.unwrap();
        let raw = cs.get_by_key([7u8; KEY_BYTES], true).await.unwrap();

        raw.ingest(0, vec![b"a".to_vec(), b"b".to_vec()]).await.unwrap();
        assert_eq!(raw.len(), 2);

        // stale delivery is dropped
        raw.ingest(0, vec![b"dup".to_vec()]).await.unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw.entry(0), Some(b"a".to_vec()));

        raw.ingest(2, vec![b"c".to_vec()]).await.unwrap();
        assert_eq!(raw.entry(2), Some(b"c".to_vec()));
    }

    #[tokio::test]
    async fn update_wakes_on_delivery_and_errors_on_close() {
        let cs = Corestore::open(mem_store()).await.unwrap();
        let raw = cs.get_by_key([7u8; KEY_BYTES], true).await.unwrap();

        let waiter = {
            let raw = raw.clone();
            tokio::spawn(async move { raw.update().await })
        };
        tokio::task::yield_now().await;
        raw.ingest(0, vec![b"a".to_vec()]).await.unwrap();
        waiter.await.unwrap().unwrap();

        let waiter = {
            let raw = raw.clone();
            tokio::spawn(async move { raw.update().await })
        };
        tokio::task::yield_now().await;
        raw.close().await.unwrap();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Closed)));
    }
}

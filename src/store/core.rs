//! The raw append-only log underneath every user facing handle.

use crate::error::{Error, Result};
use crate::identifier::{encode_key_hex, KEY_BYTES};
use crate::repo::{Column, DataStore};
use crate::store::Replicable;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

static NEXT_CORE_ID: AtomicU64 = AtomicU64::new(0);

fn entry_record_key(hex: &str, seq: u64) -> Vec<u8> {
    // fixed width sequence keeps datastore iteration in append order
    format!("log.{}.{:016x}", hex, seq).into_bytes()
}

pub(crate) fn entry_record_prefix(hex: &str) -> Vec<u8> {
    format!("log.{}.", hex).into_bytes()
}

/// One append-only log. Entries live in memory and are written through to
/// the datastore unless persistence was disabled for this log.
pub struct RawCore<TStore: DataStore> {
    id: u64,
    key: [u8; KEY_BYTES],
    discovery_key: [u8; KEY_BYTES],
    writable: bool,
    persist: bool,
    store: Arc<TStore>,
    entries: RwLock<Vec<Vec<u8>>>,
    length_tx: watch::Sender<u64>,
    // kept so sending on length_tx can never fail
    length_rx: watch::Receiver<u64>,
    closed: AtomicBool,
    finding_peers: AtomicBool,
}

impl<TStore: DataStore> RawCore<TStore> {
    /// Opens the log, loading any entries previously written through to the
    /// datastore under this key.
    pub(crate) async fn load(
        store: Arc<TStore>,
        key: [u8; KEY_BYTES],
        discovery_key: [u8; KEY_BYTES],
        writable: bool,
        persist: bool,
    ) -> Result<Arc<RawCore<TStore>>> {
        let hex = encode_key_hex(&key);
        let entries: Vec<Vec<u8>> = if persist {
            store
                .list(Column::Core, &entry_record_prefix(&hex))
                .await?
                .into_iter()
                .map(|(_, value)| value)
                .collect()
        } else {
            Vec::new()
        };
        let (length_tx, length_rx) = watch::channel(entries.len() as u64);
        Ok(Arc::new(RawCore {
            id: NEXT_CORE_ID.fetch_add(1, Ordering::SeqCst),
            key,
            discovery_key,
            writable,
            persist,
            store,
            entries: RwLock::new(entries),
            length_tx,
            length_rx,
            closed: AtomicBool::new(false),
            finding_peers: AtomicBool::new(false),
        }))
    }

    pub fn key(&self) -> [u8; KEY_BYTES] {
        self.key
    }

    pub fn discovery_key(&self) -> [u8; KEY_BYTES] {
        self.discovery_key
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn len(&self) -> u64 {
        self.entries.read().unwrap().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, seq: u64) -> Option<Vec<u8>> {
        self.entries.read().unwrap().get(seq as usize).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_finding_peers(&self, value: bool) {
        self.finding_peers.store(value, Ordering::SeqCst);
    }

    pub fn finding_peers(&self) -> bool {
        self.finding_peers.load(Ordering::SeqCst)
    }

    /// Appends one entry, returning its sequence number.
    pub async fn append(&self, entry: &[u8]) -> Result<u64> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if !self.writable {
            return Err(Error::NotWritable);
        }
        // single writer per instance: the seq read here stays valid because
        // only this method appends to a writable log
        let seq = self.len();
        if self.persist {
            let hex = encode_key_hex(&self.key);
            self.store
                .put(Column::Core, &entry_record_key(&hex, seq), entry)
                .await?;
        }
        let len = {
            let mut entries = self.entries.write().unwrap();
            entries.push(entry.to_vec());
            entries.len() as u64
        };
        let _ = self.length_tx.send(len);
        Ok(seq)
    }

    /// Waits until at least one entry past the current length arrives.
    pub async fn update(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let mut rx = self.length_rx.clone();
        let start = *rx.borrow();
        loop {
            if rx.changed().await.is_err() {
                return Err(Error::Closed);
            }
            if *rx.borrow() > start {
                return Ok(());
            }
            if self.is_closed() {
                return Err(Error::Closed);
            }
        }
    }

    /// Marks the log closed and wakes every waiter and mirror task.
    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.length_tx.send(self.len());
        Ok(())
    }
}

#[async_trait]
impl<TStore: DataStore> Replicable for RawCore<TStore> {
    fn replica_id(&self) -> u64 {
        self.id
    }

    fn discovery_key(&self) -> [u8; KEY_BYTES] {
        self.discovery_key
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn replica_len(&self) -> u64 {
        self.len()
    }

    fn replica_entry(&self, seq: u64) -> Option<Vec<u8>> {
        self.entry(seq)
    }

    async fn ingest(&self, base: u64, entries: Vec<Vec<u8>>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.writable {
            // local appends are the only source of truth for writable logs
            return Ok(());
        }
        {
            let current = self.len();
            if base != current {
                // raced with another mirror which already delivered these
                return Ok(());
            }
        }
        if self.persist {
            let hex = encode_key_hex(&self.key);
            for (offset, entry) in entries.iter().enumerate() {
                self.store
                    .put(
                        Column::Core,
                        &entry_record_key(&hex, base + offset as u64),
                        entry,
                    )
                    .await?;
            }
        }
        let len = {
            let mut guard = self.entries.write().unwrap();
            if guard.len() as u64 != base {
                return Ok(());
            }
            guard.extend(entries);
            guard.len() as u64
        };
        let _ = self.length_tx.send(len);
        Ok(())
    }

    fn subscribe_len(&self) -> watch::Receiver<u64> {
        self.length_rx.clone()
    }

    fn is_closed(&self) -> bool {
        RawCore::is_closed(self)
    }
}

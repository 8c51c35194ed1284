//! The user facing log handle with shared reference counted lifecycle.
//!
//! Every `get` for the same resource hands out a clone of one shared handle
//! and bumps its reference count. `close` decrements, and only the drop to
//! zero tears the underlying log down, fires close observers and the closed
//! event. Later closes of an already torn handle are no-ops.

use crate::cache::Handle;
use crate::error::{Error, Result};
use crate::identifier::{encode_key_hex, format_url, KEY_BYTES};
use crate::p2p::Discovery;
use crate::repo::DataStore;
use crate::store::RawCore;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) type CloseObserver = Box<dyn FnOnce() + Send>;

struct CoreShared<TStore: DataStore> {
    id: u64,
    raw: Arc<RawCore<TStore>>,
    name: Option<String>,
    refs: AtomicUsize,
    torn: AtomicBool,
    observers: Mutex<Vec<CloseObserver>>,
    // the topic registration, present while joined
    discovery: tokio::sync::Mutex<Option<Discovery>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

pub struct Core<TStore: DataStore> {
    shared: Arc<CoreShared<TStore>>,
}

impl<TStore: DataStore> Clone for Core<TStore> {
    fn clone(&self) -> Self {
        Core {
            shared: self.shared.clone(),
        }
    }
}

impl<TStore: DataStore> Core<TStore> {
    pub(crate) fn new(raw: Arc<RawCore<TStore>>, name: Option<String>) -> Core<TStore> {
        let (closed_tx, closed_rx) = watch::channel(false);
        Core {
            shared: Arc::new(CoreShared {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::SeqCst),
                raw,
                name,
                refs: AtomicUsize::new(1),
                torn: AtomicBool::new(false),
                observers: Mutex::new(Vec::new()),
                discovery: tokio::sync::Mutex::new(None),
                closed_tx,
                closed_rx,
            }),
        }
    }

    pub fn key(&self) -> [u8; KEY_BYTES] {
        self.shared.raw.key()
    }

    pub fn discovery_key(&self) -> [u8; KEY_BYTES] {
        self.shared.raw.discovery_key()
    }

    /// Canonical `hyper://` URL for this resource.
    pub fn url(&self) -> String {
        format_url(&self.key())
    }

    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    pub fn writable(&self) -> bool {
        self.shared.raw.writable()
    }

    pub fn len(&self) -> u64 {
        self.shared.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.raw.is_empty()
    }

    pub fn finding_peers(&self) -> bool {
        self.shared.raw.finding_peers()
    }

    /// Resolves once the handle is usable. Kept for API symmetry, the
    /// facade only returns handles that are already open.
    pub async fn ready(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub async fn append(&self, entry: &[u8]) -> Result<u64> {
        self.shared.raw.append(entry).await
    }

    pub fn get(&self, seq: u64) -> Option<Vec<u8>> {
        self.shared.raw.entry(seq)
    }

    /// Waits for the log to grow past its current length.
    pub async fn update(&self) -> Result<()> {
        self.shared.raw.update().await
    }

    /// Whether the underlying log has been torn down.
    pub fn is_closed(&self) -> bool {
        *self.shared.closed_rx.borrow()
    }

    /// Resolves when the underlying log is torn down, immediately if it
    /// already happened.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// True when both handles share the same live instance.
    pub fn instance_eq(&self, other: &Core<TStore>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Registers a callback run synchronously at the start of teardown. If
    /// teardown already happened the callback runs immediately.
    pub fn on_close(&self, observer: CloseObserver) {
        if self.shared.torn.load(Ordering::SeqCst) {
            observer();
            return;
        }
        self.shared.observers.lock().unwrap().push(observer);
    }

    pub(crate) fn set_finding_peers(&self, value: bool) {
        self.shared.raw.set_finding_peers(value);
    }

    pub(crate) fn discovery_slot(&self) -> &tokio::sync::Mutex<Option<Discovery>> {
        &self.shared.discovery
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.shared.refs.load(Ordering::SeqCst)
    }

    /// Releases one reference. Only the final release tears the resource
    /// down; earlier ones and releases after teardown succeed as no-ops.
    pub async fn close(&self) -> Result<()> {
        let prev = self
            .shared
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match prev {
            Ok(1) => self.teardown().await,
            _ => Ok(()),
        }
    }

    /// Unconditional teardown, used by the final reference drop and by sdk
    /// shutdown. Runs at most once.
    pub(crate) async fn teardown(&self) -> Result<()> {
        if self.shared.torn.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let observers = std::mem::take(&mut *self.shared.observers.lock().unwrap());
        for observer in observers {
            observer();
        }
        let discovery = self.shared.discovery.lock().await.take();
        if let Some(discovery) = discovery {
            if let Err(e) = discovery.leave().await {
                tracing::debug!("leaving topic during teardown failed: {}", e);
            }
        }
        // let already scheduled readers run against the open log first
        tokio::task::yield_now().await;
        self.shared.raw.close().await?;
        let _ = self.shared.closed_tx.send(true);
        Ok(())
    }
}

impl<TStore: DataStore> Handle for Core<TStore> {
    fn acquire(&self) -> Self {
        self.shared.refs.fetch_add(1, Ordering::SeqCst);
        self.clone()
    }

    fn instance_id(&self) -> u64 {
        self.shared.id
    }

    fn cache_ids(&self) -> (String, Option<String>) {
        (encode_key_hex(&self.key()), self.shared.name.clone())
    }
}

impl<TStore: DataStore> std::fmt::Debug for Core<TStore> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Core")
            .field("url", &self.url())
            .field("name", &self.shared.name)
            .field("writable", &self.writable())
            .field("len", &self.len())
            .finish()
    }
}

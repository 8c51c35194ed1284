//! Caches of user facing handles, keyed by both petname and hex key.
//!
//! Repeated gets for the same resource must return the same live handle, so
//! each cache keeps one slot per identity and serializes concurrent
//! construction of the same identity: the first caller builds, everyone else
//! waits on a per-identity gate and then hits the cache.

use crate::error::Result;
use crate::identifier::Resolved;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Implemented by every cached handle kind.
pub(crate) trait Handle: Clone {
    /// A clone of this handle with the shared reference count bumped.
    fn acquire(&self) -> Self;

    /// Process-unique identity of the shared state, for dedup on drain.
    fn instance_id(&self) -> u64;

    /// (hex key, optional petname) this handle is cached under.
    fn cache_ids(&self) -> (String, Option<String>);
}

pub(crate) struct HandleCache<T: Handle> {
    slots: Mutex<HashMap<String, T>>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<T: Handle> Default for HandleCache<T> {
    fn default() -> Self {
        HandleCache {
            slots: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Handle> HandleCache<T> {
    fn lookup(&self, resolved: &Resolved) -> Option<T> {
        let slots = self.slots.lock().unwrap();
        if let Some(name) = resolved.name() {
            if let Some(hit) = slots.get(name) {
                return Some(hit.clone());
            }
        }
        if let Some(key) = resolved.key() {
            if let Some(hit) = slots.get(&crate::identifier::encode_key_hex(key)) {
                return Some(hit.clone());
            }
        }
        None
    }

    /// Registers a freshly built handle. When another caller already
    /// registered the same resource under its canonical key (aliased
    /// identifiers race through different gates, and an open by key cannot
    /// know the petname slot), the new wrapper is discarded and the
    /// existing instance is returned with its reference count bumped.
    fn insert_or_merge(&self, handle: T) -> (T, bool) {
        let (hex, name) = handle.cache_ids();
        let mut slots = self.slots.lock().unwrap();
        if let Some(hit) = slots.get(&hex) {
            let hit = hit.clone();
            if let Some(name) = name {
                slots.insert(name, hit.clone());
            }
            return (hit.acquire(), false);
        }
        slots.insert(hex, handle.clone());
        if let Some(name) = name {
            slots.insert(name, handle.clone());
        }
        (handle, true)
    }

    /// Returns the cached handle for `resolved`, or builds one with `ctor`.
    /// The `bool` is true when this call created the handle.
    pub(crate) async fn get_or_create<F, Fut>(&self, resolved: &Resolved, ctor: F) -> Result<(T, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(existing) = self.lookup(resolved) {
            return Ok((existing.acquire(), false));
        }

        let id = resolved.cache_id();
        let gate = {
            let mut gates = self.gates.lock().unwrap();
            gates
                .entry(id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        // a concurrent caller may have built it while we waited on the gate
        if let Some(existing) = self.lookup(resolved) {
            return Ok((existing.acquire(), false));
        }

        let outcome = ctor().await;
        self.gates.lock().unwrap().remove(&id);
        let handle = outcome?;
        Ok(self.insert_or_merge(handle))
    }

    /// Cached handle wrapping for derived kinds whose construction is
    /// synchronous once the underlying log handle exists.
    pub(crate) fn get_or_insert_with<F>(&self, hex: &str, name: Option<&str>, build: F) -> (T, bool)
    where
        F: FnOnce() -> T,
    {
        let mut slots = self.slots.lock().unwrap();
        if let Some(hit) = slots.get(hex) {
            return (hit.clone(), false);
        }
        let handle = build();
        slots.insert(hex.to_string(), handle.clone());
        if let Some(name) = name {
            slots.insert(name.to_string(), handle.clone());
        }
        (handle, true)
    }

    /// Removes every slot for a closing handle, petname aliases included.
    /// Runs synchronously from the close path, before the underlying
    /// resource is torn down, so a concurrent get builds a fresh handle
    /// instead of reviving this one.
    pub(crate) fn evict(&self, hex: &str) {
        let mut slots = self.slots.lock().unwrap();
        slots.retain(|_, handle| handle.cache_ids().0 != hex);
    }

    /// Empties the cache, returning each distinct handle once.
    pub(crate) fn drain(&self) -> Vec<T> {
        let mut slots = self.slots.lock().unwrap();
        let mut seen = std::collections::HashSet::new();
        slots
            .drain()
            .filter_map(|(_, handle)| seen.insert(handle.instance_id()).then(|| handle))
            .collect()
    }
}

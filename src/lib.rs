//! Resolution and lifecycle layer in front of a peer to peer content
//! network.
//!
//! The [`Sdk`] facade turns identifiers (raw keys, encoded keys, petnames,
//! `hyper://` URLs with DNSLink hostnames) into live resource handles,
//! deduplicates handles per resource, reference counts their teardown, and
//! coordinates peer discovery and replication around them.
//!
//! The backend is chosen by [`SdkTypes`]: [`Types`] persists to disk,
//! [`TestTypes`] keeps everything in memory. Both use the in-process swarm,
//! so instances sharing a [`MemHub`] replicate with each other.

mod bee;
mod cache;
mod discovery;
pub mod dns;
mod drive;
pub mod error;
pub mod identifier;
pub mod options;
pub mod p2p;
pub mod repo;
mod resource;
pub mod store;

pub use bee::Bee;
pub use dns::{DnsResolver, HttpFetcher, TxtFetcher, DEFAULT_DNS_RESOLVER};
pub use drive::Drive;
pub use error::{Error, Result};
pub use identifier::{classify, Identifier, Resolved, HYPER_PROTOCOL_SCHEME, KEY_BYTES};
pub use options::{CoreOpts, GetOpts, SdkOptions, ValueEncoding};
pub use p2p::{Connection, Discovery, JoinOpts, MemHub, MemSwarm, Swarm, DEFAULT_JOIN_OPTS};
pub use repo::{Column, DataStore, KvDataStore, MemDataStore};
pub use resource::Core;
pub use store::Corestore;

use crate::cache::{Handle, HandleCache};
use crate::p2p::SwarmOptions;
use crate::store::CoreSource;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Backend selection for an [`Sdk`] instance.
pub trait SdkTypes: Clone + Send + Sync + 'static {
    type TDataStore: DataStore;
    type TSwarm: Swarm;
}

/// Default on-disk backend.
#[derive(Clone, Debug)]
pub struct Types;

impl SdkTypes for Types {
    type TDataStore = KvDataStore;
    type TSwarm = MemSwarm;
}

/// Fully in-memory backend for tests.
#[derive(Clone, Debug)]
pub struct TestTypes;

impl SdkTypes for TestTypes {
    type TDataStore = MemDataStore;
    type TSwarm = MemSwarm;
}

struct SdkInner<T: SdkTypes> {
    options: SdkOptions,
    store: Arc<T::TDataStore>,
    corestore: Arc<Corestore<T::TDataStore>>,
    swarm: T::TSwarm,
    dns: DnsResolver<T::TDataStore>,
    cores: HandleCache<Core<T::TDataStore>>,
    bees: HandleCache<Bee<T::TDataStore>>,
    drives: HandleCache<Drive<T::TDataStore>>,
    closed: AtomicBool,
}

pub struct Sdk<T: SdkTypes> {
    inner: Arc<SdkInner<T>>,
}

impl<T: SdkTypes> Clone for Sdk<T> {
    fn clone(&self) -> Self {
        Sdk {
            inner: self.inner.clone(),
        }
    }
}

impl<T: SdkTypes> Sdk<T> {
    /// Opens an instance: storage, derivation secret, swarm registration.
    pub async fn create(options: SdkOptions) -> Result<Sdk<T>> {
        let path = match options.storage.clone() {
            Some(path) => path,
            None => {
                // a persistent backend still needs a directory; a random
                // one keeps two default instances off the same lock
                use rand::RngCore;
                let mut tag = [0u8; 8];
                rand::thread_rng().fill_bytes(&mut tag);
                std::env::temp_dir().join(format!("hyper-sdk-{}", hex::encode(tag)))
            }
        };
        let store = Arc::new(T::TDataStore::new(path));
        Self::with_parts(options, store, None).await
    }

    /// Like [`create`](Sdk::create) but with an externally built datastore
    /// and an optional DNS transport, the injection points tests use.
    pub async fn with_parts(
        options: SdkOptions,
        store: Arc<T::TDataStore>,
        fetcher: Option<Box<dyn TxtFetcher>>,
    ) -> Result<Sdk<T>> {
        store.init().await?;
        let corestore = Corestore::open(store.clone()).await?;
        let swarm = T::TSwarm::bind(SwarmOptions {
            peer_id: corestore.public_key(),
            hub: options.hub.clone(),
            replicate: options.do_replicate,
        })?;
        swarm.attach(corestore.clone() as Arc<dyn CoreSource>);

        let dns = DnsResolver::new(
            store.clone(),
            options.dns_resolver.clone(),
            fetcher.unwrap_or_else(|| Box::new(HttpFetcher::new())),
        );

        let inner = Arc::new(SdkInner {
            options,
            store,
            corestore,
            swarm,
            dns,
            cores: HandleCache::default(),
            bees: HandleCache::default(),
            drives: HandleCache::default(),
            closed: AtomicBool::new(false),
        });
        Ok(Sdk { inner })
    }

    /// Stable identity of this instance towards peers.
    pub fn public_key(&self) -> [u8; KEY_BYTES] {
        self.inner.corestore.public_key()
    }

    /// Resolves a DNSLink hostname to its encoded key.
    pub async fn resolve_dns_to_key(&self, hostname: &str) -> Result<String> {
        self.inner.dns.resolve(hostname).await
    }

    /// Classifies an identifier and resolves DNS hostnames, yielding the
    /// key or name a resource can be opened with.
    pub async fn resolve_name_or_key(&self, identifier: &str) -> Result<Resolved> {
        match classify(identifier)? {
            Identifier::RawKey(key) => Ok(Resolved::from_key(key)),
            Identifier::Name(name) => Resolved::from_name(name),
            Identifier::Url { hostname, .. } => {
                let encoded = self.inner.dns.resolve(&hostname).await?;
                let key = identifier::decode_key(&encoded).ok_or_else(|| {
                    Error::InvalidIdentifier(format!(
                        "dnslink for {:?} is not an encoded key: {:?}",
                        hostname, encoded
                    ))
                })?;
                Ok(Resolved::from_key(key))
            }
        }
    }

    /// Opens (or returns the cached handle for) the log a string identifier
    /// names.
    pub async fn get(&self, identifier: &str, opts: GetOpts) -> Result<Core<T::TDataStore>> {
        let resolved = self.resolve_name_or_key(identifier).await?;
        self.open_core(resolved, opts).await
    }

    /// Opens a log directly by raw key bytes.
    pub async fn get_key(
        &self,
        key: [u8; KEY_BYTES],
        opts: GetOpts,
    ) -> Result<Core<T::TDataStore>> {
        self.open_core(Resolved::from_key(key), opts).await
    }

    /// Opens the key-value view over the identified log.
    pub async fn get_bee(&self, identifier: &str, opts: GetOpts) -> Result<Bee<T::TDataStore>> {
        let encoding = opts
            .value_encoding
            .unwrap_or(self.inner.options.default_core_opts.value_encoding);
        let core = self.get(identifier, opts).await?;
        let (hex, name) = core.cache_ids();
        let (bee, _created) = self
            .inner
            .bees
            .get_or_insert_with(&hex, name.as_deref(), || Bee::new(core.clone(), encoding));
        Ok(bee)
    }

    /// Opens the file tree view over the identified log.
    pub async fn get_drive(
        &self,
        identifier: &str,
        opts: GetOpts,
    ) -> Result<Drive<T::TDataStore>> {
        let encoding = opts
            .value_encoding
            .unwrap_or(self.inner.options.default_core_opts.value_encoding);
        let core = self.get(identifier, opts).await?;
        let (hex, name) = core.cache_ids();
        let (drive, _created) = self
            .inner
            .drives
            .get_or_insert_with(&hex, name.as_deref(), || {
                Drive::new(Bee::new(core.clone(), encoding))
            });
        Ok(drive)
    }

    /// A view that opens resources under a fixed namespace, so names used
    /// by different applications cannot collide.
    pub fn namespace(&self, namespace: impl Into<String>) -> Namespace<T> {
        Namespace {
            sdk: self.clone(),
            namespace: namespace.into(),
        }
    }

    /// Topic for meeting peers by well-known name. Depends only on the
    /// name, every instance derives the same topic.
    pub fn make_topic_key(name: &str) -> [u8; KEY_BYTES] {
        let mut hasher = Sha256::new();
        hasher.update(b"hyper-sdk topic");
        hasher.update(name.as_bytes());
        hasher.finalize().into()
    }

    /// Joins discovery for an already opened resource, e.g. one opened
    /// through a namespace with auto-join disabled.
    pub async fn join_core(
        &self,
        core: &Core<T::TDataStore>,
        opts: Option<JoinOpts>,
    ) -> Result<()> {
        let opts = opts.unwrap_or(self.inner.options.default_join_opts);
        discovery::join_resource(&self.inner.swarm, core, opts).await
    }

    /// Joins a raw topic that is not tied to a resource.
    pub async fn join(&self, topic: [u8; KEY_BYTES], opts: Option<JoinOpts>) -> Result<Discovery> {
        let opts = opts.unwrap_or(self.inner.options.default_join_opts);
        self.inner.swarm.join(topic, opts).await
    }

    pub async fn leave(&self, topic: [u8; KEY_BYTES]) -> Result<()> {
        self.inner.swarm.leave(topic).await
    }

    pub fn join_peer(&self, id: [u8; KEY_BYTES]) {
        self.inner.swarm.join_peer(id);
    }

    pub fn leave_peer(&self, id: [u8; KEY_BYTES]) {
        self.inner.swarm.leave_peer(id);
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.swarm.connections()
    }

    /// Stream of newly established connections, yielded once. Useful for
    /// driving manual replication when `do_replicate` is off.
    pub fn connection_events(
        &self,
    ) -> Option<tokio::sync::mpsc::UnboundedReceiver<Connection>> {
        self.inner.swarm.connection_events()
    }

    /// Manually wires replication for a connection, for instances created
    /// with `do_replicate` off.
    pub fn replicate(&self, connection: &Connection) {
        connection.replicate();
    }

    /// Resolves once pending network announces have settled.
    pub async fn ready(&self) -> Result<()> {
        self.inner.swarm.flush().await
    }

    /// Tears the instance down: every live handle and the swarm are closed
    /// concurrently, then the datastore (which also holds the durable DNS
    /// cache) is flushed and released. Errors are collected, teardown of
    /// the remaining resources continues past individual failures.
    pub async fn close(&self) -> Result<()> {
        use futures::future::BoxFuture;
        use futures::FutureExt;

        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let handles = self.inner.cores.drain();
        let mut closers: Vec<BoxFuture<'_, Result<()>>> = handles
            .iter()
            .map(|core| core.teardown().boxed())
            .collect();
        closers.push(self.inner.swarm.close().boxed());
        let total = closers.len() + 1;

        let results = futures::future::join_all(closers).await;
        let store_result = self.inner.store.close().await;

        let mut failures: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
        if let Err(e) = store_result {
            failures.push(e);
        }
        if failures.is_empty() {
            Ok(())
        } else {
            let failed = failures.len();
            let first = failures.remove(0).to_string();
            Err(Error::ShutdownFailed {
                failed,
                total,
                first,
            })
        }
    }

    async fn open_core(&self, resolved: Resolved, opts: GetOpts) -> Result<Core<T::TDataStore>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let persist = opts
            .persist
            .unwrap_or(self.inner.options.default_core_opts.persist);
        let namespace = opts
            .namespace
            .clone()
            .unwrap_or_else(|| self.inner.options.default_core_opts.namespace.clone());
        let corestore = self.inner.corestore.clone();
        let weak = Arc::downgrade(&self.inner);
        let ctor_resolved = resolved.clone();

        let (core, created) = self
            .inner
            .cores
            .get_or_create(&resolved, move || async move {
                let raw = match (ctor_resolved.key(), ctor_resolved.name()) {
                    (Some(key), _) => corestore.get_by_key(*key, persist).await?,
                    (None, Some(name)) => {
                        corestore.get_by_name(&namespace, name, persist).await?
                    }
                    (None, None) => return Err(Error::UnresolvedIdentifier),
                };
                let core = Core::new(raw, ctor_resolved.name().map(str::to_string));
                let (hex, _) = core.cache_ids();
                let key = core.key();
                // when the last handle closes, drop every cache slot and
                // the registry entry before the log is torn down
                core.on_close(Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.cores.evict(&hex);
                        inner.bees.evict(&hex);
                        inner.drives.evict(&hex);
                        inner.corestore.remove(&key);
                    }
                }));
                Ok(core)
            })
            .await?;

        if created && opts.auto_join.unwrap_or(self.inner.options.auto_join) {
            let join_opts = opts.join.unwrap_or(self.inner.options.default_join_opts);
            discovery::join_resource(&self.inner.swarm, &core, join_opts).await?;
        }
        Ok(core)
    }
}

impl<T: SdkTypes> std::fmt::Debug for Sdk<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Sdk")
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

/// Resource opener bound to a namespace, from [`Sdk::namespace`].
pub struct Namespace<T: SdkTypes> {
    sdk: Sdk<T>,
    namespace: String,
}

impl<T: SdkTypes> Namespace<T> {
    pub fn name(&self) -> &str {
        &self.namespace
    }

    pub async fn get(&self, identifier: &str, mut opts: GetOpts) -> Result<Core<T::TDataStore>> {
        opts.namespace.get_or_insert_with(|| self.namespace.clone());
        self.sdk.get(identifier, opts).await
    }

    pub async fn get_bee(&self, identifier: &str, mut opts: GetOpts) -> Result<Bee<T::TDataStore>> {
        opts.namespace.get_or_insert_with(|| self.namespace.clone());
        self.sdk.get_bee(identifier, opts).await
    }

    pub async fn get_drive(
        &self,
        identifier: &str,
        mut opts: GetOpts,
    ) -> Result<Drive<T::TDataStore>> {
        opts.namespace.get_or_insert_with(|| self.namespace.clone());
        self.sdk.get_drive(identifier, opts).await
    }
}

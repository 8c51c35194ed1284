//! Peer discovery and replication plumbing.
//!
//! The `Swarm` trait is the seam between the sdk facade and a concrete
//! network backend. The backend shipped here is an in-process hub which
//! rendezvouses every instance bound to it and mirrors matching logs between
//! them, so multi-instance behavior is fully exercisable without sockets.

use crate::error::{Error, Result};
use crate::identifier::KEY_BYTES;
use crate::store::{CoreSource, Replicable};
use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// How a topic is joined: announce it (server), look it up (client), or
/// both. Matching requires an announcing side and a looking side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinOpts {
    pub server: bool,
    pub client: bool,
}

pub const DEFAULT_JOIN_OPTS: JoinOpts = JoinOpts {
    server: true,
    client: true,
};

impl Default for JoinOpts {
    fn default() -> Self {
        DEFAULT_JOIN_OPTS
    }
}

fn compatible(a: JoinOpts, b: JoinOpts) -> bool {
    (a.server && b.client) || (a.client && b.server)
}

type Leaver = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// An active topic registration. Dropping it does not leave the topic, the
/// owning resource or the sdk does that explicitly.
pub struct Discovery {
    topic: [u8; KEY_BYTES],
    flushed: Shared<BoxFuture<'static, ()>>,
    leaver: Option<Leaver>,
}

impl Discovery {
    pub(crate) fn new(topic: [u8; KEY_BYTES], flushed: BoxFuture<'static, ()>, leaver: Leaver) -> Self {
        Discovery {
            topic,
            flushed: flushed.shared(),
            leaver: Some(leaver),
        }
    }

    pub fn topic(&self) -> [u8; KEY_BYTES] {
        self.topic
    }

    /// Resolves once the initial announce round for this topic is done.
    pub async fn flushed(&self) {
        self.flushed.clone().await
    }

    pub(crate) fn flushed_future(&self) -> Shared<BoxFuture<'static, ()>> {
        self.flushed.clone()
    }

    /// Withdraws the registration.
    pub async fn leave(mut self) -> Result<()> {
        match self.leaver.take() {
            Some(leaver) => leaver().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Discovery")
            .field("topic", &hex::encode(self.topic))
            .finish()
    }
}

/// A live link to one remote peer. Carries enough context to wire up
/// replication for any log both sides have open.
#[derive(Clone)]
pub struct Connection {
    remote_peer: [u8; KEY_BYTES],
    local: Weak<dyn CoreSource>,
    remote: Weak<dyn CoreSource>,
    hub: Weak<MemHub>,
}

impl Connection {
    pub fn remote_public_key(&self) -> [u8; KEY_BYTES] {
        self.remote_peer
    }

    /// Starts mirroring every local log the remote side also has open.
    /// Already mirrored pairs are skipped.
    pub fn replicate(&self) {
        let (local, remote, hub) = match (
            self.local.upgrade(),
            self.remote.upgrade(),
            self.hub.upgrade(),
        ) {
            (Some(l), Some(r), Some(h)) => (l, r, h),
            _ => return,
        };
        for core in local.replicable_cores() {
            if let Some(counterpart) = remote.core_by_discovery(&core.discovery_key()) {
                hub.link_pair(core, counterpart);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Connection")
            .field("remote_peer", &hex::encode(self.remote_peer))
            .finish()
    }
}

/// Backend construction parameters. A backend that manages its own network
/// ignores the hub.
#[derive(Clone)]
pub struct SwarmOptions {
    pub peer_id: [u8; KEY_BYTES],
    pub hub: Option<Arc<MemHub>>,
    /// Mirror matching logs automatically when topics meet. When off, only
    /// manual [`Connection::replicate`] moves data.
    pub replicate: bool,
}

impl Default for SwarmOptions {
    fn default() -> Self {
        SwarmOptions {
            peer_id: [0u8; KEY_BYTES],
            hub: None,
            replicate: true,
        }
    }
}

/// Discovery and connection surface the sdk drives.
#[async_trait]
pub trait Swarm: Clone + Send + Sync + 'static {
    fn bind(options: SwarmOptions) -> Result<Self>;

    /// Hands the backend the view of locally open logs. Called once during
    /// sdk construction, before any join.
    fn attach(&self, source: Arc<dyn CoreSource>);

    async fn join(&self, topic: [u8; KEY_BYTES], opts: JoinOpts) -> Result<Discovery>;

    async fn leave(&self, topic: [u8; KEY_BYTES]) -> Result<()>;

    fn join_peer(&self, id: [u8; KEY_BYTES]);

    fn leave_peer(&self, id: [u8; KEY_BYTES]);

    fn connections(&self) -> Vec<Connection>;

    /// Stream of newly established connections. Yields the receiver only on
    /// the first call.
    fn connection_events(&self) -> Option<UnboundedReceiver<Connection>>;

    /// Resolves when pending announces have settled.
    async fn flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

struct PeerEntry {
    // None until the owning instance attaches its corestore
    source: Option<Weak<dyn CoreSource>>,
    topics: HashMap<[u8; KEY_BYTES], JoinOpts>,
    events: UnboundedSender<Connection>,
    replicates: bool,
}

#[derive(Default)]
struct HubState {
    peers: HashMap<[u8; KEY_BYTES], PeerEntry>,
    connected: HashSet<([u8; KEY_BYTES], [u8; KEY_BYTES])>,
}

/// In-process rendezvous point. Every instance bound to the same hub is on
/// the same "network".
#[derive(Default)]
pub struct MemHub {
    state: Mutex<HubState>,
    // replica id pairs with live mirror tasks, so repeated joins and manual
    // replicate calls never double-deliver; pruned when the mirrors exit
    linked: Mutex<HashSet<(u64, u64)>>,
}

fn ordered_pair(a: [u8; KEY_BYTES], b: [u8; KEY_BYTES]) -> ([u8; KEY_BYTES], [u8; KEY_BYTES]) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl MemHub {
    pub fn new() -> Arc<MemHub> {
        Arc::new(MemHub::default())
    }

    fn register(
        &self,
        peer: [u8; KEY_BYTES],
        events: UnboundedSender<Connection>,
        replicates: bool,
    ) {
        let mut state = self.state.lock().unwrap();
        state.peers.insert(
            peer,
            PeerEntry {
                source: None,
                topics: HashMap::new(),
                events,
                replicates,
            },
        );
    }

    fn attach(&self, peer: [u8; KEY_BYTES], source: Weak<dyn CoreSource>) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.peers.get_mut(&peer) {
            entry.source = Some(source);
        }
    }

    fn unregister(&self, peer: [u8; KEY_BYTES]) {
        let mut state = self.state.lock().unwrap();
        state.peers.remove(&peer);
        state.connected.retain(|(a, b)| *a != peer && *b != peer);
    }

    fn join(self: &Arc<Self>, peer: [u8; KEY_BYTES], topic: [u8; KEY_BYTES], opts: JoinOpts) {
        let (my_source, my_events, my_replicates, candidates) = {
            let mut state = self.state.lock().unwrap();
            let (my_source, my_events, my_replicates) = match state.peers.get_mut(&peer) {
                Some(entry) => {
                    entry.topics.insert(topic, opts);
                    match entry.source.clone() {
                        Some(source) => (source, entry.events.clone(), entry.replicates),
                        None => return,
                    }
                }
                None => return,
            };
            let candidates: Vec<_> = state
                .peers
                .iter()
                .filter(|(id, _)| **id != peer)
                .filter_map(|(id, entry)| {
                    let source = entry.source.clone()?;
                    entry
                        .topics
                        .get(&topic)
                        .copied()
                        .filter(|other| compatible(opts, *other))
                        .map(|_| (*id, source, entry.events.clone(), entry.replicates))
                })
                .collect();
            (my_source, my_events, my_replicates, candidates)
        };

        for (other_id, other_source, other_events, other_replicates) in candidates {
            if my_replicates && other_replicates {
                if let (Some(local), Some(remote)) = (my_source.upgrade(), other_source.upgrade())
                {
                    if let (Some(ours), Some(theirs)) = (
                        local.core_by_discovery(&topic),
                        remote.core_by_discovery(&topic),
                    ) {
                        self.link_pair(ours, theirs);
                    }
                }
            }
            let newly = {
                let mut state = self.state.lock().unwrap();
                state.connected.insert(ordered_pair(peer, other_id))
            };
            if newly {
                let _ = my_events.send(Connection {
                    remote_peer: other_id,
                    local: my_source.clone(),
                    remote: other_source.clone(),
                    hub: Arc::downgrade(self),
                });
                let _ = other_events.send(Connection {
                    remote_peer: peer,
                    local: other_source,
                    remote: my_source.clone(),
                    hub: Arc::downgrade(self),
                });
            }
        }
    }

    fn leave(&self, peer: [u8; KEY_BYTES], topic: [u8; KEY_BYTES]) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.peers.get_mut(&peer) {
            entry.topics.remove(&topic);
        }
    }

    fn connect_peers(self: &Arc<Self>, from: [u8; KEY_BYTES], to: [u8; KEY_BYTES]) {
        let mut notify = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let sides = match (state.peers.get(&from), state.peers.get(&to)) {
                (Some(a), Some(b)) => match (a.source.clone(), b.source.clone()) {
                    (Some(a_src), Some(b_src)) => {
                        [(a.events.clone(), a_src), (b.events.clone(), b_src)]
                    }
                    _ => return,
                },
                _ => return,
            };
            if state.connected.insert(ordered_pair(from, to)) {
                let [(a_events, a_src), (b_events, b_src)] = sides;
                notify.push((
                    a_events,
                    Connection {
                        remote_peer: to,
                        local: a_src.clone(),
                        remote: b_src.clone(),
                        hub: Arc::downgrade(self),
                    },
                ));
                notify.push((
                    b_events,
                    Connection {
                        remote_peer: from,
                        local: b_src,
                        remote: a_src,
                        hub: Arc::downgrade(self),
                    },
                ));
            }
        }
        for (events, connection) in notify {
            let _ = events.send(connection);
        }
    }

    fn disconnect_peers(&self, from: [u8; KEY_BYTES], to: [u8; KEY_BYTES]) {
        let mut state = self.state.lock().unwrap();
        state.connected.remove(&ordered_pair(from, to));
    }

    fn connections_of(self: &Arc<Self>, peer: [u8; KEY_BYTES]) -> Vec<Connection> {
        let state = self.state.lock().unwrap();
        let mine = match state.peers.get(&peer) {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        state
            .connected
            .iter()
            .filter_map(|(a, b)| {
                let other = if *a == peer {
                    Some(*b)
                } else if *b == peer {
                    Some(*a)
                } else {
                    None
                }?;
                let theirs = state.peers.get(&other)?;
                Some(Connection {
                    remote_peer: other,
                    local: mine.source.clone()?,
                    remote: theirs.source.clone()?,
                    hub: Arc::downgrade(self),
                })
            })
            .collect()
    }

    /// Spawns mirror tasks in both directions for a pair of logs, at most
    /// one pair of tasks per pair of logs at a time.
    pub(crate) fn link_pair(self: &Arc<Self>, a: Arc<dyn Replicable>, b: Arc<dyn Replicable>) {
        let key = if a.replica_id() <= b.replica_id() {
            (a.replica_id(), b.replica_id())
        } else {
            (b.replica_id(), a.replica_id())
        };
        if !self.linked.lock().unwrap().insert(key) {
            return;
        }
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            let forward = tokio::spawn(mirror(a.clone(), b.clone()));
            let backward = tokio::spawn(mirror(b, a));
            let _ = forward.await;
            let _ = backward.await;
            // both directions are done, drop the bookkeeping entry
            if let Some(hub) = hub.upgrade() {
                hub.linked.lock().unwrap().remove(&key);
            }
        });
    }
}

impl std::fmt::Debug for MemHub {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        fmt.debug_struct("MemHub")
            .field("peers", &state.peers.len())
            .field("connected", &state.connected.len())
            .finish()
    }
}

/// Copies entries from `src` into `dst` whenever `src` grows. Exits when
/// either side closes.
async fn mirror(src: Arc<dyn Replicable>, dst: Arc<dyn Replicable>) {
    let mut length = src.subscribe_len();
    loop {
        if src.is_closed() || dst.is_closed() {
            return;
        }
        let src_len = src.replica_len();
        let dst_len = dst.replica_len();
        if !dst.writable() && src_len > dst_len {
            let mut batch = Vec::with_capacity((src_len - dst_len) as usize);
            for seq in dst_len..src_len {
                match src.replica_entry(seq) {
                    Some(entry) => batch.push(entry),
                    None => break,
                }
            }
            if let Err(e) = dst.ingest(dst_len, batch).await {
                tracing::debug!("mirror delivery stopped: {}", e);
                return;
            }
        }
        if length.changed().await.is_err() {
            return;
        }
    }
}

struct MemSwarmInner {
    peer_id: [u8; KEY_BYTES],
    hub: Arc<MemHub>,
    events: Mutex<Option<UnboundedReceiver<Connection>>>,
    closed: AtomicBool,
}

/// The embedded backend: a peer registered on a `MemHub`.
#[derive(Clone)]
pub struct MemSwarm {
    inner: Arc<MemSwarmInner>,
}

impl MemSwarm {
    /// Binds a fresh peer with a random identity onto an existing hub.
    pub fn with_hub(hub: Arc<MemHub>) -> MemSwarm {
        use rand::RngCore;
        let mut peer_id = [0u8; KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut peer_id);
        Self::bind_to(peer_id, hub, true)
    }

    fn bind_to(peer_id: [u8; KEY_BYTES], hub: Arc<MemHub>, replicate: bool) -> MemSwarm {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register(peer_id, tx, replicate);
        MemSwarm {
            inner: Arc::new(MemSwarmInner {
                peer_id,
                hub,
                events: Mutex::new(Some(rx)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn peer_id(&self) -> [u8; KEY_BYTES] {
        self.inner.peer_id
    }

    pub fn hub(&self) -> Arc<MemHub> {
        self.inner.hub.clone()
    }
}

#[async_trait]
impl Swarm for MemSwarm {
    fn bind(options: SwarmOptions) -> Result<MemSwarm> {
        let hub = options.hub.unwrap_or_else(MemHub::new);
        Ok(Self::bind_to(options.peer_id, hub, options.replicate))
    }

    fn attach(&self, source: Arc<dyn CoreSource>) {
        self.inner
            .hub
            .attach(self.inner.peer_id, Arc::downgrade(&source));
    }

    async fn join(&self, topic: [u8; KEY_BYTES], opts: JoinOpts) -> Result<Discovery> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.inner.hub.join(self.inner.peer_id, topic, opts);
        let hub = self.inner.hub.clone();
        let peer_id = self.inner.peer_id;
        let leaver: Leaver = Box::new(move || {
            async move {
                hub.leave(peer_id, topic);
                Ok(())
            }
            .boxed()
        });
        // the hub matches synchronously, the announce is settled on return
        Ok(Discovery::new(topic, futures::future::ready(()).boxed(), leaver))
    }

    async fn leave(&self, topic: [u8; KEY_BYTES]) -> Result<()> {
        self.inner.hub.leave(self.inner.peer_id, topic);
        Ok(())
    }

    fn join_peer(&self, id: [u8; KEY_BYTES]) {
        self.inner.hub.connect_peers(self.inner.peer_id, id);
    }

    fn leave_peer(&self, id: [u8; KEY_BYTES]) {
        self.inner.hub.disconnect_peers(self.inner.peer_id, id);
    }

    fn connections(&self) -> Vec<Connection> {
        self.inner.hub.connections_of(self.inner.peer_id)
    }

    fn connection_events(&self) -> Option<UnboundedReceiver<Connection>> {
        self.inner.events.lock().unwrap().take()
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.hub.unregister(self.inner.peer_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{DataStore, MemDataStore};
    use crate::store::Corestore;
    use std::path::PathBuf;
    use std::time::Duration;

    async fn corestore() -> Arc<Corestore<MemDataStore>> {
        let store = Arc::new(MemDataStore::new(PathBuf::new()));
        Corestore::open(store).await.unwrap()
    }

    fn swarm_on(hub: &Arc<MemHub>, source: &Arc<Corestore<MemDataStore>>) -> MemSwarm {
        let swarm = MemSwarm::with_hub(hub.clone());
        swarm.attach(source.clone() as Arc<dyn CoreSource>);
        swarm
    }

    #[tokio::test]
    async fn matched_topics_mirror_entries() {
        let hub = MemHub::new();
        let writer_store = corestore().await;
        let reader_store = corestore().await;
        let writer_swarm = swarm_on(&hub, &writer_store);
        let reader_swarm = swarm_on(&hub, &reader_store);

        let source = writer_store.get_by_name("ns", "example", true).await.unwrap();
        source.append(b"hello").await.unwrap();
        writer_swarm
            .join(source.discovery_key(), JoinOpts::default())
            .await
            .unwrap();

        let replica = reader_store.get_by_key(source.key(), true).await.unwrap();
        reader_swarm
            .join(replica.discovery_key(), JoinOpts::default())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), replica.update())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replica.entry(0), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn server_only_peers_do_not_match() {
        let hub = MemHub::new();
        let a_store = corestore().await;
        let b_store = corestore().await;
        let a = swarm_on(&hub, &a_store);
        let b = swarm_on(&hub, &b_store);

        let topic = [9u8; KEY_BYTES];
        let server_only = JoinOpts {
            server: true,
            client: false,
        };
        a.join(topic, server_only).await.unwrap();
        b.join(topic, server_only).await.unwrap();
        assert!(a.connections().is_empty());

        // a looking side appears, now both match it
        let c_store = corestore().await;
        let c = swarm_on(&hub, &c_store);
        c.join(
            topic,
            JoinOpts {
                server: false,
                client: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(c.connections().len(), 2);
    }

    #[tokio::test]
    async fn connection_events_fire_once_per_peer() {
        let hub = MemHub::new();
        let a_store = corestore().await;
        let b_store = corestore().await;
        let a = swarm_on(&hub, &a_store);
        let b = swarm_on(&hub, &b_store);

        let mut events = a.connection_events().unwrap();
        assert!(a.connection_events().is_none(), "receiver is yielded once");

        let topic_one = [1u8; KEY_BYTES];
        let topic_two = [2u8; KEY_BYTES];
        a.join(topic_one, JoinOpts::default()).await.unwrap();
        b.join(topic_one, JoinOpts::default()).await.unwrap();
        a.join(topic_two, JoinOpts::default()).await.unwrap();
        b.join(topic_two, JoinOpts::default()).await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.remote_public_key(), b.peer_id());
        assert!(
            events.try_recv().is_err(),
            "second shared topic reuses the connection"
        );
    }

    #[tokio::test]
    async fn mirror_bookkeeping_is_pruned_after_close() {
        let hub = MemHub::new();
        let writer_store = corestore().await;
        let reader_store = corestore().await;
        let writer_swarm = swarm_on(&hub, &writer_store);
        let reader_swarm = swarm_on(&hub, &reader_store);

        let source = writer_store.get_by_name("ns", "example", true).await.unwrap();
        writer_swarm
            .join(source.discovery_key(), JoinOpts::default())
            .await
            .unwrap();
        let replica = reader_store.get_by_key(source.key(), true).await.unwrap();
        reader_swarm
            .join(replica.discovery_key(), JoinOpts::default())
            .await
            .unwrap();
        assert_eq!(hub.linked.lock().unwrap().len(), 1);

        source.close().await.unwrap();
        replica.close().await.unwrap();

        // the supervisor task removes the pair once both mirrors exit
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if hub.linked.lock().unwrap().is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn closed_swarm_rejects_joins() {
        let hub = MemHub::new();
        let store = corestore().await;
        let swarm = swarm_on(&hub, &store);
        swarm.close().await.unwrap();
        assert!(matches!(
            swarm.join([0u8; KEY_BYTES], JoinOpts::default()).await,
            Err(Error::Closed)
        ));
    }
}

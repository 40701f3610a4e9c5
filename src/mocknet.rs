//! # Virtual Network
//!
//! An in-process substrate with many independent peer endpoints. Peers are
//! joined by [`Link`]s that carry latency and bandwidth settings; dialing a
//! peer realises a [`Connection`] over one of those links, and connections
//! multiplex [`Stream`]s whose bytes are shaped by the link.
//!
//! ## Ownership
//!
//! The [`Mocknet`] registry owns peers and the link table. Links,
//! connections and streams are indexed by stable numeric ids and only hold
//! weak handles back to the registry and their endpoints, so self-loops and
//! parallel links never form reference cycles.
//!
//! ## Connection Reuse
//!
//! [`PeerNet::connect`] returns any open connection to the same remote peer,
//! whatever link it runs over. Only when none exists is a link picked,
//! uniformly at random among the links between the pair.
//!
//! ## Locking
//!
//! All locks are short `parking_lot` critical sections that are never held
//! across an await. A dial holds the link table lock while it registers the
//! new connection on both endpoints (one endpoint lock at a time), so an
//! [`Mocknet::unlink`] either sees the connection and closes it, or runs
//! first and the dial fails with `NoRouteToPeer`.
//!
//! ## Notifications
//!
//! Every observer registered with [`PeerNet::notify`] gets its own unbounded
//! queue. Events for one connection are enqueued in the order they happen;
//! a slow observer never holds up another.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tracing::{debug, trace};

use crate::config::LinkOptions;
use crate::context::OpContext;
use crate::error::NetError;
use crate::identity::{Keypair, PeerId, PeerInfo};
use crate::ratelimit::{self, RateLimiter};
use crate::stream::{self, Stream, StreamShared};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectedness {
    Connected,
    NotConnected,
}

/// One side's view of a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnInfo {
    pub id: ConnId,
    pub link: LinkId,
    pub local: PeerId,
    pub remote: PeerId,
    pub remote_addrs: Vec<String>,
    pub direction: Direction,
}

/// One side's view of a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: StreamId,
    pub conn: ConnId,
    pub local: PeerId,
    pub remote: PeerId,
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetEvent {
    ListenAddrAdded(String),
    ListenAddrRemoved(String),
    Connected(ConnInfo),
    Disconnected(ConnInfo),
    StreamOpened(StreamInfo),
    StreamClosed(StreamInfo),
}

/// An observer registration; events arrive in [`Subscription::next`].
#[derive(Debug)]
pub struct Subscription {
    id: ObserverId,
    events: mpsc::UnboundedReceiver<NetEvent>,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Next event, or `None` once the observer has been removed.
    pub async fn next(&mut self) -> Option<NetEvent> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<NetEvent> {
        self.events.try_recv().ok()
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Clone, Default)]
pub struct Mocknet {
    inner: Arc<NetInner>,
}

#[derive(Default)]
struct NetInner {
    peers: RwLock<BTreeMap<PeerId, PeerNet>>,
    links: Mutex<BTreeMap<LinkId, LinkEntry>>,
    link_defaults: RwLock<LinkOptions>,
    next_id: AtomicU64,
}

struct LinkEntry {
    link: Link,
    /// Dialer halves of the connections routed over this link.
    conns: BTreeMap<ConnId, Connection>,
}

impl NetInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn dial(self: &Arc<Self>, from: &PeerNet, to: PeerId) -> Result<Connection, NetError> {
        if let Some(existing) = from.first_conn_to(&to) {
            return Ok(existing);
        }

        let mut links = self.links.lock();
        // A concurrent dial may have registered a connection meanwhile.
        if let Some(existing) = from.first_conn_to(&to) {
            return Ok(existing);
        }

        let candidates: Vec<LinkId> = links
            .values()
            .filter(|entry| entry.link.connects(&from.id(), &to))
            .map(|entry| entry.link.id())
            .collect();
        let link_id = *candidates
            .choose(&mut rand::thread_rng())
            .ok_or(NetError::NoRouteToPeer { from: from.id(), to })?;
        let remote = self
            .peers
            .read()
            .get(&to)
            .cloned()
            .ok_or(NetError::UnknownPeer(to))?;
        let entry = links.get_mut(&link_id).ok_or(NetError::LinkMissing)?;

        let ids = [ConnId(self.next_id()), ConnId(self.next_id())];
        let shared = Arc::new(ConnShared::new(ids, entry.link.clone(), from, &remote, Arc::downgrade(self)));
        let local = Connection { shared: shared.clone(), side: 0 };
        let remote_half = Connection { shared, side: 1 };

        from.inner.conns.write().insert(ids[0], local.clone());
        remote.inner.conns.write().insert(ids[1], remote_half.clone());
        entry.conns.insert(ids[0], local.clone());

        // Emitted under the link lock so a racing close cannot report the
        // disconnect first.
        from.inner.emit(NetEvent::Connected(local.info()));
        remote.inner.emit(NetEvent::Connected(remote_half.info()));
        drop(links);

        debug!(
            local = %from.id().short(),
            remote = %to.short(),
            link = ?link_id,
            conn = ?ids[0],
            "connection opened"
        );
        Ok(local)
    }
}

impl Mocknet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer under `id`.
    pub fn add_peer(&self, id: PeerId, listen_addrs: Vec<String>) -> Result<PeerNet, NetError> {
        let mut peers = self.inner.peers.write();
        if peers.contains_key(&id) {
            return Err(NetError::DuplicateIdentity(id));
        }
        let peer = PeerNet {
            inner: Arc::new(PeerInner {
                id,
                net: Arc::downgrade(&self.inner),
                addrs: RwLock::new(listen_addrs),
                conns: RwLock::new(BTreeMap::new()),
                handler: RwLock::new(None),
                observers: Mutex::new(BTreeMap::new()),
                next_observer: AtomicU64::new(0),
            }),
        };
        peers.insert(id, peer.clone());
        trace!(peer = %id.short(), "peer added");
        Ok(peer)
    }

    /// Register a peer with a freshly generated identity and a random local
    /// address.
    pub fn gen_peer(&self) -> Result<(Keypair, PeerNet), NetError> {
        let keypair = Keypair::generate();
        let port: u16 = rand::thread_rng().gen_range(10_000..60_000);
        let addr = format!("/ip4/127.0.0.1/tcp/{port}");
        let peer = self.add_peer(keypair.peer_id(), vec![addr])?;
        Ok((keypair, peer))
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.read().keys().copied().collect()
    }

    pub fn peer(&self, id: &PeerId) -> Option<PeerNet> {
        self.inner.peers.read().get(id).cloned()
    }

    pub fn nets(&self) -> Vec<PeerNet> {
        self.inner.peers.read().values().cloned().collect()
    }

    pub fn link_defaults(&self) -> LinkOptions {
        self.inner.link_defaults.read().clone()
    }

    /// Options applied by [`Mocknet::link_peers`]. Existing links keep
    /// theirs.
    pub fn set_link_defaults(&self, options: LinkOptions) {
        *self.inner.link_defaults.write() = options;
    }

    pub fn link_peers(&self, a: &PeerId, b: &PeerId) -> Result<Link, NetError> {
        self.link_peers_with(a, b, self.link_defaults())
    }

    /// Add a link between `a` and `b`. Each call adds a distinct link; `a`
    /// may equal `b`.
    pub fn link_peers_with(&self, a: &PeerId, b: &PeerId, options: LinkOptions) -> Result<Link, NetError> {
        {
            let peers = self.inner.peers.read();
            for id in [a, b] {
                if !peers.contains_key(id) {
                    return Err(NetError::UnknownPeer(*id));
                }
            }
        }
        let link = Link::new(LinkId(self.inner.next_id()), *a, *b, options);
        self.inner.links.lock().insert(
            link.id(),
            LinkEntry {
                link: link.clone(),
                conns: BTreeMap::new(),
            },
        );
        trace!(a = %a.short(), b = %b.short(), link = ?link.id(), "link added");
        Ok(link)
    }

    pub fn links(&self) -> Vec<Link> {
        self.inner.links.lock().values().map(|e| e.link.clone()).collect()
    }

    pub fn links_between_peers(&self, a: &PeerId, b: &PeerId) -> Vec<Link> {
        self.inner
            .links
            .lock()
            .values()
            .filter(|e| e.link.connects(a, b))
            .map(|e| e.link.clone())
            .collect()
    }

    /// Remove `link` and close every connection routed over it.
    pub fn unlink(&self, link: &Link) -> Result<(), NetError> {
        let entry = self
            .inner
            .links
            .lock()
            .remove(&link.id())
            .ok_or(NetError::LinkMissing)?;
        for conn in entry.conns.values() {
            conn.close();
        }
        trace!(link = ?link.id(), closed = entry.conns.len(), "link removed");
        Ok(())
    }

    pub fn unlink_peers(&self, a: &PeerId, b: &PeerId) -> Result<(), NetError> {
        let links = self.links_between_peers(a, b);
        if links.is_empty() {
            return Err(NetError::LinkMissing);
        }
        for link in &links {
            self.unlink(link)?;
        }
        Ok(())
    }

    pub fn connect_peers(&self, a: &PeerId, b: &PeerId) -> Result<Connection, NetError> {
        let from = self.peer(a).ok_or(NetError::UnknownPeer(*a))?;
        from.connect(b)
    }

    pub fn disconnect_peers(&self, a: &PeerId, b: &PeerId) -> Result<(), NetError> {
        let from = self.peer(a).ok_or(NetError::UnknownPeer(*a))?;
        from.close_peer(b);
        Ok(())
    }

    /// Link every pair of peers, each peer to itself included.
    pub fn link_all(&self) -> Result<(), NetError> {
        let peers = self.peers();
        for (i, a) in peers.iter().enumerate() {
            for b in &peers[i..] {
                self.link_peers(a, b)?;
            }
        }
        Ok(())
    }

    /// Dial every linked pair of distinct peers.
    pub fn connect_all_but_self(&self) -> Result<(), NetError> {
        let peers = self.peers();
        for (i, a) in peers.iter().enumerate() {
            for b in &peers[i + 1..] {
                if !self.links_between_peers(a, b).is_empty() {
                    self.connect_peers(a, b)?;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Links
// ============================================================================

/// A configured path between two peers.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    id: LinkId,
    a: PeerId,
    b: PeerId,
    options: RwLock<LinkOptions>,
    limiter: Mutex<RateLimiter>,
}

impl Link {
    fn new(id: LinkId, a: PeerId, b: PeerId, options: LinkOptions) -> Self {
        let limiter = RateLimiter::new(options.bandwidth, options.max_burst);
        Self {
            inner: Arc::new(LinkInner {
                id,
                a,
                b,
                options: RwLock::new(options),
                limiter: Mutex::new(limiter),
            }),
        }
    }

    pub fn id(&self) -> LinkId {
        self.inner.id
    }

    pub fn peers(&self) -> (PeerId, PeerId) {
        (self.inner.a, self.inner.b)
    }

    pub fn options(&self) -> LinkOptions {
        self.inner.options.read().clone()
    }

    /// Change latency and bandwidth for writes made from now on.
    pub fn set_options(&self, options: LinkOptions) {
        self.inner
            .limiter
            .lock()
            .update_bandwidth(options.bandwidth, options.max_burst);
        *self.inner.options.write() = options;
    }

    pub fn connects(&self, a: &PeerId, b: &PeerId) -> bool {
        (self.inner.a == *a && self.inner.b == *b) || (self.inner.a == *b && self.inner.b == *a)
    }

    /// Delay before `bytes` written now reach the other side.
    pub(crate) fn transmit_delay(&self, bytes: usize) -> Duration {
        let latency = self.inner.options.read().latency;
        latency
            .saturating_add(self.inner.limiter.lock().limit(bytes))
            .min(ratelimit::MAX_DELAY)
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.inner.id)
            .field("a", &self.inner.a)
            .field("b", &self.inner.b)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Peer Endpoints
// ============================================================================

/// A simulated host's network endpoint.
#[derive(Clone)]
pub struct PeerNet {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    id: PeerId,
    net: Weak<NetInner>,
    addrs: RwLock<Vec<String>>,
    conns: RwLock<BTreeMap<ConnId, Connection>>,
    handler: RwLock<Option<mpsc::UnboundedSender<Stream>>>,
    observers: Mutex<BTreeMap<ObserverId, mpsc::UnboundedSender<NetEvent>>>,
    next_observer: AtomicU64,
}

impl PeerInner {
    fn emit(&self, event: NetEvent) {
        let mut observers = self.observers.lock();
        observers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn listen_addrs(&self) -> Vec<String> {
        self.addrs.read().clone()
    }
}

impl PeerNet {
    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo::new(self.inner.id, self.inner.listen_addrs())
    }

    pub fn listen_addrs(&self) -> Vec<String> {
        self.inner.listen_addrs()
    }

    pub fn add_listen_addr(&self, addr: impl Into<String>) {
        let addr = addr.into();
        {
            let mut addrs = self.inner.addrs.write();
            if addrs.contains(&addr) {
                return;
            }
            addrs.push(addr.clone());
        }
        self.inner.emit(NetEvent::ListenAddrAdded(addr));
    }

    pub fn remove_listen_addr(&self, addr: &str) -> bool {
        let removed = {
            let mut addrs = self.inner.addrs.write();
            let before = addrs.len();
            addrs.retain(|a| a != addr);
            addrs.len() != before
        };
        if removed {
            self.inner.emit(NetEvent::ListenAddrRemoved(addr.to_string()));
        }
        removed
    }

    /// The registry this endpoint belongs to, if it is still alive.
    pub fn network(&self) -> Option<Mocknet> {
        self.inner.net.upgrade().map(|inner| Mocknet { inner })
    }

    /// Dial `to`, reusing any open connection to it.
    pub fn connect(&self, to: &PeerId) -> Result<Connection, NetError> {
        let net = self.inner.net.upgrade().ok_or(NetError::NetworkClosed)?;
        net.dial(self, *to)
    }

    /// Dial `to` if needed and open a stream on the connection.
    pub fn new_stream(&self, to: &PeerId) -> Result<Stream, NetError> {
        self.connect(to)?.open_stream()
    }

    pub fn conns(&self) -> Vec<Connection> {
        self.inner.conns.read().values().cloned().collect()
    }

    pub fn conns_to_peer(&self, to: &PeerId) -> Vec<Connection> {
        self.inner
            .conns
            .read()
            .values()
            .filter(|c| c.remote_peer() == *to)
            .cloned()
            .collect()
    }

    fn first_conn_to(&self, to: &PeerId) -> Option<Connection> {
        self.inner
            .conns
            .read()
            .values()
            .find(|c| c.remote_peer() == *to && !c.is_closed())
            .cloned()
    }

    /// Distinct remote peers with at least one open connection.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.conns.read().values().map(|c| c.remote_peer()).collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn connectedness(&self, to: &PeerId) -> Connectedness {
        if self.first_conn_to(to).is_some() {
            Connectedness::Connected
        } else {
            Connectedness::NotConnected
        }
    }

    /// Close every connection to `to`.
    pub fn close_peer(&self, to: &PeerId) {
        for conn in self.conns_to_peer(to) {
            conn.close();
        }
    }

    /// Close every connection of this endpoint.
    pub fn close(&self) {
        for conn in self.conns() {
            conn.close();
        }
    }

    /// Route inbound streams to `handler` instead of the per-connection
    /// accept queues.
    pub fn set_stream_handler(&self, handler: mpsc::UnboundedSender<Stream>) {
        *self.inner.handler.write() = Some(handler);
    }

    pub fn remove_stream_handler(&self) {
        self.inner.handler.write().take();
    }

    pub fn notify(&self) -> Subscription {
        let id = ObserverId(self.inner.next_observer.fetch_add(1, Ordering::Relaxed));
        let (tx, events) = mpsc::unbounded_channel();
        self.inner.observers.lock().insert(id, tx);
        Subscription { id, events }
    }

    /// Register `callback` as an observer driven by its own task.
    pub fn notify_with<F>(&self, mut callback: F) -> ObserverId
    where
        F: FnMut(NetEvent) + Send + 'static,
    {
        let mut subscription = self.notify();
        let id = subscription.id();
        tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                callback(event);
            }
        });
        id
    }

    pub fn stop_notify(&self, id: ObserverId) -> bool {
        self.inner.observers.lock().remove(&id).is_some()
    }
}

impl std::fmt::Debug for PeerNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNet").field("id", &self.inner.id).finish_non_exhaustive()
    }
}

// ============================================================================
// Connections
// ============================================================================

/// One side of a connection pair. Side 0 is the dialer.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnShared>,
    side: usize,
}

struct ConnShared {
    ids: [ConnId; 2],
    link: Link,
    ends: [ConnEnd; 2],
    closed: watch::Sender<bool>,
    streams: Mutex<BTreeMap<StreamId, Arc<StreamShared>>>,
    net: Weak<NetInner>,
}

struct ConnEnd {
    peer: PeerId,
    endpoint: Weak<PeerInner>,
    inbound_tx: mpsc::UnboundedSender<Stream>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stream>>,
}

impl ConnEnd {
    fn new(peer: &PeerNet) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            peer: peer.id(),
            endpoint: Arc::downgrade(&peer.inner),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }
}

impl ConnShared {
    fn new(ids: [ConnId; 2], link: Link, dialer: &PeerNet, listener: &PeerNet, net: Weak<NetInner>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            ids,
            link,
            ends: [ConnEnd::new(dialer), ConnEnd::new(listener)],
            closed,
            streams: Mutex::new(BTreeMap::new()),
            net,
        }
    }
}

impl Connection {
    pub fn id(&self) -> ConnId {
        self.shared.ids[self.side]
    }

    pub fn local_peer(&self) -> PeerId {
        self.shared.ends[self.side].peer
    }

    pub fn remote_peer(&self) -> PeerId {
        self.shared.ends[1 - self.side].peer
    }

    pub fn link(&self) -> &Link {
        &self.shared.link
    }

    pub fn direction(&self) -> Direction {
        if self.side == 0 {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }

    pub fn remote_addrs(&self) -> Vec<String> {
        self.shared.ends[1 - self.side]
            .endpoint
            .upgrade()
            .map(|peer| peer.listen_addrs())
            .unwrap_or_default()
    }

    pub fn info(&self) -> ConnInfo {
        ConnInfo {
            id: self.id(),
            link: self.shared.link.id(),
            local: self.local_peer(),
            remote: self.remote_peer(),
            remote_addrs: self.remote_addrs(),
            direction: self.direction(),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().len()
    }

    fn other_side(&self) -> Connection {
        Connection {
            shared: self.shared.clone(),
            side: 1 - self.side,
        }
    }

    fn stream_info(&self, id: StreamId, opener_side: usize) -> StreamInfo {
        StreamInfo {
            id,
            conn: self.id(),
            local: self.local_peer(),
            remote: self.remote_peer(),
            direction: if self.side == opener_side {
                Direction::Outbound
            } else {
                Direction::Inbound
            },
        }
    }

    fn emit(&self, event: NetEvent) {
        if let Some(peer) = self.shared.ends[self.side].endpoint.upgrade() {
            peer.emit(event);
        }
    }

    pub fn open_stream(&self) -> Result<Stream, NetError> {
        let net = self.shared.net.upgrade().ok_or(NetError::NetworkClosed)?;
        let id = StreamId(net.next_id());
        let remote_conn = self.other_side();

        let (local, remote) = {
            let mut streams = self.shared.streams.lock();
            if self.is_closed() {
                return Err(NetError::ConnectionClosed);
            }
            let (local, remote) = stream::pair(id, self.side, self.clone(), remote_conn.clone());
            streams.insert(id, local.shared().clone());
            self.emit(NetEvent::StreamOpened(self.stream_info(id, self.side)));
            remote_conn.emit(NetEvent::StreamOpened(remote_conn.stream_info(id, self.side)));
            (local, remote)
        };

        remote_conn.deliver_inbound(remote);
        trace!(conn = ?self.id(), stream = ?id, "stream opened");
        Ok(local)
    }

    fn deliver_inbound(&self, stream: Stream) {
        let handler = self.shared.ends[self.side]
            .endpoint
            .upgrade()
            .and_then(|peer| peer.handler.read().clone());
        let stream = match handler {
            Some(handler) => match handler.send(stream) {
                Ok(()) => return,
                Err(mpsc::error::SendError(stream)) => stream,
            },
            None => stream,
        };
        // The receiver lives as long as the connection does.
        let _ = self.shared.ends[self.side].inbound_tx.send(stream);
    }

    /// Wait for the remote side to open a stream, bounded by `ctx`.
    pub async fn accept_stream_with_context(&self, ctx: &OpContext) -> Result<Stream, NetError> {
        ctx.run(self.accept_stream()).await?
    }

    /// Wait for the remote side to open a stream or for the connection to
    /// close. See [`accept_stream_with_context`](Self::accept_stream_with_context)
    /// for a bounded wait.
    pub async fn accept_stream(&self) -> Result<Stream, NetError> {
        let closed = self.shared.closed.subscribe();
        let mut inbound = self.shared.ends[self.side].inbound_rx.lock().await;
        tokio::select! {
            biased;
            stream = inbound.recv() => stream.ok_or(NetError::ConnectionClosed),
            _ = wait_closed(closed) => Err(NetError::ConnectionClosed),
        }
    }

    /// Close both sides of the connection, resetting its streams.
    pub fn close(&self) {
        let streams = {
            let mut streams = self.shared.streams.lock();
            if self.shared.closed.send_replace(true) {
                return;
            }
            std::mem::take(&mut *streams)
        };
        for stream in streams.values() {
            stream.reset(self);
        }
        for end in &self.shared.ends {
            if let Ok(mut queue) = end.inbound_rx.try_lock() {
                while let Ok(stream) = queue.try_recv() {
                    stream.reset();
                }
            }
        }

        for (side, end) in self.shared.ends.iter().enumerate() {
            if let Some(peer) = end.endpoint.upgrade() {
                peer.conns.write().remove(&self.shared.ids[side]);
            }
        }
        if let Some(net) = self.shared.net.upgrade() {
            if let Some(entry) = net.links.lock().get_mut(&self.shared.link.id()) {
                entry.conns.remove(&self.shared.ids[0]);
            }
        }

        let other = self.other_side();
        self.emit(NetEvent::Disconnected(self.info()));
        other.emit(NetEvent::Disconnected(other.info()));
        debug!(
            local = %self.local_peer().short(),
            remote = %self.remote_peer().short(),
            conn = ?self.id(),
            "connection closed"
        );
    }

    /// Called once per stream when both directions have finished or the
    /// stream was reset.
    pub(crate) fn stream_finished(&self, id: StreamId, opener_side: usize) {
        let other = self.other_side();
        // Held while emitting so the close cannot overtake the open event.
        let mut streams = self.shared.streams.lock();
        streams.remove(&id);
        self.emit(NetEvent::StreamClosed(self.stream_info(id, opener_side)));
        other.emit(NetEvent::StreamClosed(other.stream_info(id, opener_side)));
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("local", &self.local_peer())
            .field("remote", &self.remote_peer())
            .finish_non_exhaustive()
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(net: &Mocknet, seed: u8) -> PeerNet {
        let id = Keypair::from_seed(&[seed; 32]).peer_id();
        net.add_peer(id, vec![format!("/ip4/10.0.0.{seed}/tcp/4001")]).unwrap()
    }

    #[tokio::test]
    async fn duplicate_identity_is_rejected() {
        let net = Mocknet::new();
        let a = peer(&net, 1);
        let err = net.add_peer(a.id(), Vec::new()).unwrap_err();
        assert_eq!(err, NetError::DuplicateIdentity(a.id()));
    }

    #[tokio::test]
    async fn parallel_links_and_self_loops_are_distinct() {
        let net = Mocknet::new();
        let a = peer(&net, 1);
        let b = peer(&net, 2);

        let l1 = net.link_peers(&a.id(), &b.id()).unwrap();
        let l2 = net.link_peers(&b.id(), &a.id()).unwrap();
        let self_loop = net.link_peers(&a.id(), &a.id()).unwrap();

        assert_ne!(l1.id(), l2.id());
        assert_eq!(net.links_between_peers(&a.id(), &b.id()).len(), 2);
        assert_eq!(net.links_between_peers(&a.id(), &a.id()).len(), 1);
        assert!(self_loop.connects(&a.id(), &a.id()));
        assert_eq!(net.links().len(), 3);
    }

    #[tokio::test]
    async fn link_all_covers_every_pair_once() {
        let net = Mocknet::new();
        for seed in 1..=4 {
            peer(&net, seed);
        }
        net.link_all().unwrap();
        // 4 self-loops plus 6 distinct pairs.
        assert_eq!(net.links().len(), 10);
    }

    #[tokio::test]
    async fn dial_without_link_fails_immediately() {
        let net = Mocknet::new();
        let a = peer(&net, 1);
        let b = peer(&net, 2);
        let err = a.connect(&b.id()).unwrap_err();
        assert_eq!(err, NetError::NoRouteToPeer { from: a.id(), to: b.id() });
    }

    #[tokio::test]
    async fn existing_connection_is_reused_across_links() {
        let net = Mocknet::new();
        let a = peer(&net, 1);
        let b = peer(&net, 2);
        net.link_peers(&a.id(), &b.id()).unwrap();
        net.link_peers(&a.id(), &b.id()).unwrap();

        let first = a.connect(&b.id()).unwrap();
        let second = a.connect(&b.id()).unwrap();
        assert_eq!(first.id(), second.id());
        // The listener reuses the dialer's connection too.
        let back = b.connect(&a.id()).unwrap();
        assert_eq!(back.remote_peer(), a.id());
        assert_eq!(b.conns().len(), 1);
    }

    #[tokio::test]
    async fn connectedness_follows_close() {
        let net = Mocknet::new();
        let a = peer(&net, 1);
        let b = peer(&net, 2);
        net.link_peers(&a.id(), &b.id()).unwrap();

        let conn = net.connect_peers(&a.id(), &b.id()).unwrap();
        assert_eq!(a.connectedness(&b.id()), Connectedness::Connected);
        assert_eq!(b.connectedness(&a.id()), Connectedness::Connected);

        conn.close();
        assert_eq!(a.connectedness(&b.id()), Connectedness::NotConnected);
        assert_eq!(b.connectedness(&a.id()), Connectedness::NotConnected);
        assert!(a.conns().is_empty());
    }

    #[tokio::test]
    async fn listen_addr_changes_are_observed() {
        let net = Mocknet::new();
        let a = peer(&net, 1);
        let mut events = a.notify();

        a.add_listen_addr("/ip4/10.0.0.9/tcp/9");
        assert!(a.remove_listen_addr("/ip4/10.0.0.9/tcp/9"));
        assert!(!a.remove_listen_addr("/ip4/10.0.0.9/tcp/9"));

        assert_eq!(events.next().await, Some(NetEvent::ListenAddrAdded("/ip4/10.0.0.9/tcp/9".into())));
        assert_eq!(events.next().await, Some(NetEvent::ListenAddrRemoved("/ip4/10.0.0.9/tcp/9".into())));
        assert!(events.try_next().is_none());
    }

    #[tokio::test]
    async fn stop_notify_removes_observer() {
        let net = Mocknet::new();
        let a = peer(&net, 1);
        let events = a.notify();
        assert!(a.stop_notify(events.id()));
        assert!(!a.stop_notify(events.id()));
    }
}

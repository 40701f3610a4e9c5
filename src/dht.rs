//! # Kademlia DHT
//!
//! Peer routing, a validated value store and provider records on top of
//! any [`DhtRpc`] transport.
//!
//! ## Actor Architecture
//!
//! - [`DhtNode`]: public handle, cheap to clone
//! - `DhtNodeActor`: owns the routing table, the value store and the
//!   provider store and applies commands one at a time
//!
//! Lookups run on the caller's task (see [`crate::query`]); they talk to the
//! actor only to read seeds and to record responders. Liveness probes for
//! full buckets run on spawned tasks and report back through the command
//! channel, so the actor never waits on the network.
//!
//! ## Records
//!
//! Values are validated with the node's [`Validator`] before they are stored
//! or returned. When a store already holds a different value under a key,
//! the selector picks between `[incoming, existing]` and the incoming value
//! is only kept when it wins.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;
use tracing::{debug, info, trace};

use crate::config::{BootstrapConfig, DhtConfig};
use crate::context::OpContext;
use crate::error::{DhtError, DhtResult, RecordError};
use crate::identity::{record_key, Key, PeerId, PeerInfo};
use crate::messages::{Record, MAX_VALUE_SIZE};
use crate::protocols::DhtRpc;
use crate::query::{Query, QueryOutcome, QueryState};
use crate::record::{ValueRecord, Validator};
use crate::providers::ProviderStore;
use crate::routing::{random_key_for_bucket, PendingBucketUpdate, RoutingTable, UpdateOutcome};

/// Capacity of the actor's command queue.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// The peer behind an inbound request.
#[derive(Clone, Debug)]
pub struct RequestSender {
    pub info: PeerInfo,
    /// False for client-mode peers; they are never added to the routing table.
    pub serving: bool,
}

impl RequestSender {
    pub fn server(info: PeerInfo) -> Self {
        Self { info, serving: true }
    }
}

pub struct DhtNode<N: DhtRpc> {
    cmd_tx: mpsc::Sender<Command>,
    local: PeerInfo,
    network: Arc<N>,
    config: Arc<DhtConfig>,
    validator: Arc<dyn Validator>,
}

impl<N: DhtRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            local: self.local.clone(),
            network: self.network.clone(),
            config: self.config.clone(),
            validator: self.validator.clone(),
        }
    }
}

struct DhtNodeActor<N: DhtRpc> {
    routing: RoutingTable,
    values: LruCache<String, ValueRecord>,
    providers: ProviderStore,
    validator: Arc<dyn Validator>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    local: PeerId,
    k: usize,
    rpc_timeout: Duration,
}

enum Command {
    // State updates
    ObservePeer(PeerInfo),
    RemovePeer(PeerId, oneshot::Sender<bool>),
    ApplyProbeResult(PendingBucketUpdate, bool),
    PutLocalRecord(ValueRecord, oneshot::Sender<DhtResult<()>>),
    AddLocalProvider(Key, PeerInfo),

    // Queries
    NearestPeers(Key, usize, oneshot::Sender<Vec<PeerInfo>>),
    FindLocal(PeerId, oneshot::Sender<Option<PeerInfo>>),
    RoutingPeers(oneshot::Sender<Vec<PeerId>>),
    GetLocalRecord(String, oneshot::Sender<Option<ValueRecord>>),
    GetLocalProviders(Key, oneshot::Sender<Vec<PeerInfo>>),

    // RPC handlers
    HandlePing(RequestSender),
    HandleFindNode(RequestSender, Key, oneshot::Sender<Vec<PeerInfo>>),
    HandleGetValue(RequestSender, String, oneshot::Sender<(Option<Record>, Vec<PeerInfo>)>),
    HandlePutValue(RequestSender, Record, oneshot::Sender<DhtResult<()>>),
    HandleAddProvider(RequestSender, Key, PeerInfo),
    HandleGetProviders(RequestSender, Key, oneshot::Sender<(Vec<PeerInfo>, Vec<PeerInfo>)>),

    // Maintenance
    GetStaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),

    Quit,
}

/// Records gathered by a value lookup.
struct CollectedValues {
    records: Vec<ValueRecord>,
    responders: HashMap<PeerId, PeerInfo>,
    state: Option<QueryState>,
}

impl CollectedValues {
    /// Error for a lookup that produced no usable record.
    fn empty_error(&self) -> DhtError {
        match self.state {
            Some(QueryState::TimedOut) => DhtError::TimedOut,
            Some(QueryState::Cancelled) => DhtError::Cancelled,
            _ => DhtError::NotFound,
        }
    }
}

impl<N: DhtRpc> DhtNode<N> {
    pub fn new(local: PeerInfo, network: N, config: DhtConfig, validator: impl Validator + 'static) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let network = Arc::new(network);
        let validator: Arc<dyn Validator> = Arc::new(validator);
        let record_capacity = NonZeroUsize::new(config.record_capacity).unwrap_or(NonZeroUsize::MIN);

        let actor = DhtNodeActor {
            routing: RoutingTable::new(local.id, config.k),
            values: LruCache::new(record_capacity),
            providers: ProviderStore::new(config.provider_capacity, config.provider_ttl),
            validator: validator.clone(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            network: network.clone(),
            local: local.id,
            k: config.k,
            rpc_timeout: config.rpc_timeout,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            local,
            network,
            config: Arc::new(config),
            validator,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local.id
    }

    pub fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn validator(&self) -> &dyn Validator {
        self.validator.as_ref()
    }

    async fn send(&self, cmd: Command) -> DhtResult<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| DhtError::Shutdown)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> DhtResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| DhtError::Shutdown)
    }

    // ------------------------------------------------------------------
    // Routing table access
    // ------------------------------------------------------------------

    /// Insert or refresh a peer known to serve the DHT.
    pub async fn observe_peer(&self, peer: PeerInfo) -> DhtResult<()> {
        self.send(Command::ObservePeer(peer)).await
    }

    pub async fn remove_peer(&self, id: &PeerId) -> DhtResult<bool> {
        self.request(|tx| Command::RemovePeer(*id, tx)).await
    }

    pub async fn nearest_peers(&self, target: Key, count: usize) -> DhtResult<Vec<PeerInfo>> {
        self.request(|tx| Command::NearestPeers(target, count, tx)).await
    }

    pub async fn routing_table_peers(&self) -> DhtResult<Vec<PeerId>> {
        self.request(Command::RoutingPeers).await
    }

    pub async fn routing_table_size(&self) -> DhtResult<usize> {
        Ok(self.routing_table_peers().await?.len())
    }

    pub async fn routing_table_contains(&self, id: &PeerId) -> DhtResult<bool> {
        Ok(self.find_local(id).await?.is_some())
    }

    async fn find_local(&self, id: &PeerId) -> DhtResult<Option<PeerInfo>> {
        self.request(|tx| Command::FindLocal(*id, tx)).await
    }

    // ------------------------------------------------------------------
    // Inbound RPC handlers
    // ------------------------------------------------------------------

    pub async fn handle_ping(&self, from: RequestSender) -> DhtResult<()> {
        self.send(Command::HandlePing(from)).await
    }

    pub async fn handle_find_node(&self, from: RequestSender, target: Key) -> DhtResult<Vec<PeerInfo>> {
        self.request(|tx| Command::HandleFindNode(from, target, tx)).await
    }

    pub async fn handle_get_value(
        &self,
        from: RequestSender,
        key: String,
    ) -> DhtResult<(Option<Record>, Vec<PeerInfo>)> {
        self.request(|tx| Command::HandleGetValue(from, key, tx)).await
    }

    pub async fn handle_put_value(&self, from: RequestSender, record: Record) -> DhtResult<()> {
        self.request(|tx| Command::HandlePutValue(from, record, tx)).await?
    }

    pub async fn handle_add_provider(&self, from: RequestSender, key: Key, provider: PeerInfo) -> DhtResult<()> {
        self.send(Command::HandleAddProvider(from, key, provider)).await
    }

    pub async fn handle_get_providers(
        &self,
        from: RequestSender,
        key: Key,
    ) -> DhtResult<(Vec<PeerInfo>, Vec<PeerInfo>)> {
        self.request(|tx| Command::HandleGetProviders(from, key, tx)).await
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Run an iterative lookup toward `target`, seeded from the routing
    /// table. Every peer that answers is recorded in the routing table.
    async fn lookup<T, F, Fut, C>(
        &self,
        ctx: &OpContext,
        target: Key,
        mut request: F,
        on_response: C,
    ) -> DhtResult<QueryOutcome>
    where
        T: Send + 'static,
        F: FnMut(PeerInfo) -> Fut,
        Fut: Future<Output = anyhow::Result<(T, Vec<PeerInfo>)>> + Send + 'static,
        C: FnMut(&PeerInfo, T) -> ControlFlow<()>,
    {
        let alpha = self.config.alpha.max(1);
        let seeds = self.nearest_peers(target, alpha).await?;
        let mut query = Query::new(self.local.id, target, self.config.k, alpha, self.config.rpc_timeout);
        query.seed(seeds);

        let cmd_tx = self.cmd_tx.clone();
        let observed = move |peer: PeerInfo| {
            let fut = request(peer.clone());
            let cmd_tx = cmd_tx.clone();
            async move {
                let result = fut.await;
                if result.is_ok() {
                    let _ = cmd_tx.send(Command::ObservePeer(peer)).await;
                }
                result
            }
        };
        query.run(ctx, observed, on_response).await
    }

    fn find_node_request(&self, target: Key) -> impl FnMut(PeerInfo) -> FindNodeFuture + Send + 'static {
        let network = self.network.clone();
        move |peer: PeerInfo| -> FindNodeFuture {
            let network = network.clone();
            Box::pin(async move {
                let nodes = network.find_node(&peer, target).await?;
                Ok((nodes.clone(), nodes))
            })
        }
    }

    /// The `k` closest peers to `key` that answered a converged lookup.
    pub async fn get_closest_peers(&self, ctx: &OpContext, key: Key) -> DhtResult<Vec<PeerInfo>> {
        let outcome = self
            .lookup(ctx, key, self.find_node_request(key), |_: &PeerInfo, _: Vec<PeerInfo>| {
                ControlFlow::Continue(())
            })
            .await?
            .converged()?;
        Ok(outcome.closest)
    }

    /// Locate `id`, using the routing table before asking the network.
    pub async fn find_peer(&self, ctx: &OpContext, id: PeerId) -> DhtResult<PeerInfo> {
        if id == self.local.id {
            return Ok(self.local.clone());
        }
        if let Some(info) = self.find_local(&id).await? {
            return Ok(info);
        }

        let mut found = None;
        let outcome = self
            .lookup(ctx, id.key(), self.find_node_request(id.key()), |peer: &PeerInfo, nodes: Vec<PeerInfo>| {
                if peer.id == id {
                    found = Some(peer.clone());
                } else if let Some(info) = nodes.into_iter().find(|p| p.id == id) {
                    found = Some(info);
                }
                if found.is_some() {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await?;

        match found {
            Some(info) => Ok(info),
            None => outcome.converged().and(Err(DhtError::NotFound)),
        }
    }

    /// Peers whose routing tables hold `id`, reported as the lookup toward
    /// `id` discovers them. The channel closes when the lookup ends.
    pub fn find_peers_connected_to_peer(&self, ctx: &OpContext, id: PeerId) -> mpsc::UnboundedReceiver<PeerInfo> {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = self.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = node
                .lookup(&ctx, id.key(), node.find_node_request(id.key()), |peer: &PeerInfo, nodes: Vec<PeerInfo>| {
                    if nodes.iter().any(|p| p.id == id) && tx.send(peer.clone()).is_err() {
                        return ControlFlow::Break(());
                    }
                    ControlFlow::Continue(())
                })
                .await;
            if let Err(e) = result {
                debug!(peer = %id.short(), error = %e, "connected-peer search failed");
            }
        });
        rx
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    async fn get_local_record(&self, key: &str) -> DhtResult<Option<ValueRecord>> {
        self.request(|tx| Command::GetLocalRecord(key.to_string(), tx)).await
    }

    /// Gather valid records for `key`: the local one first, then those of
    /// lookup responders. `stop` sees the records after each addition.
    async fn collect_values<S>(&self, ctx: &OpContext, key: &str, mut stop: S) -> DhtResult<CollectedValues>
    where
        S: FnMut(&[ValueRecord]) -> bool + Send,
    {
        let mut records = Vec::new();
        if let Some(mut local) = self.get_local_record(key).await? {
            local.received_from = self.local.id;
            match self.validator.validate(key, &local.value) {
                Ok(()) => records.push(local),
                Err(e) => debug!(key = %key, error = %e, "ignoring invalid local record"),
            }
        }
        if stop(&records) {
            return Ok(CollectedValues {
                records,
                responders: HashMap::new(),
                state: None,
            });
        }

        let network = self.network.clone();
        let owned_key = key.to_string();
        let request = move |peer: PeerInfo| {
            let network = network.clone();
            let key = owned_key.clone();
            async move {
                let (record, closer) = network.get_value(&peer, &key).await?;
                Ok((record, closer))
            }
        };
        let validator = self.validator.clone();
        let result = self
            .lookup(ctx, record_key(key), request, |peer: &PeerInfo, record: Option<Record>| {
                let Some(record) = record else {
                    return ControlFlow::Continue(());
                };
                if let Err(e) = validator.validate(key, &record.value) {
                    debug!(peer = %peer.id.short(), key = %key, error = %e, "discarding invalid record");
                    return ControlFlow::Continue(());
                }
                records.push(ValueRecord::new(record.key, record.value, peer.id));
                if stop(&records) {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await;

        match result {
            Ok(outcome) => Ok(CollectedValues {
                records,
                responders: outcome.responded.into_iter().map(|p| (p.id, p)).collect(),
                state: Some(outcome.state),
            }),
            Err(DhtError::LookupFailure) if !records.is_empty() => Ok(CollectedValues {
                records,
                responders: HashMap::new(),
                state: None,
            }),
            Err(e) => Err(e),
        }
    }

    /// Pick the best collected record and push it to peers that returned an
    /// outdated one.
    fn settle_values(&self, key: &str, collected: &CollectedValues) -> Option<ValueRecord> {
        let best = best_record(self.validator.as_ref(), key, &collected.records)?;
        let best = collected.records[best].clone();

        for record in &collected.records {
            if record.value == best.value {
                continue;
            }
            if record.received_from == self.local.id {
                let node = self.clone();
                let update = ValueRecord::new(best.key.clone(), best.value.clone(), best.received_from);
                tokio::spawn(async move {
                    if let Ok(Err(e)) = node.request(|tx| Command::PutLocalRecord(update, tx)).await {
                        debug!(error = %e, "failed to replace outdated local record");
                    }
                });
                continue;
            }
            let Some(peer) = collected.responders.get(&record.received_from).cloned() else {
                continue;
            };
            let network = self.network.clone();
            let rpc_timeout = self.config.rpc_timeout;
            let fixed = Record::new(best.key.clone(), best.value.clone());
            tokio::spawn(async move {
                match tokio::time::timeout(rpc_timeout, network.put_value(&peer, fixed)).await {
                    Ok(Ok(())) => trace!(peer = %peer.id.short(), "corrected outdated record"),
                    Ok(Err(e)) => debug!(peer = %peer.id.short(), error = %e, "record correction failed"),
                    Err(_) => debug!(peer = %peer.id.short(), "record correction timed out"),
                }
            });
        }
        Some(best)
    }

    /// Resolve `key` with the configured quorum.
    pub async fn get_value(&self, ctx: &OpContext, key: &str) -> DhtResult<Vec<u8>> {
        self.get_value_with_quorum(ctx, key, self.config.quorum).await
    }

    /// Resolve `key`, returning once `quorum` records agree with the best
    /// one. A quorum of zero returns the first valid value and leaves the
    /// lookup running in the background.
    pub async fn get_value_with_quorum(&self, ctx: &OpContext, key: &str, quorum: usize) -> DhtResult<Vec<u8>> {
        if quorum == 0 {
            let mut values = self.search_value(ctx, key);
            let first = values.recv().await.ok_or(DhtError::NotFound)?;
            tokio::spawn(async move { while values.recv().await.is_some() {} });
            return Ok(first);
        }

        let validator = self.validator.clone();
        let collected = self
            .collect_values(ctx, key, |records| {
                let Some(best) = best_record(validator.as_ref(), key, records) else {
                    return false;
                };
                records.iter().filter(|r| r.value == records[best].value).count() >= quorum
            })
            .await?;

        match self.settle_values(key, &collected) {
            Some(best) => Ok(best.value),
            None => Err(collected.empty_error()),
        }
    }

    /// Up to `count` valid records for `key`, local record first.
    pub async fn get_values(&self, ctx: &OpContext, key: &str, count: usize) -> DhtResult<Vec<ValueRecord>> {
        let mut collected = self.collect_values(ctx, key, |records| records.len() >= count).await?;
        if collected.records.is_empty() {
            return Err(collected.empty_error());
        }
        collected.records.truncate(count);
        Ok(collected.records)
    }

    /// Values for `key` in the order they are found, each strictly better
    /// than the last. The channel closes when the lookup ends.
    pub fn search_value(&self, ctx: &OpContext, key: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = self.clone();
        let ctx = ctx.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let validator = node.validator.clone();
            let mut best: Option<Vec<u8>> = None;
            let result = node
                .collect_values(&ctx, &key, |records| {
                    let Some(latest) = records.last() else {
                        return tx.is_closed();
                    };
                    let improves = match &best {
                        None => true,
                        Some(current) if *current == latest.value => false,
                        Some(current) => {
                            let candidates = [current.as_slice(), latest.value.as_slice()];
                            matches!(validator.select(&key, &candidates), Ok(1))
                        }
                    };
                    if improves {
                        best = Some(latest.value.clone());
                        if tx.send(latest.value.clone()).is_err() {
                            return true;
                        }
                    }
                    false
                })
                .await;
            match result {
                Ok(collected) => {
                    node.settle_values(&key, &collected);
                }
                Err(e) => debug!(key = %key, error = %e, "value search failed"),
            }
        });
        rx
    }

    /// Store `value` under `key` locally and on the `k` closest peers.
    pub async fn put_value(&self, ctx: &OpContext, key: &str, value: Vec<u8>) -> DhtResult<()> {
        let local = ValueRecord::new(key, value.clone(), self.local.id);
        self.request(|tx| Command::PutLocalRecord(local, tx)).await??;

        let peers = self.get_closest_peers(ctx, record_key(key)).await?;
        let record = Record::new(key, value);
        let acks = self
            .fan_out(peers, "PUT_VALUE", move |network, peer| {
                let record = record.clone();
                async move { network.put_value(&peer, record).await }
            })
            .await;

        debug!(key = %key, acks, "value stored");
        if acks == 0 {
            return Err(DhtError::NoPeersReached);
        }
        Ok(())
    }

    /// Send one request to each peer concurrently and count the successes.
    async fn fan_out<F, Fut>(&self, peers: Vec<PeerInfo>, kind: &'static str, mut send: F) -> usize
    where
        F: FnMut(Arc<N>, PeerInfo) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut join_set = JoinSet::new();
        for peer in peers {
            let fut = send(self.network.clone(), peer.clone());
            let rpc_timeout = self.config.rpc_timeout;
            join_set.spawn(async move {
                let result = match tokio::time::timeout(rpc_timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("request timed out")),
                };
                (peer, result)
            });
        }

        let mut acks = 0;
        while let Some(joined) = join_set.join_next().await {
            let Ok((peer, result)) = joined else { continue };
            match result {
                Ok(()) => acks += 1,
                Err(e) => debug!(peer = %peer.id.short(), request = kind, error = %e, "request failed"),
            }
        }
        acks
    }

    // ------------------------------------------------------------------
    // Providers
    // ------------------------------------------------------------------

    /// Announce this node as a provider of `key`. Without `broadcast` the
    /// record is only kept locally.
    pub async fn provide(&self, ctx: &OpContext, key: Key, broadcast: bool) -> DhtResult<()> {
        self.send(Command::AddLocalProvider(key, self.local.clone())).await?;
        if !broadcast {
            return Ok(());
        }

        let peers = self.get_closest_peers(ctx, key).await?;
        let local = self.local.clone();
        let acks = self
            .fan_out(peers, "ADD_PROVIDER", move |network, peer| {
                let local = local.clone();
                async move { network.add_provider(&peer, key, local).await }
            })
            .await;

        debug!(key = %hex::encode(&key[..8]), acks, "provider record announced");
        if acks == 0 {
            return Err(DhtError::NoPeersReached);
        }
        Ok(())
    }

    pub async fn get_local_providers(&self, key: Key) -> DhtResult<Vec<PeerInfo>> {
        self.request(|tx| Command::GetLocalProviders(key, tx)).await
    }

    /// Providers of `key`, local ones first, without duplicates. At most
    /// `count` are reported; zero means no limit.
    pub fn find_providers_async(&self, ctx: &OpContext, key: Key, count: usize) -> mpsc::UnboundedReceiver<PeerInfo> {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = self.clone();
        let ctx = ctx.clone();
        let limit = if count == 0 { usize::MAX } else { count };
        tokio::spawn(async move {
            let mut seen = HashSet::new();
            let mut emit = |provider: PeerInfo| -> ControlFlow<()> {
                if seen.len() >= limit {
                    return ControlFlow::Break(());
                }
                if seen.insert(provider.id) && tx.send(provider).is_err() {
                    return ControlFlow::Break(());
                }
                if seen.len() >= limit {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            };

            match node.get_local_providers(key).await {
                Ok(local) => {
                    for provider in local {
                        if emit(provider).is_break() {
                            return;
                        }
                    }
                }
                Err(_) => return,
            }

            let network = node.network.clone();
            let request = move |peer: PeerInfo| {
                let network = network.clone();
                async move { network.get_providers(&peer, key).await }
            };
            let result = node
                .lookup(&ctx, key, request, |_: &PeerInfo, providers: Vec<PeerInfo>| {
                    for provider in providers {
                        if emit(provider).is_break() {
                            return ControlFlow::Break(());
                        }
                    }
                    ControlFlow::Continue(())
                })
                .await;
            if let Err(e) = result {
                debug!(key = %hex::encode(&key[..8]), error = %e, "provider search failed");
            }
        });
        rx
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// One self lookup plus `config.queries - 1` lookups of random keys,
    /// each bounded by `config.timeout`. Fails only when every lookup fails.
    pub async fn bootstrap(&self, ctx: &OpContext, config: &BootstrapConfig) -> DhtResult<()> {
        let queries = config.queries.max(1);
        let mut last_error = None;
        let mut succeeded = 0;

        for i in 0..queries {
            let target = if i == 0 {
                self.local.id.key()
            } else {
                PeerId::random().key()
            };
            let lookup_ctx = ctx.timeout(config.timeout);
            match self.get_closest_peers(&lookup_ctx, target).await {
                Ok(found) => {
                    succeeded += 1;
                    trace!(target = %hex::encode(&target[..8]), found = found.len(), "bootstrap lookup done");
                }
                Err(e @ DhtError::Cancelled) => return Err(e),
                Err(e) => {
                    debug!(target = %hex::encode(&target[..8]), error = %e, "bootstrap lookup failed");
                    last_error = Some(e);
                }
            }
        }

        let size = self.routing_table_size().await?;
        info!(peer = %self.local.id.short(), queries, succeeded, routing_table = size, "bootstrap round finished");
        match last_error {
            Some(e) if succeeded == 0 => Err(e),
            _ => Ok(()),
        }
    }

    /// Periodically run lookups for buckets that saw no activity within
    /// `bucket_refresh_interval`. Stops when the node shuts down.
    pub fn spawn_periodic_bucket_refresh(&self) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let period = node.config.bucket_refresh_interval;
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;

                let Ok(stale_buckets) = node.request(|tx| Command::GetStaleBuckets(period, tx)).await else {
                    break;
                };
                if stale_buckets.is_empty() {
                    continue;
                }
                debug!(count = stale_buckets.len(), "refreshing stale routing buckets");

                for bucket in stale_buckets {
                    let target = random_key_for_bucket(&node.local.id, bucket);
                    let ctx = OpContext::with_timeout(node.config.rpc_timeout * 4);
                    if let Err(e) = node.get_closest_peers(&ctx, target).await {
                        debug!(bucket, error = %e, "bucket refresh lookup failed");
                    }
                    if node.send(Command::MarkBucketRefreshed(bucket)).await.is_err() {
                        return;
                    }
                }
            }
        })
    }

    /// Stop the actor. Pending and later calls fail with `Shutdown`.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

type FindNodeFuture =
    std::pin::Pin<Box<dyn Future<Output = anyhow::Result<(Vec<PeerInfo>, Vec<PeerInfo>)>> + Send>>;

/// Index of the record the validator prefers, if any.
fn best_record(validator: &dyn Validator, key: &str, records: &[ValueRecord]) -> Option<usize> {
    if records.is_empty() {
        return None;
    }
    let values: Vec<&[u8]> = records.iter().map(|r| r.value.as_slice()).collect();
    match validator.select(key, &values) {
        Ok(index) if index < values.len() => Some(index),
        Ok(_) => None,
        Err(e) => {
            debug!(key = %key, error = %e, "selector rejected all records");
            None
        }
    }
}

impl<N: DhtRpc> DhtNodeActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::ObservePeer(peer) => {
                    self.observe(peer);
                }
                Command::RemovePeer(id, reply) => {
                    let removed = self.routing.remove(&id);
                    if removed {
                        debug!(peer = %id.short(), "peer removed from routing table");
                    }
                    let _ = reply.send(removed);
                }
                Command::ApplyProbeResult(pending, alive) => {
                    self.apply_probe_result(pending, alive);
                }
                Command::PutLocalRecord(record, reply) => {
                    let result = self.store_record(record);
                    let _ = reply.send(result);
                }
                Command::AddLocalProvider(key, provider) => {
                    self.providers.add_provider(key, provider);
                }
                Command::NearestPeers(target, count, reply) => {
                    let _ = reply.send(self.routing.nearest_peers(&target, count));
                }
                Command::FindLocal(id, reply) => {
                    let _ = reply.send(self.routing.get(&id).map(|entry| entry.peer.clone()));
                }
                Command::RoutingPeers(reply) => {
                    let _ = reply.send(self.routing.peers());
                }
                Command::GetLocalRecord(key, reply) => {
                    let _ = reply.send(self.values.get(&key).cloned());
                }
                Command::GetLocalProviders(key, reply) => {
                    let providers = self.providers.get_providers(&key).iter().map(|r| r.info()).collect();
                    let _ = reply.send(providers);
                }
                Command::HandlePing(from) => {
                    self.observe_sender(&from);
                }
                Command::HandleFindNode(from, target, reply) => {
                    self.observe_sender(&from);
                    let _ = reply.send(self.closest_for(&target, &from.info.id));
                }
                Command::HandleGetValue(from, key, reply) => {
                    self.observe_sender(&from);
                    let record = self
                        .values
                        .get(&key)
                        .map(|stored| Record::new(stored.key.clone(), stored.value.clone()));
                    let closer = self.closest_for(&record_key(&key), &from.info.id);
                    let _ = reply.send((record, closer));
                }
                Command::HandlePutValue(from, record, reply) => {
                    self.observe_sender(&from);
                    let result = self.store_record(ValueRecord::new(record.key, record.value, from.info.id));
                    if let Err(e) = &result {
                        debug!(peer = %from.info.id.short(), error = %e, "rejected PUT_VALUE");
                    }
                    let _ = reply.send(result);
                }
                Command::HandleAddProvider(from, key, mut provider) => {
                    self.observe_sender(&from);
                    if provider.addrs.is_empty() {
                        provider.addrs = from.info.addrs.clone();
                    }
                    self.providers.add_provider(key, provider);
                }
                Command::HandleGetProviders(from, key, reply) => {
                    self.observe_sender(&from);
                    let providers = self.providers.get_providers(&key).iter().map(|r| r.info()).collect();
                    let closer = self.closest_for(&key, &from.info.id);
                    let _ = reply.send((providers, closer));
                }
                Command::GetStaleBuckets(threshold, reply) => {
                    let _ = reply.send(self.routing.stale_buckets(threshold));
                }
                Command::MarkBucketRefreshed(bucket) => {
                    self.routing.mark_bucket_refreshed(bucket);
                }
                Command::Quit => {
                    break;
                }
            }
        }
        trace!(peer = %self.local.short(), "dht actor stopped");
    }

    fn observe_sender(&mut self, from: &RequestSender) {
        if from.serving {
            self.observe(from.info.clone());
        }
    }

    fn observe(&mut self, peer: PeerInfo) {
        let id = peer.id;
        match self.routing.update(peer) {
            UpdateOutcome::Inserted => {
                debug!(peer = %id.short(), size = self.routing.size(), "peer added to routing table");
            }
            UpdateOutcome::Refreshed | UpdateOutcome::Ignored => {}
            UpdateOutcome::Pending(pending) => {
                trace!(
                    peer = %id.short(),
                    oldest = %pending.oldest.id.short(),
                    bucket = pending.bucket,
                    "bucket full, probing oldest entry"
                );
                let network = self.network.clone();
                let tx = self.cmd_tx.clone();
                let rpc_timeout = self.rpc_timeout;
                tokio::spawn(async move {
                    let alive = matches!(
                        tokio::time::timeout(rpc_timeout, network.ping(&pending.oldest)).await,
                        Ok(Ok(()))
                    );
                    let _ = tx.send(Command::ApplyProbeResult(pending, alive)).await;
                });
            }
        }
    }

    fn apply_probe_result(&mut self, pending: PendingBucketUpdate, alive: bool) {
        let oldest = pending.oldest.id;
        let candidate = pending.candidate.id;
        match self.routing.apply_probe_result(pending, alive) {
            Ok(()) => debug!(
                evicted = %oldest.short(),
                inserted = %candidate.short(),
                "evicted unresponsive peer"
            ),
            Err(e) => trace!(candidate = %candidate.short(), error = %e, "kept live incumbent"),
        }
    }

    fn closest_for(&self, target: &Key, requester: &PeerId) -> Vec<PeerInfo> {
        self.routing
            .nearest_peers(target, self.k + 1)
            .into_iter()
            .filter(|p| p.id != *requester)
            .take(self.k)
            .collect()
    }

    fn store_record(&mut self, record: ValueRecord) -> DhtResult<()> {
        if record.value.len() > MAX_VALUE_SIZE {
            return Err(RecordError::Invalid(format!(
                "value of {} bytes exceeds {MAX_VALUE_SIZE}",
                record.value.len()
            ))
            .into());
        }
        self.validator.validate(&record.key, &record.value)?;

        if let Some(existing) = self.values.peek(&record.key) {
            if existing.value != record.value {
                let candidates = [record.value.as_slice(), existing.value.as_slice()];
                if self.validator.select(&record.key, &candidates)? != 0 {
                    return Err(DhtError::StaleRecord);
                }
            }
        }

        trace!(key = %record.key, from = %record.received_from.short(), "record stored");
        self.values.put(record.key.clone(), record);
        Ok(())
    }
}

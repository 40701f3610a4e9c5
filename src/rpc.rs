//! # RPC Layer
//!
//! Request/response exchange for the DHT over simulated streams.
//!
//! - [`MockRpc`]: client side, implements [`DhtRpc`] for a [`PeerNet`]
//! - [`serve`]: installs a stream handler answering requests with a [`DhtNode`]
//! - [`reject_inbound`]: stream handler for client-mode peers
//!
//! Each exchange uses a fresh stream: the requester writes one frame and
//! half-closes, the responder writes one frame and closes. A frame is a
//! 4-byte big-endian length followed by the bincode body. Connections are
//! reused by the network, so only the first exchange with a peer dials.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, trace, warn};

use crate::dht::{DhtNode, RequestSender};
use crate::error::NetError;
use crate::identity::{Key, PeerInfo};
use crate::messages::{
    self, DhtRequest, DhtResponse, Record, RequestFrame, MAX_FRAME_SIZE, MAX_PEERS_PER_RESPONSE,
    MAX_VALUE_SIZE,
};
use crate::mocknet::PeerNet;
use crate::protocols::DhtRpc;
use crate::stream::Stream;

/// Time a server waits for a complete request frame.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a server spends producing a response.
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

async fn write_frame(stream: &Stream, body: &[u8]) -> Result<(), NetError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    stream.write_all(&frame).await
}

async fn read_frame(stream: &Stream) -> Result<Vec<u8>, NetError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        warn!(
            peer = %stream.remote_peer().short(),
            size = len,
            max = MAX_FRAME_SIZE,
            "peer sent oversized frame"
        );
        return Err(NetError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// [`DhtRpc`] over the virtual network.
#[derive(Clone, Debug)]
pub struct MockRpc {
    host: PeerNet,
    protocol: Arc<str>,
    timeout: Duration,
    serving: bool,
}

impl MockRpc {
    pub fn new(host: PeerNet, protocol: &str, timeout: Duration) -> Self {
        Self {
            host,
            protocol: Arc::from(protocol),
            timeout,
            serving: true,
        }
    }

    /// Mark outgoing requests as coming from a peer that does not answer
    /// DHT requests.
    pub fn client_mode(mut self, client: bool) -> Self {
        self.serving = !client;
        self
    }

    pub fn host(&self) -> &PeerNet {
        &self.host
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn rpc(&self, to: &PeerInfo, request: DhtRequest) -> Result<DhtResponse> {
        let kind = request.kind();
        let response = tokio::time::timeout(self.timeout, self.rpc_inner(to, request))
            .await
            .with_context(|| format!("{kind} to {} timed out", to.id.short()))??;
        match response {
            DhtResponse::Error { message } => anyhow::bail!("{kind} rejected by {}: {message}", to.id.short()),
            other => Ok(other),
        }
    }

    async fn rpc_inner(&self, to: &PeerInfo, request: DhtRequest) -> Result<DhtResponse> {
        let stream = self
            .host
            .new_stream(&to.id)
            .with_context(|| format!("failed to open stream to {}", to.id.short()))?;

        let frame = RequestFrame {
            protocol: self.protocol.to_string(),
            serving: self.serving,
            request,
        };
        let request_bytes = messages::serialize(&frame).context("failed to serialize request")?;
        write_frame(&stream, &request_bytes).await.context("failed to send request")?;
        stream.close().await.context("failed to finish request")?;

        let response_bytes = read_frame(&stream).await.context("failed to read response")?;
        let response: DhtResponse =
            messages::deserialize_bounded(&response_bytes).context("failed to deserialize response")?;
        Ok(response)
    }
}

fn truncate_peers(mut peers: Vec<PeerInfo>, from: &PeerInfo, what: &str) -> Vec<PeerInfo> {
    if peers.len() > MAX_PEERS_PER_RESPONSE {
        warn!(
            peer = %from.id.short(),
            received = peers.len(),
            max = MAX_PEERS_PER_RESPONSE,
            "truncating oversized {what} list"
        );
        peers.truncate(MAX_PEERS_PER_RESPONSE);
    }
    peers
}

#[async_trait]
impl DhtRpc for MockRpc {
    async fn ping(&self, to: &PeerInfo) -> Result<()> {
        match self.rpc(to, DhtRequest::Ping).await? {
            DhtResponse::Ack => Ok(()),
            other => anyhow::bail!("unexpected response to PING: {:?}", other),
        }
    }

    async fn find_node(&self, to: &PeerInfo, target: Key) -> Result<Vec<PeerInfo>> {
        match self.rpc(to, DhtRequest::FindNode { target }).await? {
            DhtResponse::Nodes(nodes) => Ok(truncate_peers(nodes, to, "FIND_NODE")),
            other => anyhow::bail!("unexpected response to FIND_NODE: {:?}", other),
        }
    }

    async fn get_value(&self, to: &PeerInfo, key: &str) -> Result<(Option<Record>, Vec<PeerInfo>)> {
        let request = DhtRequest::GetValue { key: key.to_string() };
        match self.rpc(to, request).await? {
            DhtResponse::Value { record, closer } => {
                if let Some(record) = &record {
                    if record.key != key {
                        anyhow::bail!("GET_VALUE response for wrong key {:?}", record.key);
                    }
                    if record.value.len() > MAX_VALUE_SIZE {
                        anyhow::bail!("GET_VALUE response value too large: {} bytes", record.value.len());
                    }
                }
                Ok((record, truncate_peers(closer, to, "GET_VALUE")))
            }
            other => anyhow::bail!("unexpected response to GET_VALUE: {:?}", other),
        }
    }

    async fn put_value(&self, to: &PeerInfo, record: Record) -> Result<()> {
        match self.rpc(to, DhtRequest::PutValue { record }).await? {
            DhtResponse::Ack => Ok(()),
            other => anyhow::bail!("unexpected response to PUT_VALUE: {:?}", other),
        }
    }

    async fn add_provider(&self, to: &PeerInfo, key: Key, provider: PeerInfo) -> Result<()> {
        match self.rpc(to, DhtRequest::AddProvider { key, provider }).await? {
            DhtResponse::Ack => Ok(()),
            other => anyhow::bail!("unexpected response to ADD_PROVIDER: {:?}", other),
        }
    }

    async fn get_providers(&self, to: &PeerInfo, key: Key) -> Result<(Vec<PeerInfo>, Vec<PeerInfo>)> {
        match self.rpc(to, DhtRequest::GetProviders { key }).await? {
            DhtResponse::Providers { providers, closer } => Ok((
                truncate_peers(providers, to, "provider"),
                truncate_peers(closer, to, "GET_PROVIDERS"),
            )),
            other => anyhow::bail!("unexpected response to GET_PROVIDERS: {:?}", other),
        }
    }
}

/// Answer inbound DHT streams on `host` with `node`.
///
/// The returned task runs until the handler is removed from `host`.
pub fn serve<N: DhtRpc>(host: &PeerNet, node: DhtNode<N>, protocol: &str) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Stream>();
    host.set_stream_handler(tx);
    let protocol: Arc<str> = Arc::from(protocol);
    tokio::spawn(async move {
        while let Some(stream) = rx.recv().await {
            let node = node.clone();
            let protocol = protocol.clone();
            tokio::spawn(async move {
                let peer = stream.remote_peer();
                if let Err(e) = handle_stream(&node, &protocol, &stream).await {
                    debug!(peer = %peer.short(), error = %e, "inbound request failed");
                    stream.reset();
                }
            });
        }
        trace!("stream handler removed, server stopped");
    })
}

/// Reset every inbound stream on `host`. Used by client-mode peers so that
/// requests to them fail immediately instead of timing out.
pub fn reject_inbound(host: &PeerNet) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Stream>();
    host.set_stream_handler(tx);
    tokio::spawn(async move {
        while let Some(stream) = rx.recv().await {
            trace!(peer = %stream.remote_peer().short(), "rejecting inbound stream in client mode");
            stream.reset();
        }
    })
}

async fn handle_stream<N: DhtRpc>(node: &DhtNode<N>, protocol: &str, stream: &Stream) -> Result<()> {
    let request_bytes = tokio::time::timeout(REQUEST_READ_TIMEOUT, read_frame(stream))
        .await
        .context("request read timed out")??;
    let frame: RequestFrame =
        messages::deserialize_bounded(&request_bytes).context("failed to deserialize request")?;

    if frame.protocol != protocol {
        warn!(
            peer = %stream.remote_peer().short(),
            expected = protocol,
            received = %frame.protocol,
            "protocol mismatch, resetting stream"
        );
        stream.reset();
        return Ok(());
    }

    let sender = RequestSender {
        info: PeerInfo::new(stream.remote_peer(), stream.conn().remote_addrs()),
        serving: frame.serving,
    };
    let kind = frame.request.kind();
    let response = match tokio::time::timeout(
        REQUEST_PROCESS_TIMEOUT,
        handle_dht_rpc(node, sender, frame.request),
    )
    .await
    {
        Ok(response) => response,
        Err(_) => {
            warn!(peer = %stream.remote_peer().short(), request = kind, "request processing timed out");
            DhtResponse::Error {
                message: "request processing timed out".into(),
            }
        }
    };

    let response_bytes = messages::serialize(&response).context("failed to serialize response")?;
    write_frame(stream, &response_bytes).await.context("failed to send response")?;
    stream.close().await.context("failed to finish response")?;
    Ok(())
}

async fn handle_dht_rpc<N: DhtRpc>(node: &DhtNode<N>, from: RequestSender, request: DhtRequest) -> DhtResponse {
    let peer = from.info.id;
    let result = match request {
        DhtRequest::Ping => {
            trace!(from = %peer.short(), "handling PING request");
            node.handle_ping(from).await.map(|_| DhtResponse::Ack)
        }
        DhtRequest::FindNode { target } => {
            trace!(from = %peer.short(), target = %hex::encode(&target[..8]), "handling FIND_NODE request");
            node.handle_find_node(from, target).await.map(|nodes| {
                debug!(from = %peer.short(), returned = nodes.len(), "FIND_NODE response");
                DhtResponse::Nodes(nodes)
            })
        }
        DhtRequest::GetValue { key } => {
            trace!(from = %peer.short(), key = %key, "handling GET_VALUE request");
            node.handle_get_value(from, key).await.map(|(record, closer)| {
                debug!(
                    from = %peer.short(),
                    found = record.is_some(),
                    closer_nodes = closer.len(),
                    "GET_VALUE response"
                );
                DhtResponse::Value { record, closer }
            })
        }
        DhtRequest::PutValue { record } => {
            debug!(
                from = %peer.short(),
                key = %record.key,
                value_len = record.value.len(),
                "handling PUT_VALUE request"
            );
            node.handle_put_value(from, record).await.map(|_| DhtResponse::Ack)
        }
        DhtRequest::AddProvider { key, provider } => {
            debug!(from = %peer.short(), key = %hex::encode(&key[..8]), "handling ADD_PROVIDER request");
            if provider.id != peer {
                warn!(
                    from = %peer.short(),
                    provider = %provider.id.short(),
                    "ADD_PROVIDER rejected: provider is not the sender"
                );
                return DhtResponse::Error {
                    message: "provider must be the sender".into(),
                };
            }
            node.handle_add_provider(from, key, provider).await.map(|_| DhtResponse::Ack)
        }
        DhtRequest::GetProviders { key } => {
            trace!(from = %peer.short(), key = %hex::encode(&key[..8]), "handling GET_PROVIDERS request");
            node.handle_get_providers(from, key).await.map(|(providers, closer)| {
                debug!(
                    from = %peer.short(),
                    providers = providers.len(),
                    closer_nodes = closer.len(),
                    "GET_PROVIDERS response"
                );
                DhtResponse::Providers { providers, closer }
            })
        }
    };
    result.unwrap_or_else(|e| DhtResponse::Error { message: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocknet::Mocknet;

    #[tokio::test]
    async fn frames_round_trip_over_a_stream() {
        let net = Mocknet::new();
        let (_, a) = net.gen_peer().unwrap();
        let (_, b) = net.gen_peer().unwrap();
        net.link_peers(&a.id(), &b.id()).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_stream_handler(tx);

        let outbound = a.new_stream(&b.id()).unwrap();
        write_frame(&outbound, b"hello frame").await.unwrap();
        outbound.close().await.unwrap();

        let inbound = rx.recv().await.unwrap();
        assert_eq!(read_frame(&inbound).await.unwrap(), b"hello frame");
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_refused() {
        let net = Mocknet::new();
        let (_, a) = net.gen_peer().unwrap();
        let (_, b) = net.gen_peer().unwrap();
        net.link_peers(&a.id(), &b.id()).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_stream_handler(tx);

        let outbound = a.new_stream(&b.id()).unwrap();
        outbound
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let inbound = rx.recv().await.unwrap();
        assert!(matches!(
            read_frame(&inbound).await,
            Err(NetError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn rejected_streams_fail_fast() {
        let net = Mocknet::new();
        let (_, a) = net.gen_peer().unwrap();
        let (_, b) = net.gen_peer().unwrap();
        net.link_peers(&a.id(), &b.id()).unwrap();
        let _rejector = reject_inbound(&b);

        let rpc = MockRpc::new(a.clone(), "/kad/1.0.0", Duration::from_secs(5));
        let err = rpc.ping(&b.info()).await.unwrap_err();
        assert!(!format!("{err:#}").contains("timed out"));
    }

    #[tokio::test]
    async fn truncate_peers_caps_list() {
        let from = PeerInfo::bare(crate::identity::PeerId::random());
        let peers: Vec<PeerInfo> = (0..MAX_PEERS_PER_RESPONSE + 5)
            .map(|_| PeerInfo::bare(crate::identity::PeerId::random()))
            .collect();
        assert_eq!(truncate_peers(peers, &from, "test").len(), MAX_PEERS_PER_RESPONSE);
    }
}

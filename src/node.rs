//! # DHT Node on the Mock Network
//!
//! A [`Node`] binds a [`DhtNode`] to one [`PeerNet`]: it serves inbound DHT
//! streams (unless in client mode), follows connection events to keep the
//! routing table in step with the network, and runs periodic bucket
//! refreshes.
//!
//! ```ignore
//! let net = Mocknet::new();
//! let (_, host_a) = net.gen_peer()?;
//! let (_, host_b) = net.gen_peer()?;
//! let a = Node::spawn(host_a, DhtConfig::default(), validator());
//! let b = Node::spawn(host_b, DhtConfig::default(), validator());
//! net.link_all()?;
//! net.connect_peers(&a.id(), &b.id())?;
//!
//! a.dht().put_value(&ctx, "/v/hello", b"world".to_vec()).await?;
//! let value = b.dht().get_value(&ctx, "/v/hello").await?;
//! ```

use std::ops::Deref;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::config::DhtConfig;
use crate::dht::DhtNode;
use crate::identity::{PeerId, PeerInfo};
use crate::mocknet::{NetEvent, ObserverId, PeerNet};
use crate::protocols::DhtRpc;
use crate::record::Validator;
use crate::rpc::{self, MockRpc};

pub struct Node {
    host: PeerNet,
    dht: DhtNode<MockRpc>,
    observer: ObserverId,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Start a DHT instance on `host`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(host: PeerNet, config: DhtConfig, validator: impl Validator + 'static) -> Self {
        let network = MockRpc::new(host.clone(), &config.protocol, config.rpc_timeout).client_mode(config.client_mode);
        let client_mode = config.client_mode;
        let protocol = config.protocol.clone();
        let dht = DhtNode::new(host.info(), network, config, validator);

        let server = if client_mode {
            rpc::reject_inbound(&host)
        } else {
            rpc::serve(&host, dht.clone(), &protocol)
        };

        let mut events = host.notify();
        let observer = events.id();
        let watcher = {
            let dht = dht.clone();
            let host = host.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    match event {
                        NetEvent::Connected(conn) => {
                            let dht = dht.clone();
                            let host = host.clone();
                            tokio::spawn(async move {
                                let peer = PeerInfo::new(conn.remote, conn.remote_addrs);
                                admit_peer(&dht, &host, peer).await;
                            });
                        }
                        NetEvent::Disconnected(conn) => {
                            if !host.conns_to_peer(&conn.remote).is_empty() {
                                continue;
                            }
                            if let Ok(true) = dht.remove_peer(&conn.remote).await {
                                trace!(peer = %conn.remote.short(), "last connection closed");
                            }
                        }
                        _ => {}
                    }
                }
            })
        };
        let refresh = dht.spawn_periodic_bucket_refresh();

        info!(peer = %host.id().short(), client_mode, protocol = %protocol, "dht node started");
        Self {
            host,
            dht,
            observer,
            tasks: Mutex::new(vec![server, watcher, refresh]),
        }
    }

    pub fn id(&self) -> PeerId {
        self.host.id()
    }

    pub fn info(&self) -> PeerInfo {
        self.host.info()
    }

    pub fn host(&self) -> &PeerNet {
        &self.host
    }

    pub fn dht(&self) -> &DhtNode<MockRpc> {
        &self.dht
    }

    /// Stop serving, stop following the network and shut the DHT down.
    /// Connections stay open.
    pub async fn close(&self) {
        self.host.remove_stream_handler();
        self.host.stop_notify(self.observer);
        self.dht.quit().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!(peer = %self.host.id().short(), "dht node closed");
    }
}

impl Deref for Node {
    type Target = DhtNode<MockRpc>;

    fn deref(&self) -> &Self::Target {
        &self.dht
    }
}

/// Add a newly connected peer once it answers a ping, which also proves it
/// speaks our protocol and is not in client mode. A peer whose connections
/// all closed while the ping was in flight stays out.
async fn admit_peer<N: DhtRpc>(dht: &DhtNode<N>, host: &PeerNet, peer: PeerInfo) {
    if let Err(e) = dht.network().ping(&peer).await {
        debug!(peer = %peer.id.short(), error = %e, "connected peer does not serve the dht");
        return;
    }
    if host.conns_to_peer(&peer.id).iter().all(|c| c.is_closed()) {
        trace!(peer = %peer.id.short(), "peer disconnected during admission");
        return;
    }
    if dht.observe_peer(peer).await.is_err() {
        trace!("dht stopped before peer could be admitted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::identity::Key;
    use crate::messages::Record;
    use crate::mocknet::Mocknet;
    use crate::record::BlankValidator;

    /// Answers every ping and nothing else.
    struct AlwaysAlive;

    #[async_trait]
    impl DhtRpc for AlwaysAlive {
        async fn ping(&self, _to: &PeerInfo) -> anyhow::Result<()> {
            Ok(())
        }

        async fn find_node(&self, _to: &PeerInfo, _target: Key) -> anyhow::Result<Vec<PeerInfo>> {
            anyhow::bail!("unsupported")
        }

        async fn get_value(&self, _to: &PeerInfo, _key: &str) -> anyhow::Result<(Option<Record>, Vec<PeerInfo>)> {
            anyhow::bail!("unsupported")
        }

        async fn put_value(&self, _to: &PeerInfo, _record: Record) -> anyhow::Result<()> {
            anyhow::bail!("unsupported")
        }

        async fn add_provider(&self, _to: &PeerInfo, _key: Key, _provider: PeerInfo) -> anyhow::Result<()> {
            anyhow::bail!("unsupported")
        }

        async fn get_providers(&self, _to: &PeerInfo, _key: Key) -> anyhow::Result<(Vec<PeerInfo>, Vec<PeerInfo>)> {
            anyhow::bail!("unsupported")
        }
    }

    #[tokio::test]
    async fn peer_without_open_connection_is_not_admitted() {
        let net = Mocknet::new();
        let (_, a) = net.gen_peer().unwrap();
        let (_, b) = net.gen_peer().unwrap();
        let dht = DhtNode::new(a.info(), AlwaysAlive, DhtConfig::default(), BlankValidator);

        // The ping succeeds but the connection is already gone.
        net.link_peers(&a.id(), &b.id()).unwrap();
        let conn = a.connect(&b.id()).unwrap();
        conn.close();
        admit_peer(&dht, &a, b.info()).await;
        assert!(!dht.routing_table_contains(&b.id()).await.unwrap());

        a.connect(&b.id()).unwrap();
        admit_peer(&dht, &a, b.info()).await;
        assert!(dht.routing_table_contains(&b.id()).await.unwrap());
    }
}

//! Transport trait for the DHT.
//!
//! The DHT is written against [`DhtRpc`] and never touches streams directly.
//! [`crate::rpc::MockRpc`] implements it over the virtual network; unit tests
//! implement it over an in-process registry. Implementations are picked at
//! compile time through `DhtNode<N: DhtRpc>`.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{Key, PeerInfo};
use crate::messages::Record;

#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Check that `to` is alive and serves the DHT protocol.
    async fn ping(&self, to: &PeerInfo) -> Result<()>;

    /// Peers `to` knows closest to `target`.
    async fn find_node(&self, to: &PeerInfo, target: Key) -> Result<Vec<PeerInfo>>;

    /// The record `to` holds under `key`, if any, and closer peers.
    async fn get_value(&self, to: &PeerInfo, key: &str) -> Result<(Option<Record>, Vec<PeerInfo>)>;

    /// Ask `to` to store `record`.
    async fn put_value(&self, to: &PeerInfo, record: Record) -> Result<()>;

    /// Announce `provider` as a provider of `key` to `to`.
    async fn add_provider(&self, to: &PeerInfo, key: Key, provider: PeerInfo) -> Result<()>;

    /// Providers `to` knows for `key`, and closer peers.
    async fn get_providers(&self, to: &PeerInfo, key: Key) -> Result<(Vec<PeerInfo>, Vec<PeerInfo>)>;
}

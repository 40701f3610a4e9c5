//! # kadmesh - Kademlia DHT over a Virtual Network
//!
//! kadmesh runs many DHT peers inside one process:
//!
//! - **Mocknet**: in-memory peers, links, connections and streams with
//!   latency and bandwidth shaping
//! - **Routing**: XOR-metric Kademlia routing table with liveness-probed
//!   bucket replacement
//! - **DHT**: iterative lookups, validated values, provider records
//! - **Bootstrap**: periodic self and random-key lookups across instances
//!
//! ## Architecture
//!
//! The DHT uses the actor pattern. [`DhtNode`] is a cheap handle; a private
//! actor task owns the routing table and the record stores and processes
//! commands one at a time. Lookups run on the caller's task and only talk to
//! the actor to read seeds and record responders.
//!
//! The DHT is written against the [`DhtRpc`] trait. [`MockRpc`] implements
//! it over [`mocknet`] streams and [`Node`] wires everything together for one
//! simulated peer.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Keypairs, peer ids, XOR distance |
//! | `mocknet` | Virtual peers, links and connections |
//! | `stream` | Ordered, shaped byte streams over connections |
//! | `routing` | Kademlia routing table |
//! | `query` | Iterative lookup engine |
//! | `dht` | DHT actor and public operations |
//! | `rpc` | Framed request/response over mocknet streams |
//! | `record` | Record validators and selectors |
//! | `providers` | Provider record store |
//! | `bootstrap` | Periodic bootstrap driver |
//! | `node` | One DHT instance bound to one mocknet peer |

pub mod bootstrap;
pub mod config;
pub mod context;
pub mod dht;
pub mod error;
pub mod identity;
pub mod messages;
pub mod mocknet;
pub mod node;
pub mod protocols;
pub mod providers;
pub mod query;
mod ratelimit;
pub mod record;
pub mod routing;
pub mod rpc;
pub mod stream;

pub use bootstrap::{bootstrap_round, BootstrapDriver};
pub use config::{BootstrapConfig, DhtConfig, LinkOptions};
pub use context::{Canceller, Interrupted, OpContext};
pub use dht::{DhtNode, RequestSender};
pub use error::{DhtError, DhtResult, NetError, RecordError};
pub use identity::{Key, Keypair, PeerId, PeerInfo};
pub use mocknet::{Connection, Connectedness, Link, Mocknet, NetEvent, PeerNet};
pub use node::Node;
pub use protocols::DhtRpc;
pub use record::{BlankValidator, NamespacedValidator, PublicKeyValidator, Validator, ValueRecord};
pub use rpc::MockRpc;
pub use stream::Stream;

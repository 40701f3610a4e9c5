//! # Wire Messages
//!
//! Request and response types of the DHT protocol. Every request travels in
//! a [`RequestFrame`] carrying the protocol identifier, so a server can turn
//! away peers speaking a different DHT protocol.
//!
//! Messages are encoded with bincode. Decoding always goes through
//! [`deserialize_bounded`], which caps the allocation a peer can trigger.
//! On a stream each message is one frame: a 4-byte big-endian length
//! followed by the encoded bytes.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{Key, PeerInfo};

/// Maximum size of a stored value.
pub const MAX_VALUE_SIZE: usize = 64 * 1024;

/// Maximum size of one encoded frame.
pub const MAX_FRAME_SIZE: usize = MAX_VALUE_SIZE + 64 * 1024;

/// Peers accepted from a single response; the rest are dropped.
pub const MAX_PEERS_PER_RESPONSE: usize = 100;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with the frame size limit enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// A key/value pair as it travels between peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestFrame {
    pub protocol: String,
    /// False for client-mode senders, which must not be added to routing
    /// tables.
    pub serving: bool,
    pub request: DhtRequest,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping,
    FindNode { target: Key },
    GetValue { key: String },
    PutValue { record: Record },
    AddProvider { key: Key, provider: PeerInfo },
    GetProviders { key: Key },
}

impl DhtRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            DhtRequest::Ping => "PING",
            DhtRequest::FindNode { .. } => "FIND_NODE",
            DhtRequest::GetValue { .. } => "GET_VALUE",
            DhtRequest::PutValue { .. } => "PUT_VALUE",
            DhtRequest::AddProvider { .. } => "ADD_PROVIDER",
            DhtRequest::GetProviders { .. } => "GET_PROVIDERS",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DhtResponse {
    Ack,
    Nodes(Vec<PeerInfo>),
    Value {
        record: Option<Record>,
        closer: Vec<PeerInfo>,
    },
    Providers {
        providers: Vec<PeerInfo>,
        closer: Vec<PeerInfo>,
    },
    Error {
        message: String,
    },
}

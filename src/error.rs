//! Error types for the simulator and the DHT.
//!
//! The transport trait in [`crate::protocols`] reports failures with
//! `anyhow::Error`; everything a caller can match on lives here.

use thiserror::Error;

use crate::context::Interrupted;
use crate::identity::PeerId;

/// Failures raised by the virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    #[error("peer {0} is already registered")]
    DuplicateIdentity(PeerId),

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("no route from {from} to {to}")]
    NoRouteToPeer { from: PeerId, to: PeerId },

    #[error("link does not exist")]
    LinkMissing,

    #[error("stream reset")]
    StreamReset,

    #[error("stream closed for writing")]
    StreamClosed,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("network has been dropped")]
    NetworkClosed,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    TimedOut,
}

impl From<Interrupted> for NetError {
    fn from(reason: Interrupted) -> Self {
        match reason {
            Interrupted::Cancelled => NetError::Cancelled,
            Interrupted::TimedOut => NetError::TimedOut,
        }
    }
}

/// Failures raised by record validators and selectors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("malformed record key: {0}")]
    InvalidKey(String),

    #[error("no validator for namespace {0:?}")]
    UnknownNamespace(String),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("no candidate records to select from")]
    NoCandidates,
}

/// Failures raised by routing and DHT operations.
#[derive(Debug, Error)]
pub enum DhtError {
    /// Bucket is full and its least-recently-seen entry answered the probe.
    #[error("routing bucket {bucket} is full")]
    TableFull { bucket: usize },

    #[error("not found")]
    NotFound,

    #[error("no peers reached")]
    NoPeersReached,

    #[error("failed to find any peer in table")]
    LookupFailure,

    #[error("record validation failed: {0}")]
    ValidationFailed(#[from] RecordError),

    #[error("can't replace a newer record with an older one")]
    StaleRecord,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    TimedOut,

    #[error("network error: {0}")]
    Network(#[from] NetError),

    #[error("dht node has shut down")]
    Shutdown,
}

impl From<Interrupted> for DhtError {
    fn from(reason: Interrupted) -> Self {
        match reason {
            Interrupted::Cancelled => DhtError::Cancelled,
            Interrupted::TimedOut => DhtError::TimedOut,
        }
    }
}

pub type DhtResult<T> = Result<T, DhtError>;

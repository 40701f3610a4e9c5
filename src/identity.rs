//! # Identity and XOR Keyspace
//!
//! This module defines the identity types shared by the network simulator and
//! the DHT:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`PeerId`]: 32-byte public key serving as the peer's unique identifier
//! - [`Key`]: a point in the 256-bit XOR keyspace
//! - [`PeerInfo`]: a peer identity together with its known addresses
//!
//! ## Identity Model
//!
//! **PeerId = Ed25519 public key.** Identities are self-certifying and are
//! used directly as Kademlia keys, so routing never has to hash a peer id.
//! Record keys and content identifiers are mapped into the same space with
//! BLAKE3 (see [`record_key`] and [`content_key`]).
//!
//! ## Invariants
//!
//! - `PeerId::from_bytes(b).as_bytes() == b`
//! - XOR distance is symmetric and zero only for identical inputs
//! - Distance ordering is lexicographic over big-endian bytes

use std::cmp::Ordering;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// A point in the DHT keyspace.
pub type Key = [u8; 32];

/// Length of the keyspace in bits; one routing bucket per bit.
pub const KEY_BITS: usize = 256;

/// Length of a raw Ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Deterministic keypair from a 32-byte seed. Handy for reproducible tests.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer", &self.peer_id().short())
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `message` against a raw Ed25519 public key.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &Signature) -> bool {
    match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key.verify(message, signature).is_ok(),
        Err(_) => false,
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the identity of the holder of `public_key`.
    #[inline]
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*public_key)
    }

    /// A random identity that is not backed by a keypair. Used as a lookup
    /// target when refreshing buckets.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The identity as a keyspace point.
    #[inline]
    pub fn key(&self) -> Key {
        self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &PeerId) -> [u8; 32] {
        xor_distance(&self.0, &other.0)
    }

    /// Distance from this identity to an arbitrary keyspace point.
    #[inline]
    pub fn distance_to(&self, key: &Key) -> [u8; 32] {
        xor_distance(&self.0, key)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[inline]
pub fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Compare two XOR distances lexicographically.
///
/// Used to decide which of two identities is closer to a target in the
/// Kademlia metric.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    for i in 0..32 {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Order two peers by distance to `target`, breaking ties on identity bytes.
#[inline]
pub fn closer_to(target: &Key, a: &PeerId, b: &PeerId) -> Ordering {
    distance_cmp(&a.distance_to(target), &b.distance_to(target)).then_with(|| a.cmp(b))
}

/// Index of the most significant set bit of `distance`, counted from the
/// least significant end (`bitlen - 1`). `None` for the zero distance.
pub fn highest_set_bit(distance: &[u8; 32]) -> Option<usize> {
    for (byte_idx, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let leading = (byte_idx * 8) + byte.leading_zeros() as usize;
            return Some(KEY_BITS - 1 - leading);
        }
    }
    None
}

/// Keyspace point for a record key such as `/v/hello`.
pub fn record_key(key: &str) -> Key {
    *blake3::hash(key.as_bytes()).as_bytes()
}

/// Keyspace point (content identifier) for a blob of content.
pub fn content_key(data: &[u8]) -> Key {
    *blake3::hash(data).as_bytes()
}

/// A peer identity and the addresses it is reachable on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }

    /// Identity with no known addresses.
    pub fn bare(id: PeerId) -> Self {
        Self { id, addrs: Vec::new() }
    }
}

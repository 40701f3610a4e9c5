//! Value records and their namespace validators.
//!
//! Record keys are paths such as `/v/hello`; the first segment names the
//! namespace whose [`Validator`] decides whether a value is acceptable and
//! which of several conflicting values wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::time::Instant;

use crate::error::RecordError;
use crate::identity::{PeerId, PUBLIC_KEY_LEN};

/// A value as held in a local store or collected during a lookup.
#[derive(Clone, Debug)]
pub struct ValueRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub received_from: PeerId,
    pub received_at: Instant,
}

impl ValueRecord {
    pub fn new(key: impl Into<String>, value: Vec<u8>, received_from: PeerId) -> Self {
        Self {
            key: key.into(),
            value,
            received_from,
            received_at: Instant::now(),
        }
    }
}

pub trait Validator: Send + Sync {
    /// Reject values that must never be stored or returned.
    fn validate(&self, key: &str, value: &[u8]) -> Result<(), RecordError>;

    /// Index of the preferred value among `values`, all previously
    /// validated. Earlier candidates win ties.
    fn select(&self, key: &str, values: &[&[u8]]) -> Result<usize, RecordError>;
}

/// Accepts everything and prefers the first candidate.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlankValidator;

impl Validator for BlankValidator {
    fn validate(&self, _key: &str, _value: &[u8]) -> Result<(), RecordError> {
        Ok(())
    }

    fn select(&self, _key: &str, values: &[&[u8]]) -> Result<usize, RecordError> {
        if values.is_empty() {
            return Err(RecordError::NoCandidates);
        }
        Ok(0)
    }
}

/// `/pk/<hex peer id>` records holding that peer's ed25519 public key.
#[derive(Clone, Copy, Debug, Default)]
pub struct PublicKeyValidator;

impl Validator for PublicKeyValidator {
    fn validate(&self, key: &str, value: &[u8]) -> Result<(), RecordError> {
        let (namespace, rest) = split_key(key)?;
        if namespace != "pk" {
            return Err(RecordError::InvalidKey(key.to_string()));
        }
        let expected = PeerId::from_hex(rest).map_err(|_| RecordError::InvalidKey(key.to_string()))?;
        let public_key: [u8; PUBLIC_KEY_LEN] = value
            .try_into()
            .map_err(|_| RecordError::Invalid(format!("public key must be {PUBLIC_KEY_LEN} bytes")))?;
        if PeerId::from_public_key(&public_key) != expected {
            return Err(RecordError::Invalid("public key does not match peer id".into()));
        }
        Ok(())
    }

    fn select(&self, _key: &str, values: &[&[u8]]) -> Result<usize, RecordError> {
        // Every valid value under a key is the same key.
        if values.is_empty() {
            return Err(RecordError::NoCandidates);
        }
        Ok(0)
    }
}

/// Dispatches on the first path segment of the key.
#[derive(Clone, Default)]
pub struct NamespacedValidator {
    namespaces: BTreeMap<String, Arc<dyn Validator>>,
}

impl NamespacedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default set: `/pk/` public keys only.
    pub fn with_defaults() -> Self {
        let mut validator = Self::new();
        validator.insert("pk", PublicKeyValidator);
        validator
    }

    pub fn insert(&mut self, namespace: impl Into<String>, validator: impl Validator + 'static) {
        self.namespaces.insert(namespace.into(), Arc::new(validator));
    }

    pub fn with(mut self, namespace: impl Into<String>, validator: impl Validator + 'static) -> Self {
        self.insert(namespace, validator);
        self
    }

    fn validator_for(&self, key: &str) -> Result<&Arc<dyn Validator>, RecordError> {
        let (namespace, _) = split_key(key)?;
        self.namespaces
            .get(namespace)
            .ok_or_else(|| RecordError::UnknownNamespace(namespace.to_string()))
    }
}

impl Validator for NamespacedValidator {
    fn validate(&self, key: &str, value: &[u8]) -> Result<(), RecordError> {
        self.validator_for(key)?.validate(key, value)
    }

    fn select(&self, key: &str, values: &[&[u8]]) -> Result<usize, RecordError> {
        let index = self.validator_for(key)?.select(key, values)?;
        if index >= values.len() {
            return Err(RecordError::Invalid(format!("selector returned out-of-range index {index}")));
        }
        Ok(index)
    }
}

impl std::fmt::Debug for NamespacedValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.namespaces.keys()).finish()
    }
}

/// Split `/ns/rest` into `("ns", "rest")`.
pub fn split_key(key: &str) -> Result<(&str, &str), RecordError> {
    let invalid = || RecordError::InvalidKey(key.to_string());
    let stripped = key.strip_prefix('/').ok_or_else(invalid)?;
    match stripped.split_once('/') {
        Some((namespace, rest)) if !namespace.is_empty() => Ok((namespace, rest)),
        _ => Err(invalid()),
    }
}

/// Key of the public-key record for `peer`.
pub fn public_key_record_key(peer: &PeerId) -> String {
    format!("/pk/{}", peer.to_hex())
}

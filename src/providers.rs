//! Local provider records.
//!
//! One entry per provider per content key. Records expire `ttl` after their
//! last announcement and are pruned lazily on read. The number of content
//! keys tracked is bounded; the least recently used key is dropped first.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};

use crate::identity::{Key, PeerId, PeerInfo};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderRecord {
    pub key: Key,
    pub provider: PeerId,
    pub addrs: Vec<String>,
    pub expiry: Instant,
}

impl ProviderRecord {
    pub fn info(&self) -> PeerInfo {
        PeerInfo::new(self.provider, self.addrs.clone())
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expiry <= now
    }
}

#[derive(Debug)]
pub struct ProviderStore {
    records: LruCache<Key, HashMap<PeerId, ProviderRecord>>,
    ttl: Duration,
}

impl ProviderStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: LruCache::new(capacity),
            ttl,
        }
    }

    /// Record `provider` for `key`, renewing its expiry if already known.
    pub fn add_provider(&mut self, key: Key, provider: PeerInfo) {
        let expiry = Instant::now() + self.ttl;
        let entries = self.records.get_or_insert_mut(key, HashMap::new);
        let record = entries.entry(provider.id).or_insert_with(|| ProviderRecord {
            key,
            provider: provider.id,
            addrs: Vec::new(),
            expiry,
        });
        if !provider.addrs.is_empty() {
            record.addrs = provider.addrs;
        }
        record.expiry = expiry;
    }

    /// Unexpired providers of `key`, ordered by identity.
    pub fn get_providers(&mut self, key: &Key) -> Vec<ProviderRecord> {
        let now = Instant::now();
        let Some(entries) = self.records.get_mut(key) else {
            return Vec::new();
        };
        entries.retain(|_, record| !record.is_expired(now));
        if entries.is_empty() {
            self.records.pop(key);
            return Vec::new();
        }
        let mut providers: Vec<ProviderRecord> = entries.values().cloned().collect();
        providers.sort_by(|a, b| a.provider.cmp(&b.provider));
        providers
    }

    /// Drop every expired record.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let mut emptied = Vec::new();
        for (key, entries) in self.records.iter_mut() {
            entries.retain(|_, record| !record.is_expired(now));
            if entries.is_empty() {
                emptied.push(*key);
            }
        }
        for key in emptied {
            self.records.pop(&key);
        }
    }

    /// Number of content keys with at least one record.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

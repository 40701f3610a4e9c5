//! # Kademlia Routing Table
//!
//! 256 buckets indexed by the XOR distance between the local identity and a
//! peer: bucket `i` holds peers whose distance has its highest set bit at
//! position `i` (`bitlen(distance) - 1`). Bucket 255 covers the far half of
//! the keyspace, bucket 0 the single closest neighbour.
//!
//! Each bucket holds at most `k` entries ordered from least- to
//! most-recently seen. A full bucket never drops an entry on its own:
//! [`RoutingTable::update`] hands back a [`PendingBucketUpdate`] naming the
//! least-recently-seen incumbent, the owner probes it, and
//! [`RoutingTable::apply_probe_result`] settles the contest.
//!
//! The table itself is plain data. Concurrency is handled by its owner, the
//! DHT actor, which serialises every mutation.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::RngCore;
use tokio::time::{Duration, Instant};

use crate::error::DhtError;
use crate::identity::{closer_to, highest_set_bit, Key, PeerId, PeerInfo, KEY_BITS};

#[derive(Clone, Debug)]
pub struct RoutingEntry {
    pub peer: PeerInfo,
    pub added_at: Instant,
    pub last_seen: Instant,
}

impl RoutingEntry {
    fn new(peer: PeerInfo) -> Self {
        let now = Instant::now();
        Self {
            peer,
            added_at: now,
            last_seen: now,
        }
    }
}

#[derive(Debug, Clone)]
struct RoutingBucket {
    entries: Vec<RoutingEntry>,
    last_refresh: Instant,
}

#[derive(Debug)]
enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    Full { oldest: Box<PeerInfo> },
}

/// Outcome of [`RoutingTable::update`].
#[derive(Debug)]
pub enum UpdateOutcome {
    Inserted,
    Refreshed,
    /// The local identity is never stored.
    Ignored,
    /// The bucket is full; probe `pending.oldest` and report back through
    /// [`RoutingTable::apply_probe_result`].
    Pending(PendingBucketUpdate),
}

/// A newcomer waiting on the liveness probe of a bucket's oldest entry.
#[derive(Clone, Debug)]
pub struct PendingBucketUpdate {
    pub bucket: usize,
    pub oldest: PeerInfo,
    pub candidate: PeerInfo,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn position(&self, id: &PeerId) -> Option<usize> {
        self.entries.iter().position(|e| e.peer.id == *id)
    }

    fn touch(&mut self, peer: PeerInfo, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.position(&peer.id) {
            let mut existing = self.entries.remove(pos);
            if !peer.addrs.is_empty() {
                existing.peer.addrs = peer.addrs;
            }
            existing.last_seen = Instant::now();
            self.entries.push(existing);
            self.mark_refreshed();
            return BucketTouchOutcome::Refreshed;
        }

        if self.entries.len() < k {
            self.entries.push(RoutingEntry::new(peer));
            self.mark_refreshed();
            return BucketTouchOutcome::Inserted;
        }

        match self.entries.first() {
            Some(oldest) => BucketTouchOutcome::Full {
                oldest: Box::new(oldest.peer.clone()),
            },
            // k == 0: nothing can ever be stored.
            None => BucketTouchOutcome::Full {
                oldest: Box::new(peer),
            },
        }
    }

    fn refresh(&mut self, id: &PeerId) -> bool {
        if let Some(pos) = self.position(id) {
            let mut existing = self.entries.remove(pos);
            existing.last_seen = Instant::now();
            self.entries.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &PeerId) -> bool {
        if let Some(pos) = self.position(id) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Bucket index of `peer` relative to `local`, `None` when they are equal.
pub fn bucket_index(local: &PeerId, peer: &PeerId) -> Option<usize> {
    highest_set_bit(&local.xor_distance(peer))
}

/// A random key whose distance to `local` falls in bucket `bucket`.
pub fn random_key_for_bucket(local: &PeerId, bucket: usize) -> Key {
    let bucket = bucket.min(KEY_BITS - 1);
    let mut distance = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut distance);

    // Bit `bucket` counted from the least significant end.
    let from_msb = KEY_BITS - 1 - bucket;
    let byte_idx = from_msb / 8;
    let target_bit = 0x80u8 >> (from_msb % 8);

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = local.as_bytes()[i] ^ distance[i];
    }
    key
}

#[derive(Debug)]
pub struct RoutingTable {
    local: PeerId,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(local: PeerId, k: usize) -> Self {
        Self {
            local,
            k,
            buckets: (0..KEY_BITS).map(|_| RoutingBucket::new()).collect(),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Insert `peer` or mark it as just seen.
    pub fn update(&mut self, peer: PeerInfo) -> UpdateOutcome {
        let Some(idx) = bucket_index(&self.local, &peer.id) else {
            return UpdateOutcome::Ignored;
        };
        match self.buckets[idx].touch(peer.clone(), self.k) {
            BucketTouchOutcome::Inserted => UpdateOutcome::Inserted,
            BucketTouchOutcome::Refreshed => UpdateOutcome::Refreshed,
            BucketTouchOutcome::Full { oldest } => UpdateOutcome::Pending(PendingBucketUpdate {
                bucket: idx,
                oldest: *oldest,
                candidate: peer,
            }),
        }
    }

    /// Settle a full-bucket contest. A live incumbent is kept and refreshed
    /// and the candidate rejected with `TableFull`; a dead one is evicted in
    /// favour of the candidate.
    pub fn apply_probe_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) -> Result<(), DhtError> {
        let k = self.k;
        let bucket = &mut self.buckets[pending.bucket];
        if oldest_alive {
            bucket.refresh(&pending.oldest.id);
            return Err(DhtError::TableFull { bucket: pending.bucket });
        }

        bucket.remove(&pending.oldest.id);
        if bucket.position(&pending.candidate.id).is_some() {
            return Ok(());
        }
        if bucket.entries.len() < k {
            bucket.entries.push(RoutingEntry::new(pending.candidate));
            bucket.mark_refreshed();
            Ok(())
        } else {
            // Another peer took the freed slot while the probe was in flight.
            Err(DhtError::TableFull { bucket: pending.bucket })
        }
    }

    pub fn remove(&mut self, id: &PeerId) -> bool {
        match bucket_index(&self.local, id) {
            Some(idx) => self.buckets[idx].remove(id),
            None => false,
        }
    }

    pub fn find(&self, id: &PeerId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &PeerId) -> Option<&RoutingEntry> {
        let idx = bucket_index(&self.local, id)?;
        self.buckets[idx].entries.iter().find(|e| e.peer.id == *id)
    }

    /// Bucket currently holding `id`, if any.
    pub fn bucket_of(&self, id: &PeerId) -> Option<usize> {
        self.buckets
            .iter()
            .position(|bucket| bucket.position(id).is_some())
    }

    pub fn size(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.peer.id))
            .collect()
    }

    /// The `count` known peers closest to `target`, nearest first. Equal
    /// distances are ordered by identity.
    pub fn nearest_peers(&self, target: &Key, count: usize) -> Vec<PeerInfo> {
        if count == 0 {
            return Vec::new();
        }

        struct Candidate<'a> {
            target: &'a Key,
            peer: &'a PeerInfo,
        }

        impl PartialEq for Candidate<'_> {
            fn eq(&self, other: &Self) -> bool {
                self.peer.id == other.peer.id
            }
        }

        impl Eq for Candidate<'_> {}

        impl Ord for Candidate<'_> {
            fn cmp(&self, other: &Self) -> Ordering {
                closer_to(self.target, &self.peer.id, &other.peer.id)
            }
        }

        impl PartialOrd for Candidate<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        // Max-heap of the best `count`; the root is the worst kept so far.
        let mut heap: BinaryHeap<Candidate<'_>> = BinaryHeap::with_capacity(count + 1);
        for entry in self.buckets.iter().flat_map(|b| b.entries.iter()) {
            heap.push(Candidate {
                target,
                peer: &entry.peer,
            });
            if heap.len() > count {
                heap.pop();
            }
        }

        heap.into_sorted_vec().into_iter().map(|c| c.peer.clone()).collect()
    }

    /// Non-empty buckets that saw no insert or refresh within `threshold`.
    pub fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.entries.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket: usize) {
        if let Some(b) = self.buckets.get_mut(bucket) {
            b.mark_refreshed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::distance_cmp;

    fn peer(seed: u32) -> PeerInfo {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&seed.to_be_bytes());
        PeerInfo::bare(PeerId::from_bytes(*blake3::hash(&bytes).as_bytes()))
    }

    /// `n` peers in the far bucket of `local`.
    fn far_bucket_peers(local: &PeerId, n: usize) -> Vec<PeerInfo> {
        (1u32..)
            .map(peer)
            .filter(|p| bucket_index(local, &p.id) == Some(KEY_BITS - 1))
            .take(n)
            .collect()
    }

    fn same_bucket_pair(local: &PeerId) -> (PeerInfo, PeerInfo) {
        let mut peers = far_bucket_peers(local, 2);
        let b = peers.pop().unwrap();
        let a = peers.pop().unwrap();
        (a, b)
    }

    #[test]
    fn bucket_index_is_highest_differing_bit() {
        let local = PeerId::from_bytes([0u8; 32]);
        let mut far = [0u8; 32];
        far[0] = 0x80;
        assert_eq!(bucket_index(&local, &PeerId::from_bytes(far)), Some(255));

        let mut near = [0u8; 32];
        near[31] = 0x01;
        assert_eq!(bucket_index(&local, &PeerId::from_bytes(near)), Some(0));

        let mut mid = [0u8; 32];
        mid[30] = 0x13;
        assert_eq!(bucket_index(&local, &PeerId::from_bytes(mid)), Some(12));

        assert_eq!(bucket_index(&local, &local), None);
    }

    #[test]
    fn local_identity_is_ignored() {
        let local = peer(0);
        let mut table = RoutingTable::new(local.id, 20);
        assert!(matches!(table.update(local.clone()), UpdateOutcome::Ignored));
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn bucket_invariant_holds_for_many_peers() {
        let local = peer(0).id;
        let k = 4;
        let mut table = RoutingTable::new(local, k);
        for seed in 1..2000 {
            let _ = table.update(peer(seed));
        }

        assert!(table.size() <= KEY_BITS * k);
        let ids = table.peers();
        let mut deduped = ids.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(ids.len(), deduped.len());

        for id in ids {
            assert_eq!(table.bucket_of(&id), bucket_index(&local, &id));
        }
    }

    #[test]
    fn nearest_peers_matches_brute_force() {
        let local = peer(0).id;
        let mut table = RoutingTable::new(local, 20);
        let mut all = Vec::new();
        for seed in 1..200 {
            let p = peer(seed);
            if matches!(table.update(p.clone()), UpdateOutcome::Inserted) {
                all.push(p.id);
            }
        }

        for probe in 0..10u8 {
            let target = *blake3::hash(&[probe]).as_bytes();
            let mut expected = all.clone();
            expected.sort_by(|a, b| closer_to(&target, a, b));
            expected.truncate(15);

            let got: Vec<PeerId> = table.nearest_peers(&target, 15).into_iter().map(|p| p.id).collect();
            assert_eq!(got, expected);
            for pair in got.windows(2) {
                assert_ne!(
                    distance_cmp(&pair[0].distance_to(&target), &pair[1].distance_to(&target)),
                    Ordering::Greater
                );
            }
        }
    }

    #[test]
    fn nearest_peers_with_zero_count_is_empty() {
        let mut table = RoutingTable::new(peer(0).id, 20);
        let _ = table.update(peer(1));
        assert!(table.nearest_peers(&[0u8; 32], 0).is_empty());
    }

    #[test]
    fn refresh_moves_entry_to_most_recent() {
        let local = peer(0).id;
        let peers = far_bucket_peers(&local, 3);
        let mut table = RoutingTable::new(local, 2);
        let _ = table.update(peers[0].clone());
        let _ = table.update(peers[1].clone());
        assert!(matches!(table.update(peers[0].clone()), UpdateOutcome::Refreshed));

        match table.update(peers[2].clone()) {
            UpdateOutcome::Pending(pending) => {
                assert_eq!(pending.oldest.id, peers[1].id);
                assert_eq!(pending.candidate.id, peers[2].id);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn full_bucket_keeps_live_incumbent() {
        let local = peer(0).id;
        let (incumbent, challenger) = same_bucket_pair(&local);
        let mut table = RoutingTable::new(local, 1);
        assert!(matches!(table.update(incumbent.clone()), UpdateOutcome::Inserted));

        let pending = match table.update(challenger.clone()) {
            UpdateOutcome::Pending(p) => p,
            other => panic!("expected pending probe, got {other:?}"),
        };
        assert_eq!(pending.oldest.id, incumbent.id);

        let err = table.apply_probe_result(pending, true).unwrap_err();
        assert!(matches!(err, DhtError::TableFull { .. }));
        assert!(table.find(&incumbent.id));
        assert!(!table.find(&challenger.id));
    }

    #[test]
    fn full_bucket_evicts_dead_incumbent() {
        let local = peer(0).id;
        let (incumbent, challenger) = same_bucket_pair(&local);
        let mut table = RoutingTable::new(local, 1);
        let _ = table.update(incumbent.clone());

        let UpdateOutcome::Pending(pending) = table.update(challenger.clone()) else {
            panic!("expected pending probe");
        };
        table.apply_probe_result(pending, false).unwrap();
        assert!(!table.find(&incumbent.id));
        assert!(table.find(&challenger.id));
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn remove_is_noop_for_unknown_peer() {
        let mut table = RoutingTable::new(peer(0).id, 20);
        let _ = table.update(peer(1));
        assert!(!table.remove(&peer(2).id));
        assert!(table.remove(&peer(1).id));
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn random_key_lands_in_requested_bucket() {
        let local = peer(7).id;
        for bucket in [0usize, 1, 7, 8, 100, 200, 254, 255] {
            let key = random_key_for_bucket(&local, bucket);
            assert_eq!(highest_set_bit(&local.distance_to(&key)), Some(bucket));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_buckets_become_stale() {
        let mut table = RoutingTable::new(peer(0).id, 20);
        let p = peer(1);
        let _ = table.update(p.clone());
        let idx = table.bucket_of(&p.id).unwrap();

        assert!(table.stale_buckets(Duration::from_secs(60)).is_empty());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(table.stale_buckets(Duration::from_secs(60)), vec![idx]);

        table.mark_bucket_refreshed(idx);
        assert!(table.stale_buckets(Duration::from_secs(60)).is_empty());
    }
}

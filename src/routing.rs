//! Kademlia-style routing table over peer address records.
//!
//! The table maps a peer's [`EndpointId`] to its last known
//! [`PeerInfo`], partitioned into 256 buckets by XOR distance between
//! the local node's DHT identifier and the peer's. Each bucket holds at
//! most `k` entries with LRU-like behaviour: long-lived peers are
//! preferred over newly discovered ones, and a full bucket only evicts
//! its oldest entry once a liveness probe against it has failed (the
//! ping-before-evict rule, driven by [`crate::discovery::Discovery`]).

use std::sync::Arc;

use iroh::{EndpointAddr, EndpointId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

// ============================================================================
// Identifiers and distance
// ============================================================================

/// A 256-bit identifier in the DHT keyspace.
///
/// Derived from a node's public key with BLAKE3 so identifiers are
/// uniformly distributed regardless of the key encoding.
pub type DhtId = [u8; 32];

/// Derive the DHT identifier for an endpoint by hashing its public key.
pub fn dht_id(peer: &EndpointId) -> DhtId {
    *blake3::hash(peer.as_bytes()).as_bytes()
}

/// Compute the XOR distance between two DHT identifiers.
///
/// XOR distance is the foundation of Kademlia routing: identifiers that
/// share more leading bits are "closer".
pub fn xor_distance(a: &DhtId, b: &DhtId) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Compare two XOR distances lexicographically.
pub(crate) fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Find the bucket index for an identifier relative to `self_id`.
///
/// The index is the position of the first differing bit (0..=255).
/// Bucket 0 is the furthest half of the keyspace, bucket 255 the
/// closest.
fn bucket_index(self_id: &DhtId, other: &DhtId) -> usize {
    let dist = xor_distance(self_id, other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            let leading = byte.leading_zeros() as usize; // 0..7
            return byte_idx * 8 + leading;
        }
    }
    // identical id: place in the "last" bucket
    255
}

// ============================================================================
// Peer address records
// ============================================================================

/// A peer's identifier together with its reachable address record.
///
/// The address is the opaque [`EndpointAddr`] the transport needs to
/// dial the peer. Entries are replaced wholesale on refresh, never
/// edited in place.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's public key, which is its mesh identity.
    pub id: EndpointId,
    /// Reachable addressing information for the peer.
    pub addr: EndpointAddr,
}

impl PeerInfo {
    /// The peer's position in the DHT keyspace.
    pub fn dht_id(&self) -> DhtId {
        dht_id(&self.id)
    }
}

// ============================================================================
// Buckets
// ============================================================================

/// A single routing bucket, oldest entry first.
#[derive(Debug, Default)]
struct Bucket {
    entries: Vec<PeerInfo>,
}

/// Outcome of adding or refreshing an entry in a bucket.
#[derive(Debug)]
enum BucketTouch {
    /// The entry was newly inserted.
    Inserted,
    /// An existing entry was refreshed: its address record was replaced
    /// and it moved to the most-recently-seen end.
    Refreshed,
    /// The bucket is full; the oldest entry must be probed before the
    /// incoming one can take its place.
    Full { incoming: PeerInfo, oldest: PeerInfo },
}

/// A deferred bucket update awaiting the result of a liveness probe
/// against the bucket's oldest entry.
#[derive(Clone, Debug)]
pub(crate) struct PendingEviction {
    bucket: usize,
    pub(crate) oldest: PeerInfo,
    incoming: PeerInfo,
}

impl Bucket {
    /// Add or refresh an entry.
    ///
    /// An existing entry is replaced with the incoming record and moved
    /// to the end of the LRU order. A full bucket returns its oldest
    /// entry for the caller to probe.
    fn touch(&mut self, info: PeerInfo, k: usize) -> BucketTouch {
        if let Some(pos) = self.entries.iter().position(|e| e.id == info.id) {
            self.entries.remove(pos);
            self.entries.push(info);
            return BucketTouch::Refreshed;
        }

        if self.entries.len() < k {
            self.entries.push(info);
            BucketTouch::Inserted
        } else {
            let oldest = self
                .entries
                .first()
                .cloned()
                .expect("bucket cannot be empty when full");
            BucketTouch::Full {
                incoming: info,
                oldest,
            }
        }
    }

    /// Move an entry to the most-recently-seen end. Returns false if it
    /// is no longer present.
    fn refresh(&mut self, id: &EndpointId) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| &e.id == id) {
            let existing = self.entries.remove(pos);
            self.entries.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &EndpointId) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| &e.id == id) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Routing table
// ============================================================================

/// The routing table shared between the host, discovery, and bootstrap.
///
/// Reads vastly outnumber writes (lookups during dial resolution versus
/// inserts during bootstrap and refresh), hence the reader/writer lock.
pub type SharedRoutingTable = Arc<RwLock<RoutingTable>>;

/// Kademlia routing table with 256 buckets of at most `k` entries.
#[derive(Debug)]
pub struct RoutingTable {
    /// The local node's identity; its own records are never stored.
    local: EndpointId,
    /// The local node's position in the keyspace.
    self_id: DhtId,
    /// Maximum entries per bucket.
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    /// Create an empty routing table for the given local identity.
    pub fn new(local: EndpointId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(256);
        for _ in 0..256 {
            buckets.push(Bucket::default());
        }
        Self {
            local,
            self_id: dht_id(&local),
            k,
            buckets,
        }
    }

    /// Wrap a new table in the shared handle used across components.
    pub fn shared(local: EndpointId, k: usize) -> SharedRoutingTable {
        Arc::new(RwLock::new(Self::new(local, k)))
    }

    /// The per-bucket capacity.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Add or refresh a peer record, discarding any pending eviction.
    pub fn update(&mut self, info: PeerInfo) {
        let _ = self.update_with_pending(info);
    }

    /// Add or refresh a peer record.
    ///
    /// Records for the local node are rejected. If the target bucket is
    /// full, the returned [`PendingEviction`] names the oldest entry to
    /// probe; [`Self::apply_ping_result`] completes the update.
    pub(crate) fn update_with_pending(&mut self, info: PeerInfo) -> Option<PendingEviction> {
        if info.id == self.local {
            return None;
        }
        let idx = bucket_index(&self.self_id, &info.dht_id());
        match self.buckets[idx].touch(info, self.k) {
            BucketTouch::Inserted | BucketTouch::Refreshed => None,
            BucketTouch::Full { incoming, oldest } => Some(PendingEviction {
                bucket: idx,
                oldest,
                incoming,
            }),
        }
    }

    /// Apply the outcome of probing the oldest entry of a full bucket.
    ///
    /// A live oldest entry keeps its slot and is refreshed; a dead one
    /// is evicted in favour of the incoming record.
    pub(crate) fn apply_ping_result(&mut self, pending: PendingEviction, oldest_alive: bool) {
        let bucket = &mut self.buckets[pending.bucket];
        if oldest_alive {
            bucket.refresh(&pending.oldest.id);
            return;
        }

        let _ = bucket.remove(&pending.oldest.id);
        if bucket.entries.iter().any(|e| e.id == pending.incoming.id) {
            return;
        }
        if bucket.entries.len() < self.k {
            bucket.entries.push(pending.incoming);
        }
    }

    /// Look up the stored record for a peer.
    pub fn get(&self, id: &EndpointId) -> Option<PeerInfo> {
        let idx = bucket_index(&self.self_id, &dht_id(id));
        self.buckets[idx]
            .entries
            .iter()
            .find(|e| &e.id == id)
            .cloned()
    }

    /// Whether a record for the peer is present.
    pub fn contains(&self, id: &EndpointId) -> bool {
        self.get(id).is_some()
    }

    /// Drop the record for a peer. Returns false if it was absent.
    pub fn remove(&mut self, id: &EndpointId) -> bool {
        let idx = bucket_index(&self.self_id, &dht_id(id));
        self.buckets[idx].remove(id)
    }

    /// The `count` stored records closest to `target`.
    pub fn closest(&self, target: &DhtId, count: usize) -> Vec<PeerInfo> {
        let mut all: Vec<PeerInfo> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect();

        all.sort_by(|a, b| {
            let da = xor_distance(&a.dht_id(), target);
            let db = xor_distance(&b.dht_id(), target);
            distance_cmp(&da, &db)
        });

        all.truncate(count);
        all
    }

    /// Total number of stored records across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    /// Whether the table holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }
}

//! Configuration structs for links, DHT nodes and the bootstrap driver.
//!
//! All tuning is explicit: each constructor takes one of these structs and
//! nothing is read from process-wide state.

use tokio::time::Duration;

/// Default Kademlia bucket size and replication factor.
pub const DEFAULT_K: usize = 20;

/// Default Kademlia concurrency factor (parallel queries per round).
pub const DEFAULT_ALPHA: usize = 3;

/// Default protocol identifier spoken by DHT peers.
pub const DEFAULT_PROTOCOL: &str = "/kad/1.0.0";

/// Latency and bandwidth shaping of a single simulated link.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkOptions {
    /// One-way delay added to every write.
    pub latency: Duration,
    /// Bytes per second. Zero disables rate limiting.
    pub bandwidth: f64,
    /// Token bucket capacity in bytes. `None` means one second of bandwidth.
    pub max_burst: Option<f64>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            bandwidth: 0.0,
            max_burst: None,
        }
    }
}

impl LinkOptions {
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_bandwidth(mut self, bytes_per_sec: f64) -> Self {
        self.bandwidth = bytes_per_sec;
        self
    }

    pub fn with_max_burst(mut self, bytes: f64) -> Self {
        self.max_burst = Some(bytes);
        self
    }
}

#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Bucket size; also the number of peers a lookup converges on and a put
    /// replicates to.
    pub k: usize,
    /// Maximum outstanding RPCs per lookup round.
    pub alpha: usize,
    /// Protocol identifier carried by every request frame.
    pub protocol: String,
    /// Per-RPC timeout. RPCs are never retried.
    pub rpc_timeout: Duration,
    /// Agreeing records required by [`crate::dht::DhtNode::get_value`].
    pub quorum: usize,
    /// Maximum records kept in the local value store.
    pub record_capacity: usize,
    /// Maximum content keys tracked by the provider store.
    pub provider_capacity: usize,
    /// How long a provider record stays valid.
    pub provider_ttl: Duration,
    /// How often buckets without recent activity are refreshed.
    pub bucket_refresh_interval: Duration,
    /// Client-mode nodes query the DHT but do not answer requests.
    pub client_mode: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            protocol: DEFAULT_PROTOCOL.to_string(),
            rpc_timeout: Duration::from_secs(5),
            quorum: 16,
            record_capacity: 4096,
            provider_capacity: 4096,
            provider_ttl: Duration::from_secs(24 * 60 * 60),
            bucket_refresh_interval: Duration::from_secs(30 * 60),
            client_mode: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    /// Lookups per bootstrap round: one self lookup plus `queries - 1`
    /// random-key lookups.
    pub queries: usize,
    /// Delay between rounds of the bootstrap driver.
    pub period: Duration,
    /// Bound on each individual lookup.
    pub timeout: Duration,
    /// Start each round at a random DHT instance.
    pub randomize_start: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            queries: 1,
            period: Duration::from_secs(5 * 60),
            timeout: Duration::from_secs(10),
            randomize_start: true,
        }
    }
}

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use kadmesh::{BlankValidator, DhtConfig, Mocknet, NamespacedValidator, Node, OpContext, Validator};
use tokio::time::{sleep, timeout};

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Initialize tracing for tests. Use RUST_LOG=debug or RUST_LOG=trace for
/// verbose output.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("warn")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn ctx() -> OpContext {
    OpContext::with_timeout(TEST_TIMEOUT)
}

/// `/pk` records plus a `/v` namespace that accepts anything.
pub fn test_validator() -> NamespacedValidator {
    NamespacedValidator::with_defaults().with("v", BlankValidator)
}

/// Prefers `newer` over `valid` and rejects `expired`.
pub struct OrderingValidator;

impl Validator for OrderingValidator {
    fn validate(&self, _key: &str, value: &[u8]) -> Result<(), kadmesh::RecordError> {
        if value == b"expired" {
            return Err(kadmesh::RecordError::Invalid("expired".into()));
        }
        Ok(())
    }

    fn select(&self, _key: &str, values: &[&[u8]]) -> Result<usize, kadmesh::RecordError> {
        values
            .iter()
            .position(|v| *v == b"newer")
            .or_else(|| values.iter().position(|v| *v == b"valid"))
            .ok_or(kadmesh::RecordError::NoCandidates)
    }
}

pub fn test_config() -> DhtConfig {
    DhtConfig {
        rpc_timeout: Duration::from_secs(2),
        ..DhtConfig::default()
    }
}

/// Spawn `count` DHT nodes on fresh peers of `net`.
pub fn setup_dhts(net: &Mocknet, count: usize, config: DhtConfig) -> Vec<Node> {
    (0..count)
        .map(|_| {
            let (_, host) = net.gen_peer().expect("peer registration");
            Node::spawn(host, config.clone(), test_validator())
        })
        .collect()
}

/// Link and connect `a` to `b`, then wait until each has the other in its
/// routing table.
pub async fn connect(net: &Mocknet, a: &Node, b: &Node) {
    connect_no_wait(net, a, b);
    wait_for_peer(a, b).await;
    wait_for_peer(b, a).await;
}

pub fn connect_no_wait(net: &Mocknet, a: &Node, b: &Node) {
    if net.links_between_peers(&a.id(), &b.id()).is_empty() {
        net.link_peers(&a.id(), &b.id()).expect("link");
    }
    net.connect_peers(&a.id(), &b.id()).expect("connect");
}

pub async fn wait_for_peer(node: &Node, peer: &Node) {
    let found = timeout(TEST_TIMEOUT, async {
        while !node.dht().routing_table_contains(&peer.id()).await.expect("dht running") {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        found.is_ok(),
        "{} never added {} to its routing table",
        node.id().short(),
        peer.id().short()
    );
}

/// Give connection handling a moment to settle.
pub async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

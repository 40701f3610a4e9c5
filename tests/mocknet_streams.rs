//! Integration tests for the virtual network: streams, shaping and
//! connection lifecycle.
//!
//! Run with verbose output: RUST_LOG=trace cargo test --test mocknet_streams -- --nocapture

mod common;

use std::time::Duration;

use kadmesh::{Connectedness, LinkOptions, Mocknet, NetError, NetEvent, OpContext};
use tokio::time::{timeout, Instant};

use common::init_tracing;

fn two_peers() -> (Mocknet, kadmesh::PeerNet, kadmesh::PeerNet) {
    let net = Mocknet::new();
    let (_, a) = net.gen_peer().unwrap();
    let (_, b) = net.gen_peer().unwrap();
    (net, a, b)
}

#[tokio::test]
async fn stream_round_trip_ends_with_eof() {
    init_tracing();
    let (net, a, b) = two_peers();
    net.link_peers(&a.id(), &b.id()).unwrap();
    let conn = a.connect(&b.id()).unwrap();
    let remote = b.conns_to_peer(&a.id()).pop().expect("listener side registered");

    let stream = conn.open_stream().unwrap();
    stream.write_all(b"hello ").await.unwrap();
    stream.write_all(b"world").await.unwrap();
    stream.close().await.unwrap();

    let inbound = timeout(Duration::from_secs(1), remote.accept_stream())
        .await
        .expect("accept in time")
        .unwrap();
    assert_eq!(inbound.remote_peer(), a.id());
    assert_eq!(inbound.read_to_end().await.unwrap(), b"hello world");

    // The other direction is still open.
    inbound.write_all(b"ack").await.unwrap();
    inbound.close().await.unwrap();
    assert_eq!(stream.read_to_end().await.unwrap(), b"ack");
}

#[tokio::test]
async fn reset_unblocks_pending_read() {
    let (net, a, b) = two_peers();
    net.link_peers(&a.id(), &b.id()).unwrap();
    let conn = a.connect(&b.id()).unwrap();
    let remote = b.conns_to_peer(&a.id()).pop().unwrap();

    let stream = conn.open_stream().unwrap();
    let inbound = remote.accept_stream().await.unwrap();

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        inbound.read(&mut buf).await
    });
    tokio::task::yield_now().await;
    stream.reset();

    let result = timeout(Duration::from_secs(1), reader).await.expect("read unblocked").unwrap();
    assert!(matches!(result, Err(NetError::StreamReset)));
    assert!(matches!(stream.write(b"late").await, Err(NetError::StreamReset)));
}

#[tokio::test(start_paused = true)]
async fn blocked_accept_and_read_give_up_with_their_context() {
    let (net, a, b) = two_peers();
    net.link_peers(&a.id(), &b.id()).unwrap();
    let conn = a.connect(&b.id()).unwrap();
    let remote = b.conns_to_peer(&a.id()).pop().unwrap();

    let deadline = OpContext::with_timeout(Duration::from_millis(100));
    assert!(matches!(
        remote.accept_stream_with_context(&deadline).await,
        Err(NetError::TimedOut)
    ));

    let stream = conn.open_stream().unwrap();
    let inbound = remote.accept_stream().await.unwrap();
    let (ctx, canceller) = OpContext::with_cancel();
    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        let cancelled = inbound.read_with_context(&ctx, &mut buf).await;
        (inbound, cancelled)
    });
    tokio::task::yield_now().await;
    canceller.cancel();

    let (inbound, cancelled) = reader.await.unwrap();
    assert!(matches!(cancelled, Err(NetError::Cancelled)));

    // Giving up on a read leaves the stream usable.
    stream.write_all(b"late").await.unwrap();
    stream.close().await.unwrap();
    assert_eq!(inbound.read_to_end().await.unwrap(), b"late");
}

#[tokio::test(start_paused = true)]
async fn latency_delays_delivery() {
    let (net, a, b) = two_peers();
    net.link_peers_with(&a.id(), &b.id(), LinkOptions::default().with_latency(Duration::from_millis(250)))
        .unwrap();
    let stream = a.new_stream(&b.id()).unwrap();
    let inbound = b.conns_to_peer(&a.id()).pop().unwrap().accept_stream().await.unwrap();

    let start = Instant::now();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert!(start.elapsed() >= Duration::from_millis(250));
}

#[tokio::test(start_paused = true)]
async fn bandwidth_limits_delivery_rate() {
    let (net, a, b) = two_peers();
    net.link_peers_with(&a.id(), &b.id(), LinkOptions::default().with_bandwidth(1000.0))
        .unwrap();
    let stream = a.new_stream(&b.id()).unwrap();
    let inbound = b.conns_to_peer(&a.id()).pop().unwrap().accept_stream().await.unwrap();

    let start = Instant::now();
    stream.write_all(&[7u8; 2000]).await.unwrap();
    stream.close().await.unwrap();
    let received = inbound.read_to_end().await.unwrap();

    assert_eq!(received.len(), 2000);
    assert!(
        start.elapsed() >= Duration::from_millis(1900),
        "2000 bytes at 1000 B/s arrived after {:?}",
        start.elapsed()
    );
}

#[tokio::test(start_paused = true)]
async fn tiny_bandwidth_holds_writes_back_without_failing() {
    let (net, a, b) = two_peers();
    let link = net.link_peers(&a.id(), &b.id()).unwrap();
    link.set_options(LinkOptions::default().with_bandwidth(1e-20));
    let stream = a.new_stream(&b.id()).unwrap();
    let inbound = b.conns_to_peer(&a.id()).pop().unwrap().accept_stream().await.unwrap();

    stream.write_all(b"slow").await.unwrap();
    stream.write_all(b"slower").await.unwrap();
    let mut buf = [0u8; 4];
    assert!(timeout(Duration::from_secs(3600), inbound.read(&mut buf)).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn small_write_never_overtakes_large_one() {
    let (net, a, b) = two_peers();
    net.link_peers_with(&a.id(), &b.id(), LinkOptions::default().with_bandwidth(10_000.0))
        .unwrap();
    let stream = a.new_stream(&b.id()).unwrap();
    let inbound = b.conns_to_peer(&a.id()).pop().unwrap().accept_stream().await.unwrap();

    let large = vec![1u8; 5000];
    stream.write_all(&large).await.unwrap();
    stream.write_all(&[2u8]).await.unwrap();
    stream.close().await.unwrap();

    let received = inbound.read_to_end().await.unwrap();
    assert_eq!(received.len(), 5001);
    assert!(received[..5000].iter().all(|b| *b == 1));
    assert_eq!(received[5000], 2);
}

#[tokio::test]
async fn unlink_closes_connections() {
    let (net, a, b) = two_peers();
    net.link_peers(&a.id(), &b.id()).unwrap();
    let conn = a.connect(&b.id()).unwrap();
    let stream = conn.open_stream().unwrap();
    assert_eq!(a.connectedness(&b.id()), Connectedness::Connected);

    let link = net.links_between_peers(&a.id(), &b.id()).pop().unwrap();
    net.unlink_peers(&a.id(), &b.id()).unwrap();
    assert!(matches!(net.unlink(&link), Err(NetError::LinkMissing)));
    assert!(matches!(net.unlink_peers(&a.id(), &b.id()), Err(NetError::LinkMissing)));

    assert!(conn.is_closed());
    assert!(stream.is_reset());
    assert_eq!(a.connectedness(&b.id()), Connectedness::NotConnected);
    assert!(b.conns_to_peer(&a.id()).is_empty());
    assert!(matches!(
        a.connect(&b.id()),
        Err(NetError::NoRouteToPeer { .. })
    ));
}

#[tokio::test]
async fn connection_events_arrive_in_order() {
    let (net, a, b) = two_peers();
    let mut events = b.notify();
    net.link_peers(&a.id(), &b.id()).unwrap();

    for _ in 0..3 {
        a.connect(&b.id()).unwrap();
        net.disconnect_peers(&a.id(), &b.id()).unwrap();
    }

    let mut seen = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(100), events.next()).await {
        match event {
            NetEvent::Connected(info) => seen.push(("connected", info.id)),
            NetEvent::Disconnected(info) => seen.push(("disconnected", info.id)),
            _ => {}
        }
    }

    assert_eq!(seen.len(), 6);
    for pair in seen.chunks(2) {
        assert_eq!(pair[0].0, "connected");
        assert_eq!(pair[1].0, "disconnected");
        assert_eq!(pair[0].1, pair[1].1);
    }
}

#[tokio::test]
async fn closed_network_refuses_dials() {
    let net = Mocknet::new();
    let (_, a) = net.gen_peer().unwrap();
    let (_, b) = net.gen_peer().unwrap();
    net.link_peers(&a.id(), &b.id()).unwrap();
    drop(net);

    assert!(matches!(a.connect(&b.id()), Err(NetError::NetworkClosed)));
}

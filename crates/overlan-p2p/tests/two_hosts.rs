//! Two live hosts on loopback: connect, exchange a stream, observe the
//! accounting surfaces.

use std::time::Duration;

use futures::AsyncWriteExt;
use overlan_p2p::{
    HostConfig, Keypair, OverlayHost, PeerAddrInfo, StreamProtocol,
};

const TEST_PROTOCOL: StreamProtocol = StreamProtocol::new("/overlan/itest/1.0.0");

fn local_host_config() -> HostConfig {
    HostConfig {
        listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
        ..HostConfig::default()
    }
}

async fn wait_until<F>(mut condition: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn connect_and_stream_between_two_hosts() {
    let host_a = OverlayHost::init(Keypair::generate_ed25519(), local_host_config())
        .await
        .unwrap();
    let host_b = OverlayHost::init(Keypair::generate_ed25519(), local_host_config())
        .await
        .unwrap();

    // A sinks every inbound stream on the test protocol.
    host_a
        .set_stream_handler(TEST_PROTOCOL, |_, mut stream| {
            tokio::spawn(async move {
                use futures::AsyncReadExt;
                let mut sink = Vec::new();
                let _ = stream.read_to_end(&mut sink).await;
            });
        })
        .unwrap();

    // Wait for A to bind its listener.
    let mut addrs = Vec::new();
    for _ in 0..200 {
        addrs = host_a.announced_as().await;
        if !addrs.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(!addrs.is_empty(), "host A never bound a listener");

    host_b
        .connect_peer(PeerAddrInfo {
            peer_id: host_a.local_peer_id(),
            addrs,
        })
        .await
        .unwrap();

    assert!(host_b.is_connected(host_a.local_peer_id()).await);
    assert_eq!(host_b.connected_peers_count().await, 1);
    assert!(!host_b
        .conns_to_peer(host_a.local_peer_id())
        .await
        .is_empty());

    // One outbound packet-sized payload over a fresh stream.
    let payload = vec![0xabu8; 512];
    {
        let mut stream = host_b
            .new_stream(host_a.local_peer_id(), TEST_PROTOCOL)
            .await
            .unwrap();
        assert_eq!(host_b.open_streams_count(), 1);
        let stats = host_b.open_stream_stats();
        assert_eq!(stats["/overlan/itest/1.0.0"]["outbound"], 1);

        stream.write_all(&payload).await.unwrap();
        stream.close().await.unwrap();
    }

    // The guard settled the open count on drop; totals are monotonic.
    assert_eq!(host_b.open_streams_count(), 0);
    assert_eq!(host_b.total_streams_outbound(), 1);
    assert_eq!(host_b.total_streams_inbound(), 0);
    assert!(host_b.network_stats().total_out >= payload.len() as u64);
    assert!(
        host_b
            .network_stats_for_peer(host_a.local_peer_id())
            .total_out
            >= payload.len() as u64
    );

    // A saw the stream arrive.
    let host_a_counts = host_a.clone();
    wait_until(
        move || host_a_counts.total_streams_inbound() == 1,
        "host A inbound stream total",
    )
    .await;

    host_b.close().await.unwrap();
    host_a.close().await.unwrap();
}

#[tokio::test]
async fn close_is_observable_from_any_handle() {
    let host = OverlayHost::init(Keypair::generate_ed25519(), local_host_config())
        .await
        .unwrap();
    let handle = host.clone();

    host.close().await.unwrap();
    // The task is gone; later commands report the host closed.
    assert!(handle
        .connect_peer(PeerAddrInfo {
            peer_id: handle.local_peer_id(),
            addrs: Vec::new(),
        })
        .await
        .is_err());
}

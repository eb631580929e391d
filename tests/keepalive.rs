mod common;

use std::time::Duration;

use stationlink::config::HostEndpoint;
use stationlink::services::codec::{write_frame, FrameCodec, Inbound, PROBE_REPLY};
use stationlink::{ClientConnection, Listener};

use common::{client_options, endpoint, server_options, start_server, PipeTransport};

#[tokio::test]
async fn probes_go_out_once_per_interval_and_are_answered() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, mut peers) = PipeTransport::new(&[], 0);
    let mut options = client_options("station", vec![HostEndpoint::new("relay", 7000)], dir.path());
    options.messaging.keepalive_interval = Duration::from_millis(100);
    let client = ClientConnection::builder(options)
        .transport(transport)
        .build()
        .unwrap();
    client.connect().await.unwrap();

    let mut peer = peers.recv().await.unwrap();
    let answering = tokio::spawn(async move {
        let codec = FrameCodec::new(16400).unwrap();
        let mut answered = 0u64;
        while let Ok(inbound) = codec.read_inbound(&mut peer).await {
            if inbound == Inbound::ProbeRequest {
                if write_frame(&mut peer, PROBE_REPLY.as_bytes()).await.is_err() {
                    break;
                }
                answered += 1;
            }
        }
        answered
    });

    tokio::time::sleep(Duration::from_millis(550)).await;
    let stats = client.keepalive_stats();
    assert!((4..=6).contains(&stats.probes_sent), "sent {}", stats.probes_sent);
    assert!(stats.replies_received + 1 >= stats.probes_sent);
    assert!(client.connection().keepalive().is_active());

    client.close().await;
    let answered = answering.await.unwrap();
    assert!(answered >= stats.replies_received);
}

#[tokio::test]
async fn server_answers_probes() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, addr) = start_server(Listener::builder(server_options(dir.path()))).await;
    let mut options = client_options("station", vec![endpoint(addr)], dir.path());
    options.messaging.keepalive_interval = Duration::from_millis(100);
    let client = ClientConnection::new(options).unwrap();
    client.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(450)).await;
    let stats = client.keepalive_stats();
    assert!(stats.probes_sent >= 3);
    assert!(stats.replies_received >= 2);

    client.close().await;
    listener.stop().await;
}

#[tokio::test]
async fn no_probes_once_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, mut peers) = PipeTransport::new(&[], 0);
    let mut options = client_options("station", vec![HostEndpoint::new("relay", 7000)], dir.path());
    options.messaging.keepalive_interval = Duration::from_millis(50);
    let client = ClientConnection::builder(options)
        .transport(transport)
        .build()
        .unwrap();
    client.connect().await.unwrap();
    let _peer = peers.recv().await.unwrap();

    client.close().await;
    let before = client.keepalive_stats().probes_sent;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.keepalive_stats().probes_sent, before);
    assert!(!client.connection().keepalive().is_active());
}

mod common;

use std::time::Duration;

use stationlink::config::HostEndpoint;
use stationlink::domains::paths;
use stationlink::services::codec::{FrameCodec, Inbound};
use stationlink::services::connection::FORWARDING_NOT_IMPLEMENTED;
use stationlink::{ClientConnection, Envelope, Listener, Request};

use common::{
    client_options, endpoint, eventually, server_options, start_server, PipeTransport, RecordingReceiver,
};

const WAIT: Duration = Duration::from_secs(5);

async fn connected_client(
    id: &str,
    addr: std::net::SocketAddr,
    dir: &std::path::Path,
    listener: &std::sync::Arc<Listener>,
) -> (ClientConnection, std::sync::Arc<RecordingReceiver>) {
    let recorder = RecordingReceiver::new();
    let client = ClientConnection::builder(client_options(id, vec![endpoint(addr)], dir))
        .receiver(recorder.clone())
        .build()
        .unwrap();
    client.connect().await.unwrap();
    let registered = eventually(WAIT, || {
        let listener = listener.clone();
        let id = id.to_string();
        async move { listener.find_by_logical_id(&id).await.is_some() }
    })
    .await;
    assert!(registered, "{id} never authenticated");
    (client, recorder)
}

#[tokio::test]
async fn relay_delivers_to_the_addressed_client_with_the_original_sender() {
    let dir = tempfile::tempdir().unwrap();
    let server_recorder = RecordingReceiver::new();
    let (listener, addr) = start_server(
        Listener::builder(server_options(dir.path())).receiver(server_recorder.clone()),
    )
    .await;
    let (alpha, _) = connected_client("alpha", addr, dir.path(), &listener).await;
    let (beta, beta_seen) = connected_client("beta", addr, dir.path(), &listener).await;

    let envelope = Envelope::request(Request::new(paths::CHAT_MESSAGE).with_text("hello beta"))
        .with_target("beta");
    let id = envelope.id.clone();
    alpha.send(envelope).await.unwrap();

    let delivered = beta_seen.wait_for_id(&id, WAIT).await.unwrap();
    assert_eq!(delivered.source_id.as_deref(), Some("alpha"));
    assert_eq!(delivered.request.unwrap().text.as_deref(), Some("hello beta"));

    // The relay consumes forwarded envelopes itself.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server_recorder.received().await.iter().all(|e| e.id != id));

    alpha.close().await;
    beta.close().await;
    listener.stop().await;
}

#[tokio::test]
async fn unknown_target_gets_a_failure_reply() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, addr) = start_server(Listener::builder(server_options(dir.path()))).await;
    let (alpha, alpha_seen) = connected_client("alpha", addr, dir.path(), &listener).await;

    let envelope = Envelope::request(Request::new(paths::CHAT_MESSAGE)).with_target("nobody");
    let id = envelope.id.clone();
    alpha.send(envelope).await.unwrap();

    let reply = alpha_seen.wait_for_id(&id, WAIT).await.unwrap();
    let response = reply.response.unwrap();
    assert!(!response.success);
    assert!(response.error_message.unwrap().contains("nobody"));

    alpha.close().await;
    listener.stop().await;
}

#[tokio::test]
async fn forwarding_a_waiting_request_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, addr) = start_server(Listener::builder(server_options(dir.path()))).await;
    let (alpha, _) = connected_client("alpha", addr, dir.path(), &listener).await;
    let (beta, beta_seen) = connected_client("beta", addr, dir.path(), &listener).await;

    let envelope = Envelope::request(Request::new(paths::CHAT_MESSAGE)).with_target("beta");
    let id = envelope.id.clone();
    let reply = alpha.send_and_await(envelope, Some(WAIT)).await.unwrap();
    assert!(!reply.response.unwrap().success);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(beta_seen.received().await.iter().all(|e| e.id != id));

    alpha.close().await;
    beta.close().await;
    listener.stop().await;
}

#[tokio::test]
async fn clients_refuse_to_forward() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, mut peers) = PipeTransport::new(&[], 0);
    let recorder = RecordingReceiver::new();
    let client = ClientConnection::builder(client_options(
        "station",
        vec![HostEndpoint::new("relay", 7000)],
        dir.path(),
    ))
    .transport(transport)
    .receiver(recorder.clone())
    .build()
    .unwrap();
    client.connect().await.unwrap();

    let mut peer = peers.recv().await.unwrap();
    let codec = FrameCodec::new(16400).unwrap();
    let stray = Envelope::request(Request::new(paths::CHAT_MESSAGE)).with_target("elsewhere");
    codec.write_envelope(&mut peer, &stray).await.unwrap();

    let reply = loop {
        match tokio::time::timeout(WAIT, codec.read_inbound(&mut peer))
            .await
            .unwrap()
            .unwrap()
        {
            Inbound::Envelope(envelope) if envelope.id == stray.id => break envelope,
            _ => continue,
        }
    };
    let response = reply.response.unwrap();
    assert!(!response.success);
    assert_eq!(response.error_message.as_deref(), Some(FORWARDING_NOT_IMPLEMENTED));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(recorder.received().await.iter().all(|e| e.id != stray.id));
    client.close().await;
}

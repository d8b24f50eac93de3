use crate::helper::*;
use std::sync::Arc;
use std::time::Duration;
use wiremux::transport::memory;
use wiremux::Transport;
use wiremux::{CancelSource, Connection, Value, WiremuxError};
use wiremux_codec::frame::Response;

#[tokio::test]
async fn cancellation_settles_the_caller_promptly() {
    let (client, server) = connected_pair().await;
    let handler = Arc::new(EchoChannel::new());
    let log = handler.log.clone();
    server.register_channel("ping", handler);

    let (source, token) = CancelSource::new();
    let proxy = client.get_channel("ping");
    let call = tokio::spawn(async move {
        proxy
            .call_with_token("wait_cancel", Value::Absent, token)
            .await
    });

    // Wait until the handler is really running, then cancel.
    eventually(
        || log.lock().unwrap().iter().any(|m| m == "wait_cancel"),
        "handler to start",
    )
    .await;
    source.cancel();

    let result = tokio::time::timeout(Duration::from_millis(100), call)
        .await
        .expect("cancellation must settle the future promptly")
        .unwrap();
    assert!(matches!(result, Err(WiremuxError::Cancelled)));

    // The handler observes the token and may complete anyway; its
    // response has nobody to go to and is dropped.
    eventually(
        || log.lock().unwrap().iter().any(|m| m == "observed-cancel"),
        "handler to observe the cancellation",
    )
    .await;
}

#[tokio::test]
async fn already_cancelled_tokens_reject_immediately() {
    let (client, server) = connected_pair().await;
    server.register_channel("ping", Arc::new(EchoChannel::new()));

    let (source, token) = CancelSource::new();
    source.cancel();

    let result = client
        .get_channel("ping")
        .call_with_token("echo", Value::Absent, token)
        .await;

    assert!(matches!(result, Err(WiremuxError::Cancelled)));
}

#[tokio::test]
async fn cancelling_a_queued_call_never_hits_the_wire() {
    let (near, mut far) = memory::pair();
    let client = Connection::connect(near, Value::Absent).await.unwrap();

    // Swallow the handshake; the peer stays uninitialized on purpose.
    let _ctx = far.recv().await.unwrap().unwrap();
    assert!(matches!(
        recv_message(&mut far).await,
        wiremux_codec::frame::Message::Response(Response::Initialize)
    ));

    let (source, token) = CancelSource::new();
    let proxy = client.get_channel("ping");
    let call =
        tokio::spawn(async move { proxy.call_with_token("echo", Value::Absent, token).await });

    // Still queued: nothing went out, and cancelling settles it locally.
    tokio::time::sleep(Duration::from_millis(20)).await;
    source.cancel();

    let result = call.await.unwrap();
    assert!(matches!(result, Err(WiremuxError::Cancelled)));

    // Late initialization must not flush the dead request.
    send_response(&mut far, Response::Initialize).await;
    expect_silence(&mut far).await;
}

#[tokio::test]
async fn disposed_clients_reject_new_calls() {
    let (client, server) = connected_pair().await;
    server.register_channel("ping", Arc::new(EchoChannel::new()));

    client.dispose();
    client.closed().await;

    let result = client.get_channel("ping").call("echo", Value::Absent).await;

    assert!(matches!(result, Err(WiremuxError::Cancelled)));
}

#[tokio::test]
async fn disposal_cancels_calls_in_flight() {
    let (client, server) = connected_pair().await;
    let handler = Arc::new(EchoChannel::new());
    let log = handler.log.clone();
    server.register_channel("ping", handler);

    let proxy = client.get_channel("ping");
    let call = tokio::spawn(async move { proxy.call("wait_cancel", Value::Absent).await });

    eventually(
        || log.lock().unwrap().iter().any(|m| m == "wait_cancel"),
        "handler to start",
    )
    .await;
    client.dispose();

    let result = call.await.unwrap();
    assert!(matches!(result, Err(WiremuxError::Cancelled)));
}

#[tokio::test]
async fn peer_disconnect_cancels_calls_in_flight() {
    let (client, server) = connected_pair().await;
    let handler = Arc::new(EchoChannel::new());
    let log = handler.log.clone();
    server.register_channel("ping", handler);

    let proxy = client.get_channel("ping");
    let call = tokio::spawn(async move { proxy.call("wait_cancel", Value::Absent).await });

    eventually(
        || log.lock().unwrap().iter().any(|m| m == "wait_cancel"),
        "handler to start",
    )
    .await;
    server.dispose();

    let result = call.await.unwrap();
    assert!(matches!(result, Err(WiremuxError::Cancelled)));

    client.closed().await;
    assert!(client.is_closed());
}

use crate::helper::*;
use std::sync::Arc;
use wiremux::transport::memory;
use wiremux::Transport;
use wiremux::{Connection, Value};
use wiremux_codec::frame::{Message, Request, Response};
use wiremux_codec::value::decode_value;

#[tokio::test]
async fn context_then_initialize_open_the_wire() {
    let (near, mut far) = memory::pair();

    let client = Connection::connect(near, Value::text("ctx-token")).await.unwrap();

    // The very first frame is the bare context value, not a request.
    let mut first = far.recv().await.unwrap().unwrap();
    assert_eq!(decode_value(&mut first).unwrap(), Value::text("ctx-token"));

    // Then the initiator's server half announces readiness.
    assert_eq!(recv_message(&mut far).await, Message::Response(Response::Initialize));

    // Nothing else goes out while the peer stays silent.
    let call = {
        let proxy = client.get_channel("ping");
        tokio::spawn(async move { proxy.call("echo", Value::text("hi")).await })
    };
    expect_silence(&mut far).await;

    // Our Initialize flips the client to idle and flushes the queue.
    send_response(&mut far, Response::Initialize).await;

    match recv_message(&mut far).await {
        Message::Request(Request::Call {
            id,
            channel,
            method,
            arg,
        }) => {
            assert_eq!(channel, "ping");
            assert_eq!(method, "echo");
            assert_eq!(arg, Value::text("hi"));

            send_response(&mut far, Response::CallOk {
                id,
                body: Value::text("hi"),
            })
            .await;
        }
        other => panic!("expected the queued call, got {other:?}"),
    }

    assert_eq!(call.await.unwrap().unwrap(), Value::text("hi"));
}

#[tokio::test]
async fn both_halves_serve_under_the_same_context() {
    let (initiator, acceptor) = connected_pair().await;

    initiator.register_channel("ping", Arc::new(EchoChannel::new()));
    acceptor.register_channel("ping", Arc::new(EchoChannel::new()));

    // The acceptor serves under the context it read from the handshake.
    assert_eq!(
        acceptor.context(),
        &Value::text("test-peer"),
        "peer context should come from the first frame"
    );
    let from_acceptor = initiator.get_channel("ping").call("ctx", Value::Absent).await.unwrap();
    assert_eq!(from_acceptor, Value::text("test-peer"));

    // The initiator serves under the context it sent.
    let from_initiator = acceptor.get_channel("ping").call("ctx", Value::Absent).await.unwrap();
    assert_eq!(from_initiator, Value::text("test-peer"));
}

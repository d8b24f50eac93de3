use crate::helper::*;
use std::sync::Arc;
use std::time::Duration;
use wiremux::{Reviver, ServiceProxy, Value, WiremuxError};

fn uppercase_reviver() -> Reviver {
    Arc::new(|value| match value {
        Value::Text(text) => Value::Text(text.to_uppercase()),
        other => other,
    })
}

#[tokio::test]
async fn commands_pass_through_the_reviver() {
    let (client, server) = connected_pair().await;
    server.register_channel("svc", Arc::new(EchoChannel::new()));

    let service = ServiceProxy::with_reviver(client.get_channel("svc"), uppercase_reviver());

    let revived = service.invoke("echo", Value::text("quiet")).await.unwrap();
    assert_eq!(revived, Value::text("QUIET"));

    // Disabling the reviver is a per-proxy decision.
    let plain = ServiceProxy::with_reviver(client.get_channel("svc"), uppercase_reviver())
        .without_reviver();
    let raw = plain.invoke("echo", Value::text("quiet")).await.unwrap();
    assert_eq!(raw, Value::text("quiet"));
}

#[tokio::test]
async fn event_members_map_to_subscriptions() {
    let (client, server) = connected_pair().await;

    let handler = Arc::new(EventChannel::new());
    let sinks = handler.sinks.clone();
    server.register_channel("svc", handler.clone());

    let service = ServiceProxy::with_reviver(client.get_channel("svc"), uppercase_reviver());

    let on_did_tick = service.event("onDidTick").unwrap();
    let mut stream = on_did_tick.subscribe();

    eventually(|| !sinks.lock().unwrap().is_empty(), "the event subscription").await;
    assert_eq!(sinks.lock().unwrap()[0].0, "onDidTick");

    handler.fire_all(Value::text("tock"));

    assert_eq!(
        stream.receive(Duration::from_secs(2)).await,
        Some(Value::text("TOCK"))
    );
}

#[tokio::test]
async fn dynamic_event_members_carry_their_argument() {
    let (client, server) = connected_pair().await;

    let handler = Arc::new(EventChannel::new());
    let sinks = handler.sinks.clone();
    server.register_channel("svc", handler.clone());

    let service = ServiceProxy::new(client.get_channel("svc"));

    let counter = service
        .dynamic_event("onDynamicCounter", Value::number(5))
        .unwrap();
    let mut stream = counter.subscribe();

    eventually(|| !sinks.lock().unwrap().is_empty(), "the dynamic subscription").await;
    assert_eq!(sinks.lock().unwrap()[0].0, "onDynamicCounter");

    handler.fire_all(Value::number(6));

    assert_eq!(
        stream.receive(Duration::from_secs(2)).await,
        Some(Value::number(6))
    );
}

#[tokio::test]
async fn members_cannot_be_used_against_their_shape() {
    let (client, server) = connected_pair().await;
    server.register_channel("svc", Arc::new(EchoChannel::new()));

    let service = ServiceProxy::new(client.get_channel("svc"));

    assert!(matches!(
        service.invoke("onDidChange", Value::Absent).await,
        Err(WiremuxError::Member(_))
    ));
    assert!(matches!(service.event("echo"), Err(WiremuxError::Member(_))));
    assert!(matches!(
        service.event("onDynamicTick"),
        Err(WiremuxError::Member(_))
    ));
    assert!(matches!(
        service.dynamic_event("onDidChange", Value::Absent),
        Err(WiremuxError::Member(_))
    ));
}

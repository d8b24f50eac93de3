use crate::helper::*;
use std::sync::Arc;
use std::time::Duration;
use wiremux::transport::memory;
use wiremux::{Connection, ConnectionHub, HubEvent, StaticRouter, Value};

/// Connect one peer to the hub; the peer hosts its own channels under
/// the given context.
async fn join(hub: &ConnectionHub, ctx: &str) -> Connection {
    let (near, far) = memory::pair();

    hub.client_connected(far);

    Connection::connect(near, Value::text(ctx)).await.unwrap()
}

async fn wait_for_members(hub: &ConnectionHub, count: usize) {
    for _ in 0..400 {
        if hub.connections().await.len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    panic!("hub never reached {count} connection(s)");
}

#[tokio::test]
async fn channels_reach_present_and_future_connections() {
    let hub = ConnectionHub::start();

    hub.register_channel("early", Arc::new(EchoChannel::new())).await;

    let first = join(&hub, "one").await;
    wait_for_members(&hub, 1).await;

    hub.register_channel("late", Arc::new(EchoChannel::new())).await;

    let second = join(&hub, "two").await;
    wait_for_members(&hub, 2).await;

    for peer in [&first, &second] {
        for channel in ["early", "late"] {
            let reply = peer.get_channel(channel).call("echo", Value::text("hi")).await.unwrap();
            assert_eq!(reply, Value::text("hi"));
        }
    }

    // Each connection serves under its own peer's context.
    assert_eq!(
        first.get_channel("early").call("ctx", Value::Absent).await.unwrap(),
        Value::text("one")
    );
    assert_eq!(
        second.get_channel("early").call("ctx", Value::Absent).await.unwrap(),
        Value::text("two")
    );
}

#[tokio::test]
async fn static_router_outlives_an_empty_hub() {
    let hub = ConnectionHub::start();

    let routed = hub.route_channel("svc", Arc::new(StaticRouter::new(|_connection| async { true })));

    // Issued before any connection exists; must resolve once one shows up.
    let call = tokio::spawn(async move { routed.call("echo", Value::text("eventually")).await });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let peer = join(&hub, "late-joiner").await;
    peer.register_channel("svc", Arc::new(EchoChannel::new()));

    assert_eq!(call.await.unwrap().unwrap(), Value::text("eventually"));
}

#[tokio::test]
async fn filtered_calls_only_reach_matching_connections() {
    let hub = ConnectionHub::start();

    let a = join(&hub, "a").await;
    let b = join(&hub, "b").await;
    a.register_channel("svc", Arc::new(EchoChannel::new()));
    b.register_channel("svc", Arc::new(EchoChannel::new()));
    wait_for_members(&hub, 2).await;

    let to_a = hub.filter_channel("svc", |connection| {
        connection.context() == &Value::text("a")
    });

    // The random pick has exactly one candidate, every time.
    for _ in 0..8 {
        let reply = to_a.call("ctx", Value::Absent).await.unwrap();
        assert_eq!(reply, Value::text("a"));
    }
}

#[tokio::test]
async fn multicast_fans_in_from_every_matching_connection() {
    let hub = ConnectionHub::start();

    let handler_a = Arc::new(EventChannel::new());
    let handler_b = Arc::new(EventChannel::new());
    let a = join(&hub, "a").await;
    let b = join(&hub, "b").await;
    a.register_channel("sys", handler_a.clone());
    b.register_channel("sys", handler_b.clone());
    wait_for_members(&hub, 2).await;

    let multicast = hub.get_channel("sys").listen("tick", Value::Absent);
    let mut stream = multicast.subscribe();

    let sinks_a = handler_a.sinks.clone();
    let sinks_b = handler_b.sinks.clone();
    eventually(|| !sinks_a.lock().unwrap().is_empty(), "the tap on a").await;
    eventually(|| !sinks_b.lock().unwrap().is_empty(), "the tap on b").await;

    for i in 0..3 {
        handler_a.fire_all(Value::text(format!("a{i}")));
        handler_b.fire_all(Value::text(format!("b{i}")));
    }

    let mut from_a = Vec::new();
    let mut from_b = Vec::new();
    for _ in 0..6 {
        match stream.receive(Duration::from_secs(2)).await {
            Some(Value::Text(text)) if text.starts_with('a') => from_a.push(text),
            Some(Value::Text(text)) => from_b.push(text),
            other => panic!("unexpected event {other:?}"),
        }
    }

    // N connections times K events, per-connection order preserved.
    assert_eq!(from_a, vec!["a0", "a1", "a2"]);
    assert_eq!(from_b, vec!["b0", "b1", "b2"]);

    // The last unsubscribe tears every tap down.
    drop(stream);
    eventually(
        || {
            let a_closed = sinks_a.lock().unwrap().iter().all(|(_, s)| s.is_closed());
            let b_closed = sinks_b.lock().unwrap().iter().all(|(_, s)| s.is_closed());
            a_closed && b_closed
        },
        "every tap to close",
    )
    .await;
}

#[tokio::test]
async fn multicast_follows_connections_added_later() {
    let hub = ConnectionHub::start();

    let multicast = hub.get_channel("sys").listen("tick", Value::Absent);
    let mut stream = multicast.subscribe();

    let handler = Arc::new(EventChannel::new());
    let peer = join(&hub, "late").await;
    peer.register_channel("sys", handler.clone());
    wait_for_members(&hub, 1).await;

    let sinks = handler.sinks.clone();
    eventually(|| !sinks.lock().unwrap().is_empty(), "the late tap").await;

    handler.fire_all(Value::text("caught up"));

    assert_eq!(
        stream.receive(Duration::from_secs(2)).await,
        Some(Value::text("caught up"))
    );
}

#[tokio::test]
async fn departures_raise_removed_events() {
    let hub = ConnectionHub::start();
    let mut events = hub.events();

    let peer = join(&hub, "fleeting").await;
    wait_for_members(&hub, 1).await;

    let added = events.recv().await.unwrap();
    let id = match added {
        HubEvent::Added(connection) => connection.id(),
        other => panic!("expected Added, got {other:?}"),
    };

    peer.dispose();

    match events.recv().await.unwrap() {
        HubEvent::Removed(removed) => assert_eq!(removed, id),
        other => panic!("expected Removed, got {other:?}"),
    }

    wait_for_members(&hub, 0).await;
}

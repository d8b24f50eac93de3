//! Event plumbing shared by the two sides.
//!
//! Server handlers produce values into an [`EventSink`]; the connection
//! forwards them to the peer as event frames. Consumers read values from
//! an [`EventStream`], whose drop is what releases the underlying wire
//! subscription, so proxies created but never listened to cost nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremux_codec::Value;

/// Producer half handed to channel handlers.
///
/// `fire` returns false once the subscription is gone; producers are
/// expected to stop at that point.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Value>,
}

/// The lazy sequence a handler's `listen` returns.
pub struct EventSource {
    rx: mpsc::UnboundedReceiver<Value>,
}

pub fn event_channel() -> (EventSink, EventSource) {
    let (tx, rx) = mpsc::unbounded_channel();

    (EventSink { tx }, EventSource { rx })
}

impl EventSink {
    pub fn fire(&self, value: Value) -> bool {
        self.tx.send(value).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EventSource {
    pub(crate) async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// Consumer half of an event subscription.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Value>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl EventStream {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Value>,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> EventStream {
        EventStream {
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Next event payload, or `None` once the subscription ended.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Like `recv`, giving up after `timeout`.
    pub async fn receive(&mut self, timeout: Duration) -> Option<Value> {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            value = self.rx.recv() => value,
            _ = &mut sleep => None,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

/// Local listener bookkeeping behind a lazily subscribed event.
///
/// Tracks which `add` was the first and which `remove` the last, the two
/// edges where the wire subscribe/unsubscribe actually happen.
pub(crate) struct Fanout {
    listeners: Mutex<Vec<(u64, mpsc::UnboundedSender<Value>)>>,
    next_key: AtomicU64,
}

impl Fanout {
    pub(crate) fn new() -> Fanout {
        Fanout {
            listeners: Mutex::new(Vec::new()),
            next_key: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.listeners.lock().unwrap().is_empty()
    }

    pub(crate) fn add(&self) -> (u64, mpsc::UnboundedReceiver<Value>) {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().push((key, tx));

        (key, rx)
    }

    /// Removes one listener; true when it was the last.
    pub(crate) fn remove(&self, key: u64) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|(k, _)| *k != key);

        listeners.is_empty()
    }

    pub(crate) fn emit(&self, value: Value) {
        let listeners = self.listeners.lock().unwrap();
        for (_, tx) in listeners.iter() {
            let _ = tx.send(value.clone());
        }
    }
}

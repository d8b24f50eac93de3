//! Connection selection over a hub.
//!
//! A call needs exactly one connection; an event wants all matching ones.
//! Both strategies here hand back deferred proxies, so callers never
//! await selection explicitly: routing happens inside `call`, and the
//! multicast event builds its fan-in when the first subscriber appears.

use crate::client::RemoteEvent;
use crate::connection::Connection;
use crate::error::WiremuxError;
use crate::event::{EventStream, Fanout};
use crate::hub::{ConnectionHub, HubEvent};
use async_trait::async_trait;
use log::debug;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;
use wiremux_codec::Value;

/// Strategy picking the connection that services a call or an event.
#[async_trait]
pub trait Router: Send + Sync + 'static {
    async fn route_call(
        &self,
        hub: &ConnectionHub,
        command: &str,
        arg: &Value,
    ) -> Result<Connection, WiremuxError>;

    async fn route_event(
        &self,
        hub: &ConnectionHub,
        event: &str,
        arg: &Value,
    ) -> Result<Connection, WiremuxError>;
}

/// Routes to the first connection whose predicate resolves true, waiting
/// for new connections as long as none does.
pub struct StaticRouter<F> {
    predicate: F,
}

impl<F, Fut> StaticRouter<F>
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    pub fn new(predicate: F) -> StaticRouter<F> {
        StaticRouter { predicate }
    }

    async fn select(&self, hub: &ConnectionHub) -> Result<Connection, WiremuxError> {
        // Subscribing before the scan closes the window in which an add
        // could slip through unobserved.
        let mut events = hub.events();

        loop {
            for connection in hub.connections().await {
                if (self.predicate)(connection.clone()).await {
                    return Ok(connection);
                }
            }

            debug!("no connection matched, waiting for the next one");

            loop {
                match events.recv().await {
                    Ok(HubEvent::Added(connection)) => {
                        if (self.predicate)(connection.clone()).await {
                            return Ok(connection);
                        }
                    }
                    Ok(HubEvent::Removed(_)) => (),
                    // Dropped notifications force a rescan.
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(WiremuxError::Cancelled)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<F, Fut> Router for StaticRouter<F>
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    async fn route_call(
        &self,
        hub: &ConnectionHub,
        _command: &str,
        _arg: &Value,
    ) -> Result<Connection, WiremuxError> {
        self.select(hub).await
    }

    async fn route_event(
        &self,
        hub: &ConnectionHub,
        _event: &str,
        _arg: &Value,
    ) -> Result<Connection, WiremuxError> {
        self.select(hub).await
    }
}

/// Synchronous connection predicate for the filter strategy.
pub type ConnectionFilter = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

impl ConnectionHub {
    /// Channel proxy over a router-selected connection.
    pub fn route_channel(&self, name: &str, router: Arc<dyn Router>) -> RoutedChannel {
        RoutedChannel {
            hub: self.clone(),
            router,
            channel: name.to_owned(),
        }
    }

    /// Channel proxy over filter-matched connections: calls pick one
    /// uniformly at random, events fan in from all of them.
    pub fn filter_channel(
        &self,
        name: &str,
        filter: impl Fn(&Connection) -> bool + Send + Sync + 'static,
    ) -> FilteredChannel {
        FilteredChannel {
            hub: self.clone(),
            filter: Arc::new(filter),
            channel: name.to_owned(),
        }
    }

    /// Channel proxy over any connection.
    pub fn get_channel(&self, name: &str) -> FilteredChannel {
        self.filter_channel(name, |_| true)
    }
}

/// Deferred proxy delegating selection to a [`Router`].
pub struct RoutedChannel {
    hub: ConnectionHub,
    router: Arc<dyn Router>,
    channel: String,
}

impl RoutedChannel {
    pub async fn call(&self, method: &str, arg: Value) -> Result<Value, WiremuxError> {
        self.call_with_token(method, arg, crate::cancel::CancelToken::never())
            .await
    }

    pub async fn call_with_token(
        &self,
        method: &str,
        arg: Value,
        cancel: crate::cancel::CancelToken,
    ) -> Result<Value, WiremuxError> {
        let connection = self.router.route_call(&self.hub, method, &arg).await?;

        connection
            .get_channel(&self.channel)
            .call_with_token(method, arg, cancel)
            .await
    }

    pub async fn listen(&self, event: &str, arg: Value) -> Result<RemoteEvent, WiremuxError> {
        let connection = self.router.route_event(&self.hub, event, &arg).await?;

        Ok(connection.get_channel(&self.channel).listen(event, arg))
    }
}

/// Deferred proxy over the synchronous filter strategy.
pub struct FilteredChannel {
    hub: ConnectionHub,
    filter: ConnectionFilter,
    channel: String,
}

impl FilteredChannel {
    pub async fn call(&self, method: &str, arg: Value) -> Result<Value, WiremuxError> {
        self.call_with_token(method, arg, crate::cancel::CancelToken::never())
            .await
    }

    pub async fn call_with_token(
        &self,
        method: &str,
        arg: Value,
        cancel: crate::cancel::CancelToken,
    ) -> Result<Value, WiremuxError> {
        let connection = self.pick().await?;

        connection
            .get_channel(&self.channel)
            .call_with_token(method, arg, cancel)
            .await
    }

    /// Multiplexed event over every matching connection, present and
    /// future. Per-connection order is preserved; ordering across
    /// connections is unspecified.
    pub fn listen(&self, event: &str, arg: Value) -> MulticastEvent {
        MulticastEvent {
            inner: Arc::new(MulticastInner {
                hub: self.hub.clone(),
                filter: self.filter.clone(),
                channel: self.channel.clone(),
                event: event.to_owned(),
                arg,
                fanout: Arc::new(Fanout::new()),
                state: Mutex::new(MulticastState { stop: None }),
            }),
        }
    }

    async fn pick(&self) -> Result<Connection, WiremuxError> {
        let mut events = self.hub.events();

        if let Some(connection) = self.scan().await {
            return Ok(connection);
        }

        loop {
            match events.recv().await {
                Ok(HubEvent::Added(connection)) if (self.filter)(&connection) => {
                    return Ok(connection)
                }
                Ok(_) => (),
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(connection) = self.scan().await {
                        return Ok(connection);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(WiremuxError::Cancelled),
            }
        }
    }

    async fn scan(&self) -> Option<Connection> {
        let mut matching: Vec<Connection> = self
            .hub
            .connections()
            .await
            .into_iter()
            .filter(|connection| (self.filter)(connection))
            .collect();

        if matching.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..matching.len());
        Some(matching.swap_remove(index))
    }
}

/// Fan-in event over a dynamic set of connections. Wire subscriptions
/// exist only while at least one local subscriber does.
pub struct MulticastEvent {
    inner: Arc<MulticastInner>,
}

struct MulticastInner {
    hub: ConnectionHub,
    filter: ConnectionFilter,
    channel: String,
    event: String,
    arg: Value,
    fanout: Arc<Fanout>,
    state: Mutex<MulticastState>,
}

struct MulticastState {
    stop: Option<oneshot::Sender<()>>,
}

impl MulticastEvent {
    pub fn subscribe(&self) -> EventStream {
        let mut state = self.inner.state.lock().unwrap();
        let first = self.inner.fanout.is_empty();
        let (key, rx) = self.inner.fanout.add();

        if first {
            let (stop_tx, stop_rx) = oneshot::channel();
            state.stop = Some(stop_tx);
            tokio::spawn(multiplex_loop(self.inner.clone(), stop_rx));
        }

        let inner = self.inner.clone();
        EventStream::new(rx, move || {
            let mut state = inner.state.lock().unwrap();
            if inner.fanout.remove(key) {
                // Dropping the stop side ends the fan-in loop, which
                // unsubscribes from every connection on its way out.
                state.stop.take();
            }
        })
    }
}

async fn multiplex_loop(inner: Arc<MulticastInner>, mut stop: oneshot::Receiver<()>) {
    let mut events = inner.hub.events();
    let (agg_tx, mut agg_rx) = mpsc::unbounded_channel::<Value>();
    let mut taps = HashMap::<Uuid, JoinHandle<()>>::new();

    for connection in inner.hub.connections().await {
        if (inner.filter)(&connection) {
            add_tap(&inner, &agg_tx, &mut taps, connection);
        }
    }

    loop {
        tokio::select! {
            value = agg_rx.recv() => match value {
                Some(value) => inner.fanout.emit(value),
                None => break,
            },
            event = events.recv() => match event {
                Ok(HubEvent::Added(connection)) if (inner.filter)(&connection) => {
                    add_tap(&inner, &agg_tx, &mut taps, connection);
                }
                Ok(HubEvent::Removed(id)) => {
                    if let Some(tap) = taps.remove(&id) {
                        tap.abort();
                    }
                }
                Ok(_) => (),
                Err(broadcast::error::RecvError::Lagged(_)) => (),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut stop => break,
        }
    }

    // Aborting a tap drops its stream, which sends the wire unsubscribe.
    for (_, tap) in taps {
        tap.abort();
    }
}

fn add_tap(
    inner: &Arc<MulticastInner>,
    agg_tx: &mpsc::UnboundedSender<Value>,
    taps: &mut HashMap<Uuid, JoinHandle<()>>,
    connection: Connection,
) {
    debug!(
        "multicast {}/{} tapping connection {}",
        inner.channel,
        inner.event,
        connection.id()
    );

    let remote = connection
        .get_channel(&inner.channel)
        .listen(&inner.event, inner.arg.clone());
    let mut stream = remote.subscribe();
    let agg = agg_tx.clone();

    taps.insert(
        connection.id(),
        tokio::spawn(async move {
            while let Some(value) = stream.recv().await {
                if agg.send(value).is_err() {
                    break;
                }
            }
        }),
    );
}

//! The server half of a connection.
//!
//! Demultiplexes incoming requests onto registered channel handlers,
//! tracks every in-flight request so it can be cancelled or torn down,
//! and parks requests for channels that are not registered yet.

use crate::cancel::{CancelSource, CancelToken};
use crate::connection::Command;
use crate::error::{ErrorObject, UNKNOWN_CHANNEL};
use crate::event::EventSource;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wiremux_codec::{RemoteError, Request, RequestId, Response, Value};

/// A named channel hosted by this side of a connection.
///
/// `ctx` is the context token the peer supplied during the handshake.
/// `call` may suspend for as long as it likes; the connection keeps
/// dispatching other frames in the meantime. `listen` must return its
/// source without blocking; production happens through the sink.
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    async fn call(
        &self,
        ctx: &Value,
        method: &str,
        arg: Value,
        cancel: CancelToken,
    ) -> anyhow::Result<Value>;

    fn listen(&self, ctx: &Value, event: &str, arg: Value) -> anyhow::Result<EventSource>;
}

pub(crate) enum ServerCmd {
    Register {
        name: String,
        handler: Arc<dyn ChannelHandler>,
    },
    FlushPending {
        name: String,
    },
    Completed {
        id: RequestId,
    },
    Expired {
        name: String,
        id: RequestId,
    },
}

enum ActiveRequest {
    Call(CancelSource),
    Subscription(JoinHandle<()>),
}

struct DeferredRequest {
    request: Request,
    timer: JoinHandle<()>,
}

pub(crate) struct ServerState {
    ctx: Value,
    channels: HashMap<String, Arc<dyn ChannelHandler>>,
    active: HashMap<RequestId, ActiveRequest>,
    pending: HashMap<String, Vec<DeferredRequest>>,
    out: mpsc::UnboundedSender<Bytes>,
    commands: mpsc::UnboundedSender<Command>,
    flush_timeout: Duration,
}

impl ServerState {
    pub(crate) fn new(
        ctx: Value,
        out: mpsc::UnboundedSender<Bytes>,
        commands: mpsc::UnboundedSender<Command>,
        flush_timeout: Duration,
    ) -> ServerState {
        ServerState {
            ctx,
            channels: HashMap::new(),
            active: HashMap::new(),
            pending: HashMap::new(),
            out,
            commands,
            flush_timeout,
        }
    }

    /// Announce readiness; the peer's client half queues its traffic
    /// until this frame arrives.
    pub(crate) fn send_initialize(&self) {
        self.respond(Response::Initialize);
    }

    pub(crate) fn handle_command(&mut self, command: ServerCmd) {
        match command {
            ServerCmd::Register { name, handler } => {
                // The old handler, if any, is silently replaced. The flush
                // happens on the next dispatcher turn so the caller's own
                // wiring finishes first.
                self.channels.insert(name.clone(), handler);
                let _ = self
                    .commands
                    .send(Command::Server(ServerCmd::FlushPending { name }));
            }
            ServerCmd::FlushPending { name } => {
                if let Some(rows) = self.pending.remove(&name) {
                    debug!("flushing {} deferred request(s) for {}", rows.len(), name);

                    for row in rows {
                        row.timer.abort();
                        self.handle_request(row.request);
                    }
                }
            }
            ServerCmd::Completed { id } => {
                self.active.remove(&id);
            }
            ServerCmd::Expired { name, id } => self.expire(&name, id),
        }
    }

    pub(crate) fn handle_request(&mut self, request: Request) {
        trace!("request {request:?}");

        match request {
            Request::Call {
                id,
                channel,
                method,
                arg,
            } => match self.channels.get(&channel).cloned() {
                Some(handler) => self.invoke_call(id, handler, method, arg),
                None => self.defer(
                    channel.clone(),
                    Request::Call {
                        id,
                        channel,
                        method,
                        arg,
                    },
                ),
            },
            Request::Subscribe {
                id,
                channel,
                event,
                arg,
            } => match self.channels.get(&channel).cloned() {
                Some(handler) => self.invoke_subscribe(id, handler, &channel, event, arg),
                None => self.defer(
                    channel.clone(),
                    Request::Subscribe {
                        id,
                        channel,
                        event,
                        arg,
                    },
                ),
            },
            // Unknown ids are silently ignored: the handler may have
            // responded already, and the two frames race by design.
            Request::Cancel { id } => match self.active.remove(&id) {
                Some(ActiveRequest::Call(source)) => source.cancel(),
                Some(_) => (),
                None => self.discard_deferred(id),
            },
            Request::Unsubscribe { id } => match self.active.remove(&id) {
                Some(ActiveRequest::Subscription(forward)) => forward.abort(),
                Some(_) => (),
                None => self.discard_deferred(id),
            },
        }
    }

    fn invoke_call(
        &mut self,
        id: RequestId,
        handler: Arc<dyn ChannelHandler>,
        method: String,
        arg: Value,
    ) {
        let (source, token) = CancelSource::new();
        self.active.insert(id, ActiveRequest::Call(source));

        let ctx = self.ctx.clone();
        let out = self.out.clone();
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let response = match handler.call(&ctx, &method, arg, token).await {
                Ok(body) => Response::CallOk { id, body },
                Err(e) => error_response(id, e),
            };

            let _ = out.send(response.to_bytes().freeze());
            let _ = commands.send(Command::Server(ServerCmd::Completed { id }));
        });
    }

    fn invoke_subscribe(
        &mut self,
        id: RequestId,
        handler: Arc<dyn ChannelHandler>,
        channel: &str,
        event: String,
        arg: Value,
    ) {
        match handler.listen(&self.ctx, &event, arg) {
            Ok(mut source) => {
                let out = self.out.clone();
                let forward = tokio::spawn(async move {
                    while let Some(body) = source.recv().await {
                        if out.send(Response::EventFire { id, body }.to_bytes().freeze()).is_err() {
                            break;
                        }
                    }
                });

                self.active.insert(id, ActiveRequest::Subscription(forward));
            }
            // A subscription has no error lane on the wire; the failure
            // stays on this side.
            Err(e) => warn!("listen on {channel}/{event} failed: {e:#}"),
        }
    }

    fn defer(&mut self, name: String, request: Request) {
        let id = request.id();

        debug!("channel {name} not registered yet, deferring request {id}");

        let commands = self.commands.clone();
        let timeout = self.flush_timeout;
        let timer_name = name.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = commands.send(Command::Server(ServerCmd::Expired {
                name: timer_name,
                id,
            }));
        });

        self.pending
            .entry(name)
            .or_default()
            .push(DeferredRequest { request, timer });
    }

    /// A cancel or unsubscribe can land while its request is still parked
    /// for an unregistered channel. The row has to go with it, or a late
    /// registration would replay a request the caller already abandoned.
    fn discard_deferred(&mut self, id: RequestId) {
        for (name, rows) in self.pending.iter_mut() {
            if let Some(position) = rows.iter().position(|row| row.request.id() == id) {
                trace!("discarding deferred request {id} for {name}");

                let row = rows.remove(position);
                row.timer.abort();
                break;
            }
        }

        self.pending.retain(|_, rows| !rows.is_empty());
    }

    fn expire(&mut self, name: &str, id: RequestId) {
        let Some(rows) = self.pending.get_mut(name) else {
            return;
        };
        let Some(position) = rows.iter().position(|row| row.request.id() == id) else {
            return;
        };

        let row = rows.remove(position);
        if rows.is_empty() {
            self.pending.remove(name);
        }

        match row.request {
            Request::Call { id, .. } => {
                warn!("no channel {name} registered within the timeout, failing call {id}");

                self.respond(Response::CallErr {
                    id,
                    err: RemoteError::new(
                        UNKNOWN_CHANNEL,
                        format!("channel {name} is not registered"),
                    ),
                });
            }
            // Subscriptions expire silently; the peer may subscribe again.
            other => trace!("dropping stale subscription {}", other.id()),
        }
    }

    pub(crate) fn dispose(&mut self) {
        for (_, active) in self.active.drain() {
            match active {
                ActiveRequest::Call(source) => source.cancel(),
                ActiveRequest::Subscription(forward) => forward.abort(),
            }
        }

        for (_, rows) in self.pending.drain() {
            for row in rows {
                row.timer.abort();
            }
        }
    }

    fn respond(&self, response: Response) {
        trace!("local response {response:?}");

        let _ = self.out.send(response.to_bytes().freeze());
    }
}

/// Map a handler failure onto the two wire error shapes: an
/// [`ErrorObject`] travels verbatim, anything else becomes the
/// `{message, name, stack}` shape with the stack split per line.
fn error_response(id: RequestId, e: anyhow::Error) -> Response {
    match e.downcast::<ErrorObject>() {
        Ok(payload) => Response::CallErrObj { id, body: payload.0 },
        Err(e) => {
            let err = match e.downcast::<RemoteError>() {
                Ok(remote) => remote.normalized(),
                Err(e) => RemoteError::new("Error", format!("{e:#}")),
            };

            Response::CallErr { id, err }
        }
    }
}

//! The client half of a connection.
//!
//! Issues requests, correlates responses by id, and manages event
//! subscription lifecycles. The half is born uninitialized and queues
//! outgoing traffic until the peer's Initialize frame arrives.

use crate::cancel::CancelToken;
use crate::connection::Command;
use crate::error::WiremuxError;
use crate::event::{EventStream, Fanout};
use bytes::Bytes;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use wiremux_codec::{Request, RequestId, Response, Value};

pub(crate) enum ClientCmd {
    Call {
        id: RequestId,
        channel: String,
        method: String,
        arg: Value,
        reply: oneshot::Sender<Result<Value, WiremuxError>>,
    },
    CancelCall {
        id: RequestId,
    },
    Subscribe {
        id: RequestId,
        channel: String,
        event: String,
        arg: Value,
        sink: mpsc::UnboundedSender<Value>,
    },
    Unsubscribe {
        id: RequestId,
    },
}

enum PendingHandler {
    Call(oneshot::Sender<Result<Value, WiremuxError>>),
    Event(mpsc::UnboundedSender<Value>),
}

struct QueuedRequest {
    id: RequestId,
    frame: Bytes,
}

enum Phase {
    Uninitialized,
    Idle,
}

pub(crate) struct ClientState {
    phase: Phase,
    pending: HashMap<RequestId, PendingHandler>,
    /// Requests issued before the peer announced readiness, in order.
    queued: Vec<QueuedRequest>,
    out: mpsc::UnboundedSender<Bytes>,
    disposed: Arc<AtomicBool>,
}

impl ClientState {
    pub(crate) fn new(out: mpsc::UnboundedSender<Bytes>, disposed: Arc<AtomicBool>) -> ClientState {
        ClientState {
            phase: Phase::Uninitialized,
            pending: HashMap::new(),
            queued: Vec::new(),
            out,
            disposed,
        }
    }

    pub(crate) fn handle_response(&mut self, response: Response) {
        trace!("peer response {response:?}");

        match response {
            Response::Initialize => {
                if matches!(self.phase, Phase::Uninitialized) {
                    debug!("peer initialized, flushing {} queued request(s)", self.queued.len());

                    self.phase = Phase::Idle;
                    for queued in std::mem::take(&mut self.queued) {
                        // Rows cancelled while queued are gone already and
                        // must not hit the wire.
                        if self.pending.contains_key(&queued.id) {
                            let _ = self.out.send(queued.frame);
                        }
                    }
                }
            }
            Response::CallOk { id, body } => self.settle(id, Ok(body)),
            Response::CallErr { id, err } => self.settle(id, Err(WiremuxError::Remote(err))),
            Response::CallErrObj { id, body } => {
                self.settle(id, Err(WiremuxError::RemoteObject(body)))
            }
            Response::EventFire { id, body } => match self.pending.get(&id) {
                Some(PendingHandler::Event(sink)) => {
                    let _ = sink.send(body);
                }
                // Residual fires race the unsubscribe and are dropped.
                Some(PendingHandler::Call(_)) => warn!("event frame for call id {id}"),
                None => trace!("dropping event frame for unknown id {id}"),
            },
        }
    }

    fn settle(&mut self, id: RequestId, result: Result<Value, WiremuxError>) {
        match self.pending.remove(&id) {
            Some(PendingHandler::Call(reply)) => {
                let _ = reply.send(result);
            }
            Some(PendingHandler::Event(_)) => warn!("call response for event id {id}"),
            None => trace!("dropping response for settled id {id}"),
        }
    }

    pub(crate) fn handle_command(&mut self, command: ClientCmd) {
        match command {
            ClientCmd::Call {
                id,
                channel,
                method,
                arg,
                reply,
            } => {
                self.pending.insert(id, PendingHandler::Call(reply));
                self.dispatch_or_queue(
                    id,
                    Request::Call {
                        id,
                        channel,
                        method,
                        arg,
                    }
                    .to_bytes()
                    .freeze(),
                );
            }
            ClientCmd::CancelCall { id } => {
                let was_queued = self.unqueue(id);
                if let Some(PendingHandler::Call(reply)) = self.pending.remove(&id) {
                    let _ = reply.send(Err(WiremuxError::Cancelled));

                    // Only requests that reached the wire need the peer
                    // told; a queued one simply never goes out.
                    if !was_queued {
                        let _ = self.out.send(Request::Cancel { id }.to_bytes().freeze());
                    }
                }
            }
            ClientCmd::Subscribe {
                id,
                channel,
                event,
                arg,
                sink,
            } => {
                self.pending.insert(id, PendingHandler::Event(sink));
                self.dispatch_or_queue(
                    id,
                    Request::Subscribe {
                        id,
                        channel,
                        event,
                        arg,
                    }
                    .to_bytes()
                    .freeze(),
                );
            }
            ClientCmd::Unsubscribe { id } => {
                let was_queued = self.unqueue(id);
                if self.pending.remove(&id).is_some() && !was_queued {
                    let _ = self.out.send(Request::Unsubscribe { id }.to_bytes().freeze());
                }
            }
        }
    }

    fn dispatch_or_queue(&mut self, id: RequestId, frame: Bytes) {
        match self.phase {
            Phase::Idle => {
                let _ = self.out.send(frame);
            }
            Phase::Uninitialized => self.queued.push(QueuedRequest { id, frame }),
        }
    }

    fn unqueue(&mut self, id: RequestId) -> bool {
        match self.queued.iter().position(|queued| queued.id == id) {
            Some(position) => {
                self.queued.remove(position);
                true
            }
            None => false,
        }
    }

    /// Invariant on disconnect: every pending handler settles as
    /// cancelled, every event stream ends.
    pub(crate) fn dispose(&mut self) {
        self.disposed.store(true, Ordering::SeqCst);

        for (_, row) in self.pending.drain() {
            if let PendingHandler::Call(reply) = row {
                let _ = reply.send(Err(WiremuxError::Cancelled));
            }
        }

        self.queued.clear();
    }
}

/// Shared by every proxy of one connection: the command lane into the
/// dispatch loop plus the id counter the ids' uniqueness rests on.
#[derive(Clone)]
pub(crate) struct ClientHandle {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU32>,
    disposed: Arc<AtomicBool>,
}

impl ClientHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        disposed: Arc<AtomicBool>,
    ) -> ClientHandle {
        ClientHandle {
            commands,
            next_id: Arc::new(AtomicU32::new(0)),
            disposed,
        }
    }

    fn alloc_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Caller-facing face of one named channel on the peer.
#[derive(Clone)]
pub struct ChannelProxy {
    channel: String,
    handle: ClientHandle,
}

impl ChannelProxy {
    pub(crate) fn new(channel: String, handle: ClientHandle) -> ChannelProxy {
        ChannelProxy { channel, handle }
    }

    pub fn name(&self) -> &str {
        &self.channel
    }

    /// Invoke a command and wait for its result.
    pub async fn call(&self, method: &str, arg: Value) -> Result<Value, WiremuxError> {
        self.call_with_token(method, arg, CancelToken::never()).await
    }

    /// Invoke a command under a cancellation token. The returned future
    /// settles as `Cancelled` as soon as the token fires; the wire cancel
    /// goes out asynchronously and the handler may complete regardless.
    pub async fn call_with_token(
        &self,
        method: &str,
        arg: Value,
        cancel: CancelToken,
    ) -> Result<Value, WiremuxError> {
        if self.handle.is_disposed() || cancel.is_cancelled() {
            return Err(WiremuxError::Cancelled);
        }

        let id = self.handle.alloc_id();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = Command::Client(ClientCmd::Call {
            id,
            channel: self.channel.clone(),
            method: method.to_owned(),
            arg,
            reply: reply_tx,
        });
        if self.handle.commands.send(command).is_err() {
            return Err(WiremuxError::Cancelled);
        }

        tokio::select! {
            result = reply_rx => result.unwrap_or(Err(WiremuxError::Cancelled)),
            _ = cancel.cancelled() => {
                let _ = self
                    .handle
                    .commands
                    .send(Command::Client(ClientCmd::CancelCall { id }));

                Err(WiremuxError::Cancelled)
            }
        }
    }

    /// Lazy handle on a named event. Nothing touches the wire until the
    /// first [`RemoteEvent::subscribe`].
    pub fn listen(&self, event: &str, arg: Value) -> RemoteEvent {
        RemoteEvent {
            inner: Arc::new(EventInner {
                handle: self.handle.clone(),
                channel: self.channel.clone(),
                event: event.to_owned(),
                arg,
                fanout: Arc::new(Fanout::new()),
                state: Mutex::new(ListenState {
                    wire_id: None,
                    pump: None,
                }),
            }),
        }
    }
}

/// A remote event with local listener multiplexing: the wire subscribe
/// goes out when the first local subscriber appears, the unsubscribe when
/// the last one drops, however many were added in between.
pub struct RemoteEvent {
    inner: Arc<EventInner>,
}

struct EventInner {
    handle: ClientHandle,
    channel: String,
    event: String,
    arg: Value,
    fanout: Arc<Fanout>,
    state: Mutex<ListenState>,
}

struct ListenState {
    wire_id: Option<RequestId>,
    pump: Option<JoinHandle<()>>,
}

impl RemoteEvent {
    pub fn subscribe(&self) -> EventStream {
        let mut state = self.inner.state.lock().unwrap();
        let first = self.inner.fanout.is_empty();
        let (key, rx) = self.inner.fanout.add();

        if first {
            let id = self.inner.handle.alloc_id();
            state.wire_id = Some(id);

            let (sink, mut pump_rx) = mpsc::unbounded_channel();
            let fanout = self.inner.fanout.clone();
            state.pump = Some(tokio::spawn(async move {
                while let Some(value) = pump_rx.recv().await {
                    fanout.emit(value);
                }
            }));

            let _ = self
                .inner
                .handle
                .commands
                .send(Command::Client(ClientCmd::Subscribe {
                    id,
                    channel: self.inner.channel.clone(),
                    event: self.inner.event.clone(),
                    arg: self.inner.arg.clone(),
                    sink,
                }));
        }

        let inner = self.inner.clone();
        EventStream::new(rx, move || {
            let mut state = inner.state.lock().unwrap();
            if inner.fanout.remove(key) {
                if let Some(id) = state.wire_id.take() {
                    let _ = inner
                        .handle
                        .commands
                        .send(Command::Client(ClientCmd::Unsubscribe { id }));
                }
                if let Some(pump) = state.pump.take() {
                    pump.abort();
                }
            }
        })
    }
}

//! One endpoint: a server half and a client half coupled over a single
//! transport.
//!
//! Every connection runs two tasks. The io task owns the transport and
//! shovels frames both ways; the dispatch task owns both halves' state
//! and is the single serializing executor the concurrency model requires.
//! Frames route by their first header integer: request types to the
//! server half, response types to the client half.

use crate::client::{ChannelProxy, ClientCmd, ClientHandle, ClientState};
use crate::error::WiremuxError;
use crate::server::{ChannelHandler, ServerCmd, ServerState};
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use log::{debug, error, trace};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;
use wiremux_codec::value::{decode_value_bounded, encode_value};
use wiremux_codec::{frame, Message, Value};

/// Tunables of one endpoint.
#[derive(Debug, Clone)]
pub struct Options {
    /// How long a request for an unregistered channel is held before it
    /// fails with `Unknown channel`. Default: 1 second.
    pub flush_timeout: Duration,
    /// Upper bound for one decoded value; larger frames are a fatal
    /// framing error. Default: 16 MiB.
    pub frame_ceiling: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            flush_timeout: Duration::from_millis(1000),
            frame_ceiling: wiremux_codec::DEFAULT_FRAME_CEILING,
        }
    }
}

pub(crate) enum Command {
    Server(ServerCmd),
    Client(ClientCmd),
    Shutdown,
}

/// A live endpoint. Cheap to clone; all clones address the same
/// connection.
#[derive(Clone)]
pub struct Connection {
    id: Uuid,
    ctx: Value,
    commands: mpsc::UnboundedSender<Command>,
    client: ClientHandle,
    closed: watch::Receiver<bool>,
}

impl Connection {
    /// Open the initiating side: the context goes out as the first frame,
    /// and this side serves under that same token.
    pub async fn connect<T: Transport>(transport: T, ctx: Value) -> Result<Connection, WiremuxError> {
        Connection::connect_with(transport, ctx, Options::default()).await
    }

    pub async fn connect_with<T: Transport>(
        mut transport: T,
        ctx: Value,
        options: Options,
    ) -> Result<Connection, WiremuxError> {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &ctx);
        transport.send(buf.freeze()).await?;

        Ok(spawn(Box::new(transport), ctx, options))
    }

    /// Open the accepting side: the first frame is the peer's context.
    pub async fn accept<T: Transport>(transport: T) -> Result<Connection, WiremuxError> {
        Connection::accept_with(transport, Options::default()).await
    }

    pub async fn accept_with<T: Transport>(
        mut transport: T,
        options: Options,
    ) -> Result<Connection, WiremuxError> {
        let mut first = match transport.recv().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(WiremuxError::Transport(e)),
            None => {
                return Err(WiremuxError::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer disconnected before the handshake",
                )))
            }
        };
        let ctx = decode_value_bounded(&mut first, options.frame_ceiling)?;

        Ok(spawn(Box::new(transport), ctx, options))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The handshake context every server-side invocation receives.
    pub fn context(&self) -> &Value {
        &self.ctx
    }

    /// Host a channel on this connection. A second registration under the
    /// same name silently replaces the first; requests parked for the
    /// name are delivered on the next dispatcher turn.
    pub fn register_channel(&self, name: &str, handler: Arc<dyn ChannelHandler>) {
        let _ = self.commands.send(Command::Server(ServerCmd::Register {
            name: name.to_owned(),
            handler,
        }));
    }

    /// Face of a channel hosted by the peer.
    pub fn get_channel(&self, name: &str) -> ChannelProxy {
        ChannelProxy::new(name.to_owned(), self.client.clone())
    }

    /// Tear the endpoint down: in-flight calls settle as cancelled,
    /// active peer requests are disposed, the transport disconnects.
    pub fn dispose(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the endpoint is gone, whether by disposal or by
    /// transport disconnect.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection {{ id: {}, ctx: {:?} }}", self.id, self.ctx)
    }
}

fn spawn(transport: Box<dyn Transport>, ctx: Value, options: Options) -> Connection {
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Bytes>();
    let (frame_tx, frame_rx) = mpsc::channel::<BytesMut>(16);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (closed_tx, closed_rx) = watch::channel(false);

    let disposed = Arc::new(AtomicBool::new(false));
    let server = ServerState::new(ctx.clone(), out_tx.clone(), cmd_tx.clone(), options.flush_timeout);
    let client = ClientState::new(out_tx, disposed.clone());

    tokio::spawn(io_loop(transport, out_rx, frame_tx, closed_rx.clone()));
    tokio::spawn(async move {
        dispatch_loop(server, client, frame_rx, cmd_rx, options.frame_ceiling).await;
        let _ = closed_tx.send(true);
    });

    Connection {
        id: Uuid::new_v4(),
        ctx,
        commands: cmd_tx.clone(),
        client: ClientHandle::new(cmd_tx, disposed),
        closed: closed_rx,
    }
}

/// Owns the transport: writes queued outgoing frames, forwards incoming
/// ones. Ends when either direction does, taking the dispatch loop with
/// it through the closed channels.
async fn io_loop(
    mut transport: Box<dyn Transport>,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    frames: mpsc::Sender<BytesMut>,
    mut closed: watch::Receiver<bool>,
) {
    enum Action {
        Send(Bytes),
        Deliver(std::io::Result<BytesMut>),
        Stop,
    }

    loop {
        // The select only decides what to do; the transport itself is
        // touched afterwards, once the receive future is gone.
        let action = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Action::Stop,
            out = outgoing.recv() => match out {
                Some(frame) => Action::Send(frame),
                None => Action::Stop,
            },
            incoming = transport.recv() => match incoming {
                Some(result) => Action::Deliver(result),
                None => Action::Stop,
            },
        };

        match action {
            Action::Send(frame) => {
                if let Err(e) = transport.send(frame).await {
                    // Soft drop: disconnect handling settles whatever was
                    // waiting on this frame.
                    error!("transport send failed: {e}");
                    break;
                }
            }
            Action::Deliver(Ok(frame)) => {
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
            Action::Deliver(Err(e)) => {
                error!("transport receive failed: {e}");
                break;
            }
            Action::Stop => break,
        }
    }

    transport.disconnect().await;
}

/// The per-transport serializing executor. Everything that mutates the
/// two halves' maps runs here, one message at a time.
async fn dispatch_loop(
    mut server: ServerState,
    mut client: ClientState,
    mut frames: mpsc::Receiver<BytesMut>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    frame_ceiling: usize,
) {
    server.send_initialize();

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(mut raw) => {
                    if !dispatch_frame(&mut server, &mut client, &mut raw, frame_ceiling) {
                        break;
                    }
                }
                None => {
                    debug!("transport disconnected");
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Server(command)) => server.handle_command(command),
                Some(Command::Client(command)) => client.handle_command(command),
                Some(Command::Shutdown) | None => {
                    debug!("endpoint disposed");
                    break;
                }
            },
        }
    }

    server.dispose();
    client.dispose();
}

fn dispatch_frame(
    server: &mut ServerState,
    client: &mut ClientState,
    raw: &mut BytesMut,
    ceiling: usize,
) -> bool {
    match frame::decode_message_bounded(raw, ceiling) {
        Ok(Message::Request(request)) => {
            trace!("remote request");
            server.handle_request(request);
            true
        }
        Ok(Message::Response(response)) => {
            trace!("remote response");
            client.handle_response(response);
            true
        }
        // The transport delimits frames, so one bad payload cannot desync
        // the next; a frame that fails to decode still means the two
        // sides disagree about the protocol, and every decode error tears
        // the connection down.
        Err(e) => {
            error!("fatal framing error: {e}");
            false
        }
    }
}

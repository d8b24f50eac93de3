use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremux::transport::memory::{self, MemoryTransport};
use wiremux::Transport;
use wiremux::{
    event_channel, CancelToken, ChannelHandler, Connection, ErrorObject, EventSink, EventSource,
    Options, RemoteError, Value,
};
use wiremux_codec::frame::{decode_message, Message, Request, Response};

/// Two coupled endpoints over an in-memory transport pair. The first one
/// initiated the handshake with the context `"test-peer"`.
pub async fn connected_pair() -> (Connection, Connection) {
    connected_pair_with(Options::default()).await
}

pub async fn connected_pair_with(accept_options: Options) -> (Connection, Connection) {
    let (near, far) = memory::pair();

    let initiator = Connection::connect(near, Value::text("test-peer"))
        .await
        .expect("connect");
    let acceptor = Connection::accept_with(far, accept_options).await.expect("accept");

    (initiator, acceptor)
}

/// Spin until `predicate` holds; panics after a couple of seconds.
pub async fn eventually(predicate: impl Fn() -> bool, what: &str) {
    for _ in 0..400 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    panic!("timed out waiting for {what}");
}

/// Command-handling channel used throughout the suite.
///
/// Methods: `echo` returns the argument, `ctx` the handshake context,
/// `fail` a shaped error with a three line stack, `fail_raw` a raw error
/// payload, `wait_cancel` blocks until the token fires, `slow` answers
/// after a short delay.
pub struct EchoChannel {
    pub log: Arc<Mutex<Vec<String>>>,
}

impl EchoChannel {
    pub fn new() -> EchoChannel {
        EchoChannel {
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl ChannelHandler for EchoChannel {
    async fn call(
        &self,
        ctx: &Value,
        method: &str,
        arg: Value,
        cancel: CancelToken,
    ) -> anyhow::Result<Value> {
        self.log.lock().unwrap().push(method.to_owned());

        match method {
            "echo" => Ok(arg),
            "ctx" => Ok(ctx.clone()),
            "fail" => Err(anyhow::Error::new(
                RemoteError::new("Error", "bad").with_stack("line1\nline2\nline3"),
            )),
            "fail_raw" => Err(anyhow::Error::new(ErrorObject(Value::Structured(
                serde_json::json!({ "code": 42 }),
            )))),
            "wait_cancel" => {
                cancel.cancelled().await;
                self.log.lock().unwrap().push("observed-cancel".to_owned());

                Ok(Value::text("finished anyway"))
            }
            "slow" => {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(arg)
            }
            other => Err(anyhow::anyhow!("unknown method {other}")),
        }
    }

    fn listen(&self, _ctx: &Value, event: &str, _arg: Value) -> anyhow::Result<EventSource> {
        Err(anyhow::anyhow!("unknown event {event}"))
    }
}

/// Event-producing channel; the test keeps the sinks and fires values
/// whenever it wants to.
pub struct EventChannel {
    pub sinks: Arc<Mutex<Vec<(String, EventSink)>>>,
}

impl EventChannel {
    pub fn new() -> EventChannel {
        EventChannel {
            sinks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn fire_all(&self, value: Value) {
        for (_, sink) in self.sinks.lock().unwrap().iter() {
            sink.fire(value.clone());
        }
    }
}

#[async_trait]
impl ChannelHandler for EventChannel {
    async fn call(
        &self,
        _ctx: &Value,
        method: &str,
        _arg: Value,
        _cancel: CancelToken,
    ) -> anyhow::Result<Value> {
        Err(anyhow::anyhow!("unknown method {method}"))
    }

    fn listen(&self, _ctx: &Value, event: &str, _arg: Value) -> anyhow::Result<EventSource> {
        let (sink, source) = event_channel();
        self.sinks.lock().unwrap().push((event.to_owned(), sink));

        Ok(source)
    }
}

/// Read and decode the next frame from a raw transport end.
pub async fn recv_message(transport: &mut MemoryTransport) -> Message {
    let mut frame = transport
        .recv()
        .await
        .expect("transport open")
        .expect("frame readable");

    decode_message(&mut frame).expect("frame decodes")
}

pub async fn send_request(transport: &mut MemoryTransport, request: Request) {
    transport
        .send(request.to_bytes().freeze())
        .await
        .expect("send request");
}

pub async fn send_response(transport: &mut MemoryTransport, response: Response) {
    transport
        .send(response.to_bytes().freeze())
        .await
        .expect("send response");
}

/// Assert that nothing arrives on a raw end for a little while.
pub async fn expect_silence(transport: &mut MemoryTransport) {
    let quiet = tokio::time::timeout(Duration::from_millis(50), transport.recv()).await;

    assert!(quiet.is_err(), "unexpected frame: {quiet:?}");
}

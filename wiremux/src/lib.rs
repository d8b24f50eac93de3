//! Bidirectional RPC and event-subscription multiplexing over message
//! transports.
//!
//! A single transport carries any number of named channels. Either side
//! hosts channels with [`Connection::register_channel`] and invokes the
//! peer's through [`ChannelProxy`]; a [`ConnectionHub`] aggregates many
//! peers and routes calls or fans events in across them.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use wiremux::{transport, ChannelHandler, Connection, Value};
//!
//! async fn endpoints(handler: Arc<dyn ChannelHandler>) -> anyhow::Result<()> {
//!     let (near, far) = transport::memory::pair();
//!
//!     let server = Connection::accept(far);
//!     let client = Connection::connect(near, Value::text("window-1")).await?;
//!     let server = server.await?;
//!
//!     server.register_channel("files", handler);
//!
//!     let files = client.get_channel("files");
//!     let listing = files.call("readdir", Value::text("/tmp")).await?;
//!     println!("{listing:?}");
//!
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod connection;
pub mod error;
pub mod event;
pub mod hub;
pub mod proxy;
pub mod router;
pub mod server;
pub mod transport;

pub use cancel::{CancelSource, CancelToken};
pub use client::{ChannelProxy, RemoteEvent};
pub use connection::{Connection, Options};
pub use error::{ErrorObject, WiremuxError, UNKNOWN_CHANNEL};
pub use event::{event_channel, EventSink, EventSource, EventStream};
pub use hub::{ConnectionHub, HubEvent};
pub use proxy::{member_kind, MemberKind, Reviver, ServiceEvent, ServiceProxy};
pub use router::{FilteredChannel, MulticastEvent, RoutedChannel, Router, StaticRouter};
pub use server::ChannelHandler;
pub use transport::{StreamTransport, Transport};
pub use wiremux_codec::{RemoteError, Value};

/// Log the error of a fallible expression and move on.
#[macro_export]
macro_rules! logerr {
    ($val:expr) => {
        if let Err(e) = $val {
            log::error!("Error {:?}", e);
        }
    };
}

/// Convenience `env_logger` setup for binaries and tests.
pub fn setup_logger() {
    use std::io::Write;

    let mut builder = env_logger::Builder::from_default_env();

    let _ = builder
        .format_timestamp_millis()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - [{:5}] {}:{} - {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .try_init();
}

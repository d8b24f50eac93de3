//! Wire codec for wiremux.
//!
//! Everything that crosses a transport is a pair of self-describing
//! [`Value`]s: a header and a body, concatenated into one frame. The header
//! is a sequence of small integers and strings which selects one of the
//! request or response shapes in [`frame`]; the body is an arbitrary value.
//!
//! For byte-stream transports which cannot carry message boundaries on
//! their own, [`FrameCodec`] adds an outer length prefix so the stream can
//! be driven with `tokio_util::codec::Framed`.

pub mod codec;
pub mod error;
pub mod frame;
pub mod value;

pub use codec::{FrameCodec, DEFAULT_FRAME_CEILING};
pub use error::CodecError;
pub use frame::{
    Message, RemoteError, Request, RequestId, Response, Stack, RESPONSE_INITIALIZE,
};
pub use value::Value;

/// Result alias used across the codec.
pub type Result<T> = std::result::Result<T, CodecError>;

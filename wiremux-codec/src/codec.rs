//! Outer framing for byte-stream transports.
//!
//! Message transports deliver whole frames on their own. A TCP or unix
//! socket does not, so `FrameCodec` length-prefixes every frame with a
//! big-endian u32 and reassembles them on the way in.

use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound for one framed message, 16 MiB.
pub const DEFAULT_FRAME_CEILING: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Length-prefix codec turning an `AsyncRead + AsyncWrite` byte stream
/// into a whole-frame transport.
pub struct FrameCodec {
    ceiling: usize,
}

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec {
            ceiling: DEFAULT_FRAME_CEILING,
        }
    }

    pub fn with_ceiling(ceiling: usize) -> FrameCodec {
        FrameCodec { ceiling }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new()
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Bytes, buf: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.len() > self.ceiling {
            return Err(CodecError::Oversize {
                size: frame.len(),
                ceiling: self.ceiling,
            });
        }

        buf.reserve(LENGTH_PREFIX + frame.len());
        buf.put_u32(frame.len() as u32);
        buf.put(frame);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let frame_len = u32::from_be_bytes(length_bytes) as usize;

        if frame_len > self.ceiling {
            return Err(CodecError::Oversize {
                size: frame_len,
                ceiling: self.ceiling,
            });
        }

        if src.len() < LENGTH_PREFIX + frame_len {
            // Wait until the whole frame arrived.
            src.reserve(LENGTH_PREFIX + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);

        Ok(Some(src.split_to(frame_len)))
    }
}

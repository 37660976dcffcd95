//! Length-prefixed message framing.
//!
//! Every message payload travels as `[u32 BE length][payload]`. The codec is
//! pure: it never touches a socket, so the same instance is used by the broker
//! and the client and can be exercised directly in tests.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use thiserror::Error;

/// Size of the big-endian length header in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors produced while encoding or decoding frames and packets.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload is larger than the configured limit. Never retried.
    #[error("Message size {size} exceeds maximum {max_size}")]
    Oversize { size: usize, max_size: usize },

    /// Truncated input, inconsistent length fields or an unknown packet layout.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Transport errors surfaced through `tokio_util::codec`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedFrame(message.into())
    }
}

/// Encoder/decoder for a single length-prefixed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_message_size: usize,
}

impl FrameCodec {
    /// Create a codec enforcing `max_message_size` bytes per payload.
    ///
    /// The limit is clamped to what a `u32` length header can describe.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size: max_message_size.min(u32::MAX as usize),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Fail with [`CodecError::Oversize`] if `size` is above the limit.
    pub fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_message_size {
            return Err(CodecError::Oversize {
                size,
                max_size: self.max_message_size,
            });
        }
        Ok(())
    }

    /// Frame a payload. Nothing is produced when the payload is oversize.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        self.encode_into(payload, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Append a framed payload to `dst`, validating before writing anything.
    pub fn encode_into(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), CodecError> {
        self.check_size(payload.len())?;
        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
        Ok(())
    }

    /// Decode exactly one frame. Trailing bytes are treated as an
    /// inconsistent length field.
    pub fn decode(&self, frame: &[u8]) -> Result<Bytes, CodecError> {
        let mut cursor = Cursor::new(frame);
        let payload = self.decode_from(&mut cursor)?;
        if cursor.has_remaining() {
            return Err(CodecError::malformed(format!(
                "{} trailing bytes after frame",
                cursor.remaining()
            )));
        }
        Ok(payload)
    }

    /// Decode one frame from the front of `src`, leaving anything after it.
    /// Missing bytes are an error here: the caller already holds the whole
    /// enclosing packet.
    pub fn decode_from<B: Buf>(&self, src: &mut B) -> Result<Bytes, CodecError> {
        if src.remaining() < LENGTH_PREFIX_SIZE {
            return Err(CodecError::malformed(format!(
                "frame header needs {} bytes, {} available",
                LENGTH_PREFIX_SIZE,
                src.remaining()
            )));
        }
        let declared = src.get_u32() as usize;
        self.check_declared(declared)?;
        if src.remaining() < declared {
            return Err(CodecError::malformed(format!(
                "frame declares {} bytes, {} available",
                declared,
                src.remaining()
            )));
        }
        Ok(src.copy_to_bytes(declared))
    }

    /// Streaming decode: `Ok(None)` until a complete frame is buffered.
    pub fn decode_stream(&self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let declared = {
            let mut peek = Cursor::new(&src[..LENGTH_PREFIX_SIZE]);
            peek.get_u32() as usize
        };
        self.check_declared(declared)?;
        if src.len() < LENGTH_PREFIX_SIZE + declared {
            src.reserve(LENGTH_PREFIX_SIZE + declared - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(declared).freeze()))
    }

    fn check_declared(&self, declared: usize) -> Result<(), CodecError> {
        if declared > self.max_message_size {
            return Err(CodecError::malformed(format!(
                "declared length {} exceeds limit {}",
                declared, self.max_message_size
            )));
        }
        Ok(())
    }
}

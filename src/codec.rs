//! Frame codec for the stream wire protocol.
//!
//! Frames are a `u32` length prefix followed by a `u16` command key, a
//! `u16` version, and a command-specific payload. [`StreamCodec`] turns the
//! inbound byte stream into typed [`ServerFrame`]s and encodes [`Request`]s
//! byte-exactly, driven through `tokio_util`'s `Framed` transport.
//!
//! # Error Handling
//!
//! Decoding distinguishes needing more bytes (`Ok(None)`) from corruption:
//! any [`CodecError`] out of this layer means the peers no longer agree on
//! the byte stream and the connection must come down. Truncation *inside* a
//! length-complete frame is corruption, never a partial read. See the
//! [`error`] module for the taxonomy.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub mod error;
pub(crate) mod frame;
pub(crate) mod wire;

pub use error::{CodecError, EofError, FramingError, ProtocolError};
pub use frame::{
    Broker,
    Request,
    Response,
    ResponseCode,
    ResponseKind,
    ServerFrame,
    StreamMetadata,
    VERSION,
};

/// Length prefix size in bytes.
pub const LENGTH_HEADER_SIZE: usize = 4;

/// Smallest payload a frame can declare: the command key and version.
const MIN_PAYLOAD_LENGTH: usize = 4;

/// Default maximum frame size in bytes (1 MiB), the broker default.
pub const DEFAULT_FRAME_MAX: u32 = 1024 * 1024;

/// Hard upper bound on any inbound frame this client will buffer (16 MiB).
///
/// Delivered chunks are sized by broker-side batching and may legitimately
/// exceed the negotiated outbound maximum, so inbound frames are checked
/// against this bound rather than the tuned one.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Codec for the stream protocol over a byte transport.
///
/// Clones share the effective maximum frame size: the handshake installs
/// the tuned value once negotiation settles and both halves of a split
/// transport observe it.
#[derive(Clone, Debug)]
pub struct StreamCodec {
    frame_max: Arc<AtomicU32>,
}

impl StreamCodec {
    /// Construct a codec with an initial outbound frame size limit.
    #[must_use]
    pub fn new(frame_max: u32) -> Self {
        Self {
            frame_max: Arc::new(AtomicU32::new(frame_max)),
        }
    }

    /// Currently effective maximum outbound frame size.
    #[must_use]
    pub fn frame_max(&self) -> u32 { self.frame_max.load(Ordering::Relaxed) }

    /// Install the tuned frame size on every clone of this codec.
    pub fn set_frame_max(&self, frame_max: u32) {
        self.frame_max.store(frame_max, Ordering::Relaxed);
    }
}

impl Default for StreamCodec {
    fn default() -> Self { Self::new(DEFAULT_FRAME_MAX) }
}

fn peek_length(src: &BytesMut) -> usize {
    let mut bytes = [0u8; LENGTH_HEADER_SIZE];
    bytes.copy_from_slice(&src[..LENGTH_HEADER_SIZE]);
    wire::len_to_usize(u32::from_be_bytes(bytes))
}

impl Decoder for StreamCodec {
    type Item = ServerFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_HEADER_SIZE {
            return Ok(None);
        }
        let declared = peek_length(src);
        if declared < MIN_PAYLOAD_LENGTH {
            return Err(FramingError::EmptyFrame.into());
        }
        if declared > MAX_FRAME_LENGTH {
            return Err(FramingError::OversizedFrame {
                size: declared,
                max: MAX_FRAME_LENGTH,
            }
            .into());
        }
        let total = LENGTH_HEADER_SIZE + declared;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_HEADER_SIZE);
        let mut payload = src.split_to(declared).freeze();
        let key = payload.get_u16();
        let version = payload.get_u16();
        frame::decode_server_frame(key, version, &mut payload).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Clean close: no bytes pending at a frame boundary.
        if src.is_empty() {
            return Ok(None);
        }
        if src.len() < LENGTH_HEADER_SIZE {
            return Err(EofError::MidHeader {
                bytes_received: src.len(),
                header_size: LENGTH_HEADER_SIZE,
            }
            .into());
        }
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => Err(EofError::MidFrame {
                bytes_received: src.len() - LENGTH_HEADER_SIZE,
                expected: peek_length(src),
            }
            .into()),
        }
    }
}

impl Encoder<Request> for StreamCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        frame::encode_request(&item, dst)?;
        let written = dst.len() - start;
        let max = wire::len_to_usize(self.frame_max());
        if written > max {
            dst.truncate(start);
            return Err(FramingError::OversizedFrame {
                size: written,
                max,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;

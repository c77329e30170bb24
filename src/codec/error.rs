//! Error types for the codec layer.
//!
//! The taxonomy distinguishes framing errors (wire-level frame boundary
//! issues), protocol errors (semantic violations inside a length-complete
//! frame), I/O errors, and EOF conditions. Any of them is fatal to the
//! connection that observed it: a peer that misframes once cannot be
//! resynchronised.
//!
//! # Error Categories
//!
//! - [`FramingError`]: wire-level issues in frame structure (oversized
//!   frames, empty frames, checksum mismatches).
//! - [`ProtocolError`]: violations found after the frame boundary was
//!   established (truncated fields, unknown command keys, unsupported
//!   versions).
//! - [`EofError`]: premature end-of-stream conditions. A clean close at a
//!   frame boundary is not an error and surfaces as end of stream instead.
//! - [`CodecError`]: top-level enum wrapping all categories plus I/O errors.

use std::io;

use thiserror::Error;

/// Framing-level errors occurring during frame boundary detection.
///
/// These indicate problems with the wire-level frame structure, before any
/// payload interpretation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FramingError {
    /// Frame length prefix indicates a size exceeding the configured maximum.
    #[error("frame exceeds max length: {size} > {max}")]
    OversizedFrame {
        /// Frame size indicated by the length prefix.
        size: usize,
        /// Maximum allowed frame size.
        max: usize,
    },

    /// Length prefix too small to hold the command key and version.
    #[error("frame too short to carry a command header")]
    EmptyFrame,

    /// Chunk CRC mismatch.
    #[error("chunk checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum carried in the chunk header.
        expected: u32,
        /// Checksum computed from the chunk data.
        actual: u32,
    },
}

/// Protocol-level errors occurring after successful frame extraction.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A length-complete frame ran out of bytes mid-field.
    #[error("truncated frame: ran out of bytes reading {field}")]
    Truncated {
        /// Field being read when the payload ended.
        field: &'static str,
    },

    /// A length or count field carried a value outside its domain.
    #[error("invalid length {value} for {field}")]
    InvalidLength {
        /// Field the length belongs to.
        field: &'static str,
        /// Offending value.
        value: i64,
    },

    /// A string field did not contain valid UTF-8.
    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 {
        /// Offending field.
        field: &'static str,
    },

    /// A known command arrived with a version this client does not speak.
    #[error("unsupported version {version} for command {key:#06x}")]
    UnsupportedVersion {
        /// Command key of the offending frame.
        key: u16,
        /// Version number that was rejected.
        version: u16,
    },

    /// Command key not recognised for the negotiated protocol version.
    #[error("unknown command key {key:#06x}")]
    UnknownKey {
        /// Key that was not recognised.
        key: u16,
    },

    /// Chunk did not start with the expected magic/version byte.
    #[error("chunk magic mismatch: expected 0x50, got {found:#04x}")]
    ChunkMagicMismatch {
        /// Byte found where the magic was expected.
        found: u8,
    },

    /// Chunk type byte outside the known range.
    #[error("unknown chunk type {value}")]
    UnknownChunkType {
        /// Offending type byte.
        value: u8,
    },
}

/// Premature end-of-stream conditions.
///
/// A peer closing cleanly at a frame boundary is reported as end of stream,
/// not through this type.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum EofError {
    /// EOF while reading the 4-byte length prefix.
    #[error("premature EOF during header: {bytes_received} of {header_size} header bytes")]
    MidHeader {
        /// Header bytes received before EOF.
        bytes_received: usize,
        /// Expected header size.
        header_size: usize,
    },

    /// EOF after the length prefix but before the full payload.
    #[error("premature EOF: {bytes_received} bytes of {expected} byte frame received")]
    MidFrame {
        /// Payload bytes received before EOF.
        bytes_received: usize,
        /// Expected payload size.
        expected: usize,
    },
}

/// Top-level codec error taxonomy.
///
/// # Examples
///
/// ```
/// use streamwire::codec::{CodecError, FramingError};
///
/// let err = CodecError::Framing(FramingError::OversizedFrame {
///     size: 2_000_000,
///     max: 1_048_576,
/// });
/// assert_eq!(err.error_type(), "framing");
/// ```
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// Framing layer error (wire-level frame boundary issues).
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Protocol layer error (post-frame extraction issues).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport layer I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Premature end of stream.
    #[error("EOF: {0}")]
    Eof(#[from] EofError),
}

impl CodecError {
    /// Returns the error category as a string for logging and metrics.
    ///
    /// One of: `"framing"`, `"protocol"`, `"io"`, or `"eof"`.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Framing(_) => "framing",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
            Self::Eof(_) => "eof",
        }
    }
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => e,
            CodecError::Framing(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            CodecError::Protocol(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            CodecError::Eof(e) => io::Error::new(io::ErrorKind::UnexpectedEof, e),
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

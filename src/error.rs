//! Error types for stream client operations.
//!
//! The taxonomy separates connection-fatal conditions (handshake and
//! authentication failures, heartbeat loss, corrupt frames) from per-entity
//! conditions (publish rejections, unavailable streams) that leave the
//! connection intact. Fatal errors cascade to every publisher and consumer
//! on the affected connection exactly once; entity-level errors are
//! reported on the entity's own channel and nowhere else.

use std::{io, time::Duration};

use thiserror::Error;

use crate::{
    chunk::ChunkError,
    codec::{CodecError, ResponseCode},
};

/// Result type used throughout the client API.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Top-level error type for stream client operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StreamError {
    /// The protocol handshake could not be completed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The broker rejected the presented credentials or virtual host.
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthenticationError),

    /// No response arrived for a correlated request within the deadline.
    #[error("request {correlation_id} timed out after {timeout:?}")]
    RequestTimeout {
        /// Correlation identifier of the abandoned request.
        correlation_id: u32,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The connection was closed locally before or during the operation.
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport failed underneath an established connection.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No frame traffic was observed within the negotiated heartbeat window.
    #[error("heartbeat timeout after {0:?} without frame traffic")]
    HeartbeatTimeout(Duration),

    /// The peer sent a close frame; the connection is finished.
    #[error("server closed the connection ({code:?}): {reason}")]
    ClosedByPeer {
        /// Closing code reported by the broker.
        code: ResponseCode,
        /// Human-readable closing reason.
        reason: String,
    },

    /// A frame could not be decoded or encoded; fatal to the connection.
    #[error("corrupt frame: {0}")]
    Corrupt(#[from] CodecError),

    /// A delivered chunk could not be expanded into messages.
    ///
    /// Reported per chunk on the consumer's channel; the connection stays up.
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// The broker rejected an individual publishing id.
    #[error("publish rejected for publishing id {publishing_id}: {code:?}")]
    Publish {
        /// Publishing id the rejection refers to.
        publishing_id: u64,
        /// Broker-reported reason.
        code: ResponseCode,
    },

    /// The stream lost its leader and no replacement is reachable yet.
    #[error("stream `{stream}` is unavailable")]
    StreamUnavailable {
        /// Affected stream name.
        stream: String,
    },

    /// The named stream does not exist on the broker.
    #[error("stream `{stream}` does not exist")]
    StreamNotFound {
        /// Requested stream name.
        stream: String,
    },

    /// Stream creation failed because the name is already taken.
    #[error("stream `{stream}` already exists")]
    StreamAlreadyExists {
        /// Requested stream name.
        stream: String,
    },

    /// No offset has been stored under the given reference.
    #[error("no stored offset for reference `{reference}` on stream `{stream}`")]
    OffsetNotFound {
        /// Offset-tracking reference that was queried.
        reference: String,
        /// Stream the query addressed.
        stream: String,
    },

    /// The operation needs a publisher or consumer name and none was set.
    #[error("operation `{operation}` requires a name for offset tracking")]
    NameRequired {
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// A batch exceeded the publisher's in-flight capacity and can never
    /// be admitted whole.
    #[error("batch of {len} messages exceeds the in-flight capacity of {capacity}")]
    BatchTooLarge {
        /// Number of messages in the rejected batch.
        len: usize,
        /// Configured in-flight capacity.
        capacity: usize,
    },

    /// All publisher and subscription ids on the connection are in use.
    #[error("no free publisher or subscription ids left on this connection")]
    IdsExhausted,

    /// The broker answered with a non-OK code not covered by a dedicated
    /// variant.
    #[error("server responded {code:?} to {operation}")]
    ErrorResponse {
        /// Operation the response belongs to.
        operation: &'static str,
        /// Broker-reported code.
        code: ResponseCode,
    },

    /// Transport or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures during the version/property/tune portion of connection setup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandshakeError {
    /// The broker offers no SASL mechanism this client speaks.
    #[error("no supported SASL mechanism; broker offered {offered:?}")]
    MechanismNotSupported {
        /// Mechanisms advertised by the broker.
        offered: Vec<String>,
    },

    /// The broker never sent its tune frame.
    #[error("tune negotiation did not complete within {0:?}")]
    TuneTimeout(Duration),

    /// A handshake step was answered with a non-OK code.
    #[error("handshake step `{step}` rejected with {code:?}")]
    Rejected {
        /// Handshake step that failed.
        step: &'static str,
        /// Broker-reported code.
        code: ResponseCode,
    },

    /// The broker answered a handshake request with the wrong frame kind.
    #[error("handshake step `{step}` received a reply of the wrong kind")]
    MismatchedReply {
        /// Handshake step whose reply was malformed.
        step: &'static str,
    },
}

/// Failures during SASL authentication or virtual-host access.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthenticationError {
    /// The broker rejected the supplied username/password pair.
    #[error("the broker rejected the provided credentials")]
    InvalidCredentials,

    /// The account may only connect over loopback interfaces.
    #[error("this user may only connect over loopback")]
    LoopbackOnly,

    /// SASL exchange failed for a reason other than bad credentials.
    #[error("SASL exchange failed with {code:?}")]
    Sasl {
        /// Broker-reported code.
        code: ResponseCode,
    },

    /// The authenticated user may not access the requested virtual host.
    #[error("access to virtual host `{virtual_host}` was refused")]
    VirtualHost {
        /// Virtual host named in the open frame.
        virtual_host: String,
    },
}

impl StreamError {
    /// Clone a terminal error for delivery to one more waiter.
    ///
    /// Terminal variants carry cheap payloads; anything else collapses
    /// into [`StreamError::ConnectionLost`] with the display text.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::ConnectionLost(reason) => Self::ConnectionLost(reason.clone()),
            Self::StreamUnavailable { stream } => Self::StreamUnavailable {
                stream: stream.clone(),
            },
            other => Self::ConnectionLost(other.to_string()),
        }
    }

    /// Map a non-OK response `code` to the dedicated variant where one
    /// exists, falling back to [`StreamError::ErrorResponse`].
    ///
    /// `stream` names the stream the operation addressed, where there is one.
    pub(crate) fn from_code(operation: &'static str, code: ResponseCode, stream: &str) -> Self {
        match code {
            ResponseCode::StreamDoesNotExist => Self::StreamNotFound {
                stream: stream.to_owned(),
            },
            ResponseCode::StreamAlreadyExists => Self::StreamAlreadyExists {
                stream: stream.to_owned(),
            },
            ResponseCode::StreamNotAvailable => Self::StreamUnavailable {
                stream: stream.to_owned(),
            },
            _ => Self::ErrorResponse { operation, code },
        }
    }
}

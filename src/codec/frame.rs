//! Typed protocol frames and their wire encodings.
//!
//! [`Request`] covers every frame this client sends; [`ServerFrame`] covers
//! every frame it understands from the broker. Responses carry the request
//! key with the high bit set. Encoding backfills the length prefix after
//! the payload is written, so a frame is always length-exact.

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    error::{CodecError, ProtocolError},
    wire,
};
use crate::{chunk::Chunk, offset::OffsetSpecification};

/// Protocol version spoken by this client.
pub const VERSION: u16 = 1;

/// Bit set on a command key to mark a response frame.
pub(crate) const RESPONSE_FLAG: u16 = 0x8000;

/// Command keys for protocol version 1.
pub(crate) mod key {
    pub(crate) const DECLARE_PUBLISHER: u16 = 0x0001;
    pub(crate) const PUBLISH: u16 = 0x0002;
    pub(crate) const PUBLISH_CONFIRM: u16 = 0x0003;
    pub(crate) const PUBLISH_ERROR: u16 = 0x0004;
    pub(crate) const QUERY_PUBLISHER_SEQUENCE: u16 = 0x0005;
    pub(crate) const DELETE_PUBLISHER: u16 = 0x0006;
    pub(crate) const SUBSCRIBE: u16 = 0x0007;
    pub(crate) const DELIVER: u16 = 0x0008;
    pub(crate) const CREDIT: u16 = 0x0009;
    pub(crate) const STORE_OFFSET: u16 = 0x000a;
    pub(crate) const QUERY_OFFSET: u16 = 0x000b;
    pub(crate) const UNSUBSCRIBE: u16 = 0x000c;
    pub(crate) const CREATE_STREAM: u16 = 0x000d;
    pub(crate) const DELETE_STREAM: u16 = 0x000e;
    pub(crate) const METADATA: u16 = 0x000f;
    pub(crate) const METADATA_UPDATE: u16 = 0x0010;
    pub(crate) const PEER_PROPERTIES: u16 = 0x0011;
    pub(crate) const SASL_HANDSHAKE: u16 = 0x0012;
    pub(crate) const SASL_AUTHENTICATE: u16 = 0x0013;
    pub(crate) const TUNE: u16 = 0x0014;
    pub(crate) const OPEN: u16 = 0x0015;
    pub(crate) const CLOSE: u16 = 0x0016;
    pub(crate) const HEARTBEAT: u16 = 0x0017;
}

/// Status codes carried by responses and server-initiated notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResponseCode {
    /// The operation succeeded.
    Ok,
    /// The addressed stream does not exist.
    StreamDoesNotExist,
    /// The subscription id is already in use on this connection.
    SubscriptionIdAlreadyExists,
    /// The subscription id is not registered on this connection.
    SubscriptionIdDoesNotExist,
    /// A stream with this name already exists.
    StreamAlreadyExists,
    /// The stream exists but has no reachable leader.
    StreamNotAvailable,
    /// The broker supports none of the offered SASL mechanisms.
    SaslMechanismNotSupported,
    /// Authentication failed.
    AuthenticationFailure,
    /// The SASL exchange failed.
    SaslError,
    /// The SASL exchange wants another round.
    SaslChallenge,
    /// The user may only authenticate over loopback.
    AuthenticationFailureLoopback,
    /// Access to the virtual host was refused.
    VirtualHostAccessFailure,
    /// The peer did not recognise a frame.
    UnknownFrame,
    /// A frame exceeded the negotiated maximum size.
    FrameTooLarge,
    /// The broker failed internally.
    InternalError,
    /// The user lacks permission for the operation.
    AccessRefused,
    /// A precondition for the operation does not hold.
    PreconditionFailed,
    /// The publisher id is not registered on this connection.
    PublisherDoesNotExist,
    /// No offset is stored under the queried reference.
    NoOffset,
    /// A code this client does not know.
    Unknown(u16),
}

impl ResponseCode {
    pub(crate) fn from_wire(value: u16) -> Self {
        match value {
            0x01 => Self::Ok,
            0x02 => Self::StreamDoesNotExist,
            0x03 => Self::SubscriptionIdAlreadyExists,
            0x04 => Self::SubscriptionIdDoesNotExist,
            0x05 => Self::StreamAlreadyExists,
            0x06 => Self::StreamNotAvailable,
            0x07 => Self::SaslMechanismNotSupported,
            0x08 => Self::AuthenticationFailure,
            0x09 => Self::SaslError,
            0x0a => Self::SaslChallenge,
            0x0b => Self::AuthenticationFailureLoopback,
            0x0c => Self::VirtualHostAccessFailure,
            0x0d => Self::UnknownFrame,
            0x0e => Self::FrameTooLarge,
            0x0f => Self::InternalError,
            0x10 => Self::AccessRefused,
            0x11 => Self::PreconditionFailed,
            0x12 => Self::PublisherDoesNotExist,
            0x13 => Self::NoOffset,
            other => Self::Unknown(other),
        }
    }

    pub(crate) fn to_wire(self) -> u16 {
        match self {
            Self::Ok => 0x01,
            Self::StreamDoesNotExist => 0x02,
            Self::SubscriptionIdAlreadyExists => 0x03,
            Self::SubscriptionIdDoesNotExist => 0x04,
            Self::StreamAlreadyExists => 0x05,
            Self::StreamNotAvailable => 0x06,
            Self::SaslMechanismNotSupported => 0x07,
            Self::AuthenticationFailure => 0x08,
            Self::SaslError => 0x09,
            Self::SaslChallenge => 0x0a,
            Self::AuthenticationFailureLoopback => 0x0b,
            Self::VirtualHostAccessFailure => 0x0c,
            Self::UnknownFrame => 0x0d,
            Self::FrameTooLarge => 0x0e,
            Self::InternalError => 0x0f,
            Self::AccessRefused => 0x10,
            Self::PreconditionFailed => 0x11,
            Self::PublisherDoesNotExist => 0x12,
            Self::NoOffset => 0x13,
            Self::Unknown(value) => value,
        }
    }

    /// Whether the code reports success.
    #[must_use]
    pub fn is_ok(self) -> bool { self == Self::Ok }
}

/// A frame sent by this client.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Request {
    /// Client/server property exchange opening the handshake.
    PeerProperties {
        correlation_id: u32,
        properties: Vec<(String, String)>,
    },
    /// Ask the broker which SASL mechanisms it supports.
    SaslHandshake { correlation_id: u32 },
    /// One round of the SASL exchange.
    SaslAuthenticate {
        correlation_id: u32,
        mechanism: String,
        data: Bytes,
    },
    /// Settle the negotiated frame size and heartbeat interval.
    Tune { frame_max: u32, heartbeat: u32 },
    /// Attach the connection to a virtual host.
    Open {
        correlation_id: u32,
        virtual_host: String,
    },
    /// Ask the peer to close the connection.
    Close {
        correlation_id: u32,
        code: ResponseCode,
        reason: String,
    },
    /// Acknowledge a server-initiated close.
    CloseResponse { correlation_id: u32 },
    /// Register a publisher id for a stream.
    DeclarePublisher {
        correlation_id: u32,
        publisher_id: u8,
        reference: Option<String>,
        stream: String,
    },
    /// Append a batch of messages under previously assigned publishing ids.
    Publish {
        publisher_id: u8,
        messages: Vec<(u64, Bytes)>,
    },
    /// Look up the last publishing id the broker stored for a reference.
    QueryPublisherSequence {
        correlation_id: u32,
        reference: String,
        stream: String,
    },
    /// Deregister a publisher id.
    DeletePublisher {
        correlation_id: u32,
        publisher_id: u8,
    },
    /// Attach a subscription to a stream from a start position.
    Subscribe {
        correlation_id: u32,
        subscription_id: u8,
        stream: String,
        offset: OffsetSpecification,
        credit: u16,
        properties: Vec<(String, String)>,
    },
    /// Grant the broker additional chunks for a subscription.
    Credit { subscription_id: u8, credit: u16 },
    /// Persist a consumer offset under a reference.
    StoreOffset {
        reference: String,
        stream: String,
        offset: u64,
    },
    /// Look up a stored consumer offset.
    QueryOffset {
        correlation_id: u32,
        reference: String,
        stream: String,
    },
    /// Detach a subscription.
    Unsubscribe {
        correlation_id: u32,
        subscription_id: u8,
    },
    /// Create a stream with retention arguments.
    CreateStream {
        correlation_id: u32,
        stream: String,
        arguments: Vec<(String, String)>,
    },
    /// Delete a stream.
    DeleteStream { correlation_id: u32, stream: String },
    /// Query topology for a set of streams.
    Metadata {
        correlation_id: u32,
        streams: Vec<String>,
    },
    /// Liveness probe.
    Heartbeat,
}

impl Request {
    /// On-wire command key, including the response flag for frames sent in
    /// reply to server-initiated requests.
    pub(crate) fn wire_key(&self) -> u16 {
        match self {
            Self::PeerProperties { .. } => key::PEER_PROPERTIES,
            Self::SaslHandshake { .. } => key::SASL_HANDSHAKE,
            Self::SaslAuthenticate { .. } => key::SASL_AUTHENTICATE,
            Self::Tune { .. } => key::TUNE,
            Self::Open { .. } => key::OPEN,
            Self::Close { .. } => key::CLOSE,
            Self::CloseResponse { .. } => key::CLOSE | RESPONSE_FLAG,
            Self::DeclarePublisher { .. } => key::DECLARE_PUBLISHER,
            Self::Publish { .. } => key::PUBLISH,
            Self::QueryPublisherSequence { .. } => key::QUERY_PUBLISHER_SEQUENCE,
            Self::DeletePublisher { .. } => key::DELETE_PUBLISHER,
            Self::Subscribe { .. } => key::SUBSCRIBE,
            Self::Credit { .. } => key::CREDIT,
            Self::StoreOffset { .. } => key::STORE_OFFSET,
            Self::QueryOffset { .. } => key::QUERY_OFFSET,
            Self::Unsubscribe { .. } => key::UNSUBSCRIBE,
            Self::CreateStream { .. } => key::CREATE_STREAM,
            Self::DeleteStream { .. } => key::DELETE_STREAM,
            Self::Metadata { .. } => key::METADATA,
            Self::Heartbeat => key::HEARTBEAT,
        }
    }
}

/// Encode a request as one length-prefixed frame.
pub(crate) fn encode_request(request: &Request, dst: &mut BytesMut) -> Result<(), CodecError> {
    let start = dst.len();
    dst.put_u32(0); // backfilled once the payload length is known
    dst.put_u16(request.wire_key());
    dst.put_u16(VERSION);
    match request {
        Request::PeerProperties {
            correlation_id,
            properties,
        } => {
            dst.put_u32(*correlation_id);
            wire::put_string_map(dst, properties)?;
        }
        Request::SaslHandshake { correlation_id } => dst.put_u32(*correlation_id),
        Request::SaslAuthenticate {
            correlation_id,
            mechanism,
            data,
        } => {
            dst.put_u32(*correlation_id);
            wire::put_string(dst, mechanism)?;
            wire::put_bytes(dst, data)?;
        }
        Request::Tune {
            frame_max,
            heartbeat,
        } => {
            dst.put_u32(*frame_max);
            dst.put_u32(*heartbeat);
        }
        Request::Open {
            correlation_id,
            virtual_host,
        } => {
            dst.put_u32(*correlation_id);
            wire::put_string(dst, virtual_host)?;
        }
        Request::Close {
            correlation_id,
            code,
            reason,
        } => {
            dst.put_u32(*correlation_id);
            dst.put_u16(code.to_wire());
            wire::put_string(dst, reason)?;
        }
        Request::CloseResponse { correlation_id } => {
            dst.put_u32(*correlation_id);
            dst.put_u16(ResponseCode::Ok.to_wire());
        }
        Request::DeclarePublisher {
            correlation_id,
            publisher_id,
            reference,
            stream,
        } => {
            dst.put_u32(*correlation_id);
            dst.put_u8(*publisher_id);
            wire::put_opt_string(dst, reference.as_deref())?;
            wire::put_string(dst, stream)?;
        }
        Request::Publish {
            publisher_id,
            messages,
        } => {
            dst.put_u8(*publisher_id);
            wire::put_array_len(dst, "messages", messages.len())?;
            for (publishing_id, body) in messages {
                dst.put_u64(*publishing_id);
                wire::put_bytes(dst, body)?;
            }
        }
        Request::QueryPublisherSequence {
            correlation_id,
            reference,
            stream,
        }
        | Request::QueryOffset {
            correlation_id,
            reference,
            stream,
        } => {
            dst.put_u32(*correlation_id);
            wire::put_string(dst, reference)?;
            wire::put_string(dst, stream)?;
        }
        Request::DeletePublisher {
            correlation_id,
            publisher_id,
        } => {
            dst.put_u32(*correlation_id);
            dst.put_u8(*publisher_id);
        }
        Request::Subscribe {
            correlation_id,
            subscription_id,
            stream,
            offset,
            credit,
            properties,
        } => {
            dst.put_u32(*correlation_id);
            dst.put_u8(*subscription_id);
            wire::put_string(dst, stream)?;
            offset.put(dst);
            dst.put_u16(*credit);
            wire::put_string_map(dst, properties)?;
        }
        Request::Credit {
            subscription_id,
            credit,
        } => {
            dst.put_u8(*subscription_id);
            dst.put_u16(*credit);
        }
        Request::StoreOffset {
            reference,
            stream,
            offset,
        } => {
            wire::put_string(dst, reference)?;
            wire::put_string(dst, stream)?;
            dst.put_u64(*offset);
        }
        Request::Unsubscribe {
            correlation_id,
            subscription_id,
        } => {
            dst.put_u32(*correlation_id);
            dst.put_u8(*subscription_id);
        }
        Request::CreateStream {
            correlation_id,
            stream,
            arguments,
        } => {
            dst.put_u32(*correlation_id);
            wire::put_string(dst, stream)?;
            wire::put_string_map(dst, arguments)?;
        }
        Request::DeleteStream {
            correlation_id,
            stream,
        } => {
            dst.put_u32(*correlation_id);
            wire::put_string(dst, stream)?;
        }
        Request::Metadata {
            correlation_id,
            streams,
        } => {
            dst.put_u32(*correlation_id);
            wire::put_array_len(dst, "streams", streams.len())?;
            for stream in streams {
                wire::put_string(dst, stream)?;
            }
        }
        Request::Heartbeat => {}
    }
    let payload_len = dst.len() - start - 4;
    let len = u32::try_from(payload_len).map_err(|_| ProtocolError::InvalidLength {
        field: "frame length",
        value: i64::try_from(payload_len).unwrap_or(i64::MAX),
    })?;
    dst[start..start + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

/// A frame received from the broker.
#[derive(Debug)]
#[non_exhaustive]
pub enum ServerFrame {
    /// A correlated reply to one of this client's requests.
    Response(Response),
    /// Publishing ids the broker has persisted.
    PublishConfirm {
        publisher_id: u8,
        publishing_ids: Vec<u64>,
    },
    /// Publishing ids the broker has rejected, with reasons.
    PublishError {
        publisher_id: u8,
        errors: Vec<(u64, ResponseCode)>,
    },
    /// A chunk of records for a subscription.
    Deliver { subscription_id: u8, chunk: Chunk },
    /// A credit frame referenced an unknown subscription.
    CreditError {
        subscription_id: u8,
        code: ResponseCode,
    },
    /// Topology for a stream changed; cached metadata is stale.
    MetadataUpdate { code: ResponseCode, stream: String },
    /// The broker's proposed frame size and heartbeat interval.
    Tune { frame_max: u32, heartbeat: u32 },
    /// The broker wants to close the connection.
    CloseRequest {
        correlation_id: u32,
        code: ResponseCode,
        reason: String,
    },
    /// Liveness probe.
    Heartbeat,
}

/// A correlated reply paired with its parsed payload.
#[derive(Debug)]
pub struct Response {
    /// Correlation id copied from the request.
    pub correlation_id: u32,
    /// Parsed payload.
    pub kind: ResponseKind,
}

/// Payload of a correlated reply, keyed by the request that caused it.
#[derive(Debug)]
#[non_exhaustive]
pub enum ResponseKind {
    /// A bare status code.
    Status(ResponseCode),
    /// Server properties from the opening exchange.
    PeerProperties {
        code: ResponseCode,
        properties: Vec<(String, String)>,
    },
    /// SASL mechanisms the broker supports.
    SaslHandshake {
        code: ResponseCode,
        mechanisms: Vec<String>,
    },
    /// Outcome of one SASL round, with challenge data when it continues.
    SaslAuthenticate { code: ResponseCode, data: Bytes },
    /// Outcome of attaching to a virtual host, with connection properties.
    Open {
        code: ResponseCode,
        properties: Vec<(String, String)>,
    },
    /// Last publishing id stored for a publisher reference.
    PublisherSequence { code: ResponseCode, sequence: u64 },
    /// Stored offset for a consumer reference.
    Offset { code: ResponseCode, offset: u64 },
    /// Cluster topology for the queried streams.
    Metadata {
        brokers: Vec<Broker>,
        streams: Vec<StreamMetadata>,
    },
}

impl ResponseKind {
    /// Status code of the response. Metadata responses carry no overall
    /// code and always report [`ResponseCode::Ok`]; failures live on the
    /// per-stream entries.
    #[must_use]
    pub fn code(&self) -> ResponseCode {
        match self {
            Self::Status(code)
            | Self::PeerProperties { code, .. }
            | Self::SaslHandshake { code, .. }
            | Self::SaslAuthenticate { code, .. }
            | Self::Open { code, .. }
            | Self::PublisherSequence { code, .. }
            | Self::Offset { code, .. } => *code,
            Self::Metadata { .. } => ResponseCode::Ok,
        }
    }
}

/// One node of the cluster as reported by a metadata response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Broker {
    /// Broker reference used by stream metadata entries.
    pub reference: u16,
    /// Advertised host.
    pub host: String,
    /// Advertised stream port.
    pub port: u32,
}

/// Topology of one stream as reported by a metadata response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamMetadata {
    /// Stream name.
    pub stream: String,
    /// Per-stream status; `Ok` when the stream exists and has a leader.
    pub code: ResponseCode,
    /// Broker reference of the leader.
    pub leader: u16,
    /// Broker references of the replicas.
    pub replicas: Vec<u16>,
}

/// Decode one server frame from a length-complete payload.
pub(crate) fn decode_server_frame(
    wire_key: u16,
    version: u16,
    src: &mut Bytes,
) -> Result<ServerFrame, CodecError> {
    if version != VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            key: wire_key,
            version,
        }
        .into());
    }
    if wire_key & RESPONSE_FLAG != 0 {
        return decode_response(wire_key & !RESPONSE_FLAG, src);
    }
    match wire_key {
        key::PUBLISH_CONFIRM => {
            let publisher_id = wire::get_u8(src, "publisher id")?;
            let count = wire::get_array_len(src, "publishing ids")?;
            let mut publishing_ids = Vec::with_capacity(count.min(src.len()));
            for _ in 0..count {
                publishing_ids.push(wire::get_u64(src, "publishing id")?);
            }
            Ok(ServerFrame::PublishConfirm {
                publisher_id,
                publishing_ids,
            })
        }
        key::PUBLISH_ERROR => {
            let publisher_id = wire::get_u8(src, "publisher id")?;
            let count = wire::get_array_len(src, "publishing errors")?;
            let mut errors = Vec::with_capacity(count.min(src.len()));
            for _ in 0..count {
                let publishing_id = wire::get_u64(src, "publishing id")?;
                let code = ResponseCode::from_wire(wire::get_u16(src, "error code")?);
                errors.push((publishing_id, code));
            }
            Ok(ServerFrame::PublishError {
                publisher_id,
                errors,
            })
        }
        key::DELIVER => {
            let subscription_id = wire::get_u8(src, "subscription id")?;
            let chunk = Chunk::parse(src)?;
            Ok(ServerFrame::Deliver {
                subscription_id,
                chunk,
            })
        }
        key::METADATA_UPDATE => {
            let code = ResponseCode::from_wire(wire::get_u16(src, "metadata update code")?);
            let stream = wire::get_string(src, "stream")?;
            Ok(ServerFrame::MetadataUpdate { code, stream })
        }
        key::TUNE => {
            let frame_max = wire::get_u32(src, "frame max")?;
            let heartbeat = wire::get_u32(src, "heartbeat")?;
            Ok(ServerFrame::Tune {
                frame_max,
                heartbeat,
            })
        }
        key::CLOSE => {
            let correlation_id = wire::get_u32(src, "correlation id")?;
            let code = ResponseCode::from_wire(wire::get_u16(src, "close code")?);
            let reason = wire::get_string(src, "close reason")?;
            Ok(ServerFrame::CloseRequest {
                correlation_id,
                code,
                reason,
            })
        }
        key::HEARTBEAT => Ok(ServerFrame::Heartbeat),
        other => Err(ProtocolError::UnknownKey { key: other }.into()),
    }
}

fn decode_response(base_key: u16, src: &mut Bytes) -> Result<ServerFrame, CodecError> {
    if base_key == key::CREDIT {
        // The credit response is the one uncorrelated reply in the
        // protocol; the broker sends it only to flag a bad subscription.
        let code = ResponseCode::from_wire(wire::get_u16(src, "credit response code")?);
        let subscription_id = wire::get_u8(src, "subscription id")?;
        return Ok(ServerFrame::CreditError {
            subscription_id,
            code,
        });
    }
    let correlation_id = wire::get_u32(src, "correlation id")?;
    let kind = match base_key {
        key::PEER_PROPERTIES => {
            let code = ResponseCode::from_wire(wire::get_u16(src, "response code")?);
            let properties = wire::get_string_map(src, "server properties")?;
            ResponseKind::PeerProperties { code, properties }
        }
        key::SASL_HANDSHAKE => {
            let code = ResponseCode::from_wire(wire::get_u16(src, "response code")?);
            let mechanisms = wire::get_string_array(src, "mechanisms")?;
            ResponseKind::SaslHandshake { code, mechanisms }
        }
        key::SASL_AUTHENTICATE => {
            let code = ResponseCode::from_wire(wire::get_u16(src, "response code")?);
            let data = if src.is_empty() {
                Bytes::new()
            } else {
                wire::get_bytes(src, "sasl data")?
            };
            ResponseKind::SaslAuthenticate { code, data }
        }
        key::OPEN => {
            let code = ResponseCode::from_wire(wire::get_u16(src, "response code")?);
            let properties = if src.is_empty() {
                Vec::new()
            } else {
                wire::get_string_map(src, "connection properties")?
            };
            ResponseKind::Open { code, properties }
        }
        key::QUERY_PUBLISHER_SEQUENCE => {
            let code = ResponseCode::from_wire(wire::get_u16(src, "response code")?);
            let sequence = wire::get_u64(src, "publisher sequence")?;
            ResponseKind::PublisherSequence { code, sequence }
        }
        key::QUERY_OFFSET => {
            let code = ResponseCode::from_wire(wire::get_u16(src, "response code")?);
            let offset = wire::get_u64(src, "stored offset")?;
            ResponseKind::Offset { code, offset }
        }
        key::METADATA => {
            let broker_count = wire::get_array_len(src, "brokers")?;
            let mut brokers = Vec::with_capacity(broker_count.min(src.len()));
            for _ in 0..broker_count {
                let reference = wire::get_u16(src, "broker reference")?;
                let host = wire::get_string(src, "broker host")?;
                let port = wire::get_u32(src, "broker port")?;
                brokers.push(Broker {
                    reference,
                    host,
                    port,
                });
            }
            let stream_count = wire::get_array_len(src, "stream metadata")?;
            let mut streams = Vec::with_capacity(stream_count.min(src.len()));
            for _ in 0..stream_count {
                let stream = wire::get_string(src, "stream")?;
                let code = ResponseCode::from_wire(wire::get_u16(src, "stream code")?);
                let leader = wire::get_u16(src, "leader reference")?;
                let replica_count = wire::get_array_len(src, "replica references")?;
                let mut replicas = Vec::with_capacity(replica_count.min(src.len()));
                for _ in 0..replica_count {
                    replicas.push(wire::get_u16(src, "replica reference")?);
                }
                streams.push(StreamMetadata {
                    stream,
                    code,
                    leader,
                    replicas,
                });
            }
            ResponseKind::Metadata { brokers, streams }
        }
        key::DECLARE_PUBLISHER
        | key::DELETE_PUBLISHER
        | key::SUBSCRIBE
        | key::UNSUBSCRIBE
        | key::CREATE_STREAM
        | key::DELETE_STREAM
        | key::CLOSE => {
            ResponseKind::Status(ResponseCode::from_wire(wire::get_u16(src, "response code")?))
        }
        other => {
            return Err(ProtocolError::UnknownKey {
                key: other | RESPONSE_FLAG,
            }
            .into());
        }
    };
    Ok(ServerFrame::Response(Response {
        correlation_id,
        kind,
    }))
}

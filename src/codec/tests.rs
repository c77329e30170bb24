//! Unit tests for the stream frame codec.
//!
//! Covers byte-exact encoding, typed decoding, partial-read handling,
//! oversize rejection, and EOF behaviour.

use bytes::{BufMut, BytesMut};
use rstest::rstest;
use tokio_util::codec::{Decoder, Encoder};

use super::{frame::key, *};
use crate::{chunk::ChunkType, offset::OffsetSpecification};

/// Assemble one server-side frame: length prefix, key, version, payload.
fn server_frame(wire_key: u16, build: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.put_u16(wire_key);
    payload.put_u16(VERSION);
    build(&mut payload);
    let mut buf = BytesMut::new();
    buf.put_u32(u32::try_from(payload.len()).expect("test payload fits u32"));
    buf.extend_from_slice(&payload);
    buf
}

fn put_str(dst: &mut BytesMut, value: &str) {
    dst.put_i16(i16::try_from(value.len()).expect("test string fits i16"));
    dst.put_slice(value.as_bytes());
}

fn decode_one(buf: &mut BytesMut) -> ServerFrame {
    StreamCodec::default()
        .decode(buf)
        .expect("decode should succeed")
        .expect("expected a complete frame")
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

#[test]
fn subscribe_encodes_byte_exactly() {
    let mut codec = StreamCodec::default();
    let mut buf = BytesMut::new();
    codec
        .encode(
            Request::Subscribe {
                correlation_id: 3,
                subscription_id: 5,
                stream: "events".into(),
                offset: OffsetSpecification::Next,
                credit: 2,
                properties: Vec::new(),
            },
            &mut buf,
        )
        .expect("encode should succeed");

    let expected: &[u8] = &[
        0x00, 0x00, 0x00, 0x19, // length: 25
        0x00, 0x07, 0x00, 0x01, // subscribe, version 1
        0x00, 0x00, 0x00, 0x03, // correlation id
        0x05, // subscription id
        0x00, 0x06, b'e', b'v', b'e', b'n', b't', b's', // stream
        0x00, 0x03, // offset type: next
        0x00, 0x02, // initial credit
        0x00, 0x00, 0x00, 0x00, // empty properties
    ];
    assert_eq!(buf.as_ref(), expected);
}

#[test]
fn publish_encodes_byte_exactly() {
    let mut codec = StreamCodec::default();
    let mut buf = BytesMut::new();
    codec
        .encode(
            Request::Publish {
                publisher_id: 7,
                messages: vec![(1, bytes::Bytes::from_static(b"hi"))],
            },
            &mut buf,
        )
        .expect("encode should succeed");

    let expected: &[u8] = &[
        0x00, 0x00, 0x00, 0x17, // length: 23
        0x00, 0x02, 0x00, 0x01, // publish, version 1
        0x07, // publisher id
        0x00, 0x00, 0x00, 0x01, // one message
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // publishing id 1
        0x00, 0x00, 0x00, 0x02, b'h', b'i', // body
    ];
    assert_eq!(buf.as_ref(), expected);
}

#[rstest]
#[case::heartbeat(Request::Heartbeat, &[0x00, 0x00, 0x00, 0x04, 0x00, 0x17, 0x00, 0x01])]
#[case::credit(
    Request::Credit { subscription_id: 9, credit: 1 },
    &[0x00, 0x00, 0x00, 0x07, 0x00, 0x09, 0x00, 0x01, 0x09, 0x00, 0x01]
)]
#[case::tune_reply(
    Request::Tune { frame_max: 65536, heartbeat: 60 },
    &[0x00, 0x00, 0x00, 0x0c, 0x00, 0x14, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x3c]
)]
fn fixed_frames_encode_byte_exactly(#[case] request: Request, #[case] expected: &[u8]) {
    let mut codec = StreamCodec::default();
    let mut buf = BytesMut::new();
    codec.encode(request, &mut buf).expect("encode should succeed");
    assert_eq!(buf.as_ref(), expected);
}

#[test]
fn close_response_sets_the_response_flag() {
    let mut codec = StreamCodec::default();
    let mut buf = BytesMut::new();
    codec
        .encode(Request::CloseResponse { correlation_id: 8 }, &mut buf)
        .expect("encode should succeed");
    assert_eq!(&buf[4..6], &[0x80, 0x16]);
}

#[test]
fn oversized_encode_is_rejected_and_leaves_buffer_clean() {
    let codec_handle = StreamCodec::new(64);
    let mut codec = codec_handle.clone();
    let mut buf = BytesMut::new();
    let err = codec
        .encode(
            Request::Publish {
                publisher_id: 1,
                messages: vec![(1, bytes::Bytes::from(vec![0_u8; 128]))],
            },
            &mut buf,
        )
        .expect_err("expected encode to fail for oversized frame");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::OversizedFrame { max: 64, .. })
    ));
    assert!(buf.is_empty(), "failed encode must not leave partial bytes");
}

#[test]
fn tuned_frame_max_is_shared_across_clones() {
    let codec = StreamCodec::new(1024);
    let clone = codec.clone();
    codec.set_frame_max(4096);
    assert_eq!(clone.frame_max(), 4096);
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

#[test]
fn status_response_decodes() {
    let mut buf = server_frame(key::CREATE_STREAM | frame::RESPONSE_FLAG, |p| {
        p.put_u32(42);
        p.put_u16(0x05);
    });
    let ServerFrame::Response(response) = decode_one(&mut buf) else {
        panic!("expected a response frame");
    };
    assert_eq!(response.correlation_id, 42);
    assert_eq!(response.kind.code(), ResponseCode::StreamAlreadyExists);
}

#[test]
fn credit_error_decodes_without_correlation_id() {
    let mut buf = server_frame(key::CREDIT | frame::RESPONSE_FLAG, |p| {
        p.put_u16(0x04);
        p.put_u8(11);
    });
    let frame = decode_one(&mut buf);
    let ServerFrame::CreditError {
        subscription_id,
        code,
    } = frame
    else {
        panic!("expected a credit error, got {frame:?}");
    };
    assert_eq!(subscription_id, 11);
    assert_eq!(code, ResponseCode::SubscriptionIdDoesNotExist);
}

#[test]
fn publish_confirm_decodes() {
    let mut buf = server_frame(key::PUBLISH_CONFIRM, |p| {
        p.put_u8(2);
        p.put_i32(3);
        p.put_u64(10);
        p.put_u64(11);
        p.put_u64(12);
    });
    let ServerFrame::PublishConfirm {
        publisher_id,
        publishing_ids,
    } = decode_one(&mut buf)
    else {
        panic!("expected a publish confirm");
    };
    assert_eq!(publisher_id, 2);
    assert_eq!(publishing_ids, vec![10, 11, 12]);
}

#[test]
fn publish_error_decodes() {
    let mut buf = server_frame(key::PUBLISH_ERROR, |p| {
        p.put_u8(2);
        p.put_i32(1);
        p.put_u64(99);
        p.put_u16(0x12);
    });
    let ServerFrame::PublishError {
        publisher_id,
        errors,
    } = decode_one(&mut buf)
    else {
        panic!("expected a publish error");
    };
    assert_eq!(publisher_id, 2);
    assert_eq!(errors, vec![(99, ResponseCode::PublisherDoesNotExist)]);
}

#[test]
fn metadata_response_decodes_brokers_and_streams() {
    let mut buf = server_frame(key::METADATA | frame::RESPONSE_FLAG, |p| {
        p.put_u32(7);
        p.put_i32(1); // one broker
        p.put_u16(0);
        put_str(p, "rabbit-1");
        p.put_u32(5552);
        p.put_i32(1); // one stream
        put_str(p, "events");
        p.put_u16(0x01);
        p.put_u16(0); // leader reference
        p.put_i32(2); // replicas
        p.put_u16(1);
        p.put_u16(2);
    });
    let ServerFrame::Response(response) = decode_one(&mut buf) else {
        panic!("expected a response frame");
    };
    assert_eq!(response.correlation_id, 7);
    let ResponseKind::Metadata { brokers, streams } = response.kind else {
        panic!("expected metadata");
    };
    assert_eq!(
        brokers,
        vec![Broker {
            reference: 0,
            host: "rabbit-1".into(),
            port: 5552,
        }]
    );
    assert_eq!(
        streams,
        vec![StreamMetadata {
            stream: "events".into(),
            code: ResponseCode::Ok,
            leader: 0,
            replicas: vec![1, 2],
        }]
    );
}

#[test]
fn metadata_update_decodes() {
    let mut buf = server_frame(key::METADATA_UPDATE, |p| {
        p.put_u16(0x06);
        put_str(p, "events");
    });
    let ServerFrame::MetadataUpdate { code, stream } = decode_one(&mut buf) else {
        panic!("expected a metadata update");
    };
    assert_eq!(code, ResponseCode::StreamNotAvailable);
    assert_eq!(stream, "events");
}

#[test]
fn tune_and_heartbeat_decode() {
    let mut buf = server_frame(key::TUNE, |p| {
        p.put_u32(131_072);
        p.put_u32(30);
    });
    assert!(matches!(
        decode_one(&mut buf),
        ServerFrame::Tune {
            frame_max: 131_072,
            heartbeat: 30,
        }
    ));

    let mut buf = server_frame(key::HEARTBEAT, |_| {});
    assert!(matches!(decode_one(&mut buf), ServerFrame::Heartbeat));
}

#[test]
fn server_initiated_close_decodes() {
    let mut buf = server_frame(key::CLOSE, |p| {
        p.put_u32(1);
        p.put_u16(0x0f);
        put_str(p, "shutting down");
    });
    let ServerFrame::CloseRequest {
        correlation_id,
        code,
        reason,
    } = decode_one(&mut buf)
    else {
        panic!("expected a close request");
    };
    assert_eq!(correlation_id, 1);
    assert_eq!(code, ResponseCode::InternalError);
    assert_eq!(reason, "shutting down");
}

#[test]
fn deliver_decodes_into_a_verified_chunk() {
    let record = b"payload";
    let mut data = Vec::new();
    data.extend_from_slice(&u32::try_from(record.len()).unwrap().to_be_bytes());
    data.extend_from_slice(record);

    let mut buf = server_frame(key::DELIVER, |p| {
        p.put_u8(4); // subscription id
        p.put_u8(0x50);
        p.put_u8(0); // user chunk
        p.put_u16(1);
        p.put_u32(1);
        p.put_i64(0);
        p.put_u64(1);
        p.put_u64(77); // first offset
        p.put_u32(crc32fast::hash(&data));
        p.put_u32(u32::try_from(data.len()).unwrap());
        p.put_u32(0);
        p.put_u32(0);
        p.put_slice(&data);
    });
    let ServerFrame::Deliver {
        subscription_id,
        chunk,
    } = decode_one(&mut buf)
    else {
        panic!("expected a deliver frame");
    };
    assert_eq!(subscription_id, 4);
    assert_eq!(chunk.chunk_type(), ChunkType::User);
    assert_eq!(chunk.first_offset(), 77);
    let records: Vec<_> = chunk.records().map(Result::unwrap).collect();
    assert_eq!(records[0].as_ref(), record);
}

// ---------------------------------------------------------------------------
// Partial reads and corruption
// ---------------------------------------------------------------------------

#[test]
fn partial_frames_need_more_data() {
    let full = server_frame(key::HEARTBEAT, |_| {});
    let mut codec = StreamCodec::default();
    for cut in 0..full.len() {
        let mut buf = BytesMut::from(&full[..cut]);
        let result = codec.decode(&mut buf).expect("partial input is not an error");
        assert!(result.is_none(), "cut at {cut} should need more data");
        assert_eq!(buf.len(), cut, "partial decode must not consume bytes");
    }
}

#[test]
fn frames_split_across_reads_decode_once_complete() {
    let full = server_frame(key::HEARTBEAT, |_| {});
    let mut codec = StreamCodec::default();
    let mut buf = BytesMut::new();
    for (i, byte) in full.iter().enumerate() {
        buf.put_u8(*byte);
        let result = codec.decode(&mut buf).expect("decode should not fail");
        if i + 1 < full.len() {
            assert!(result.is_none());
        } else {
            assert!(matches!(result, Some(ServerFrame::Heartbeat)));
        }
    }
}

#[test]
fn two_frames_in_one_buffer_decode_sequentially() {
    let mut buf = server_frame(key::HEARTBEAT, |_| {});
    buf.extend_from_slice(&server_frame(key::TUNE, |p| {
        p.put_u32(0);
        p.put_u32(0);
    }));
    let mut codec = StreamCodec::default();
    assert!(matches!(
        codec.decode(&mut buf).unwrap(),
        Some(ServerFrame::Heartbeat)
    ));
    assert!(matches!(
        codec.decode(&mut buf).unwrap(),
        Some(ServerFrame::Tune { .. })
    ));
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn undersized_length_prefix_is_an_empty_frame() {
    let mut buf = BytesMut::new();
    buf.put_u32(2);
    buf.put_u16(key::HEARTBEAT);
    let err = StreamCodec::default()
        .decode(&mut buf)
        .expect_err("expected an empty-frame error");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::EmptyFrame)
    ));
}

#[test]
fn oversized_length_prefix_is_fatal() {
    let mut buf = BytesMut::new();
    buf.put_u32(u32::try_from(MAX_FRAME_LENGTH).unwrap() + 1);
    let err = StreamCodec::default()
        .decode(&mut buf)
        .expect_err("expected an oversized-frame error");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::OversizedFrame {
            max: MAX_FRAME_LENGTH,
            ..
        })
    ));
}

#[test]
fn unknown_command_key_is_fatal() {
    let mut buf = server_frame(0x00ff, |_| {});
    let err = StreamCodec::default()
        .decode(&mut buf)
        .expect_err("expected an unknown-key error");
    assert!(matches!(
        err,
        CodecError::Protocol(ProtocolError::UnknownKey { key: 0x00ff })
    ));
}

#[test]
fn unsupported_version_is_fatal() {
    let mut payload = BytesMut::new();
    payload.put_u16(key::HEARTBEAT);
    payload.put_u16(9);
    let mut buf = BytesMut::new();
    buf.put_u32(4);
    buf.extend_from_slice(&payload);
    let err = StreamCodec::default()
        .decode(&mut buf)
        .expect_err("expected an unsupported-version error");
    assert!(matches!(
        err,
        CodecError::Protocol(ProtocolError::UnsupportedVersion { version: 9, .. })
    ));
}

#[test]
fn truncation_inside_a_complete_frame_is_corrupt() {
    // Declared length covers the correlation id only half-way through the
    // response code: the frame is length-complete but semantically short.
    let mut buf = server_frame(key::CREATE_STREAM | frame::RESPONSE_FLAG, |p| {
        p.put_u32(1);
        p.put_u8(0x00);
    });
    let err = StreamCodec::default()
        .decode(&mut buf)
        .expect_err("expected a truncation error");
    assert!(matches!(
        err,
        CodecError::Protocol(ProtocolError::Truncated { .. })
    ));
}

// ---------------------------------------------------------------------------
// EOF handling
// ---------------------------------------------------------------------------

#[test]
fn decode_eof_with_empty_buffer_is_a_clean_close() {
    let mut buf = BytesMut::new();
    let result = StreamCodec::default().decode_eof(&mut buf);
    assert!(matches!(result, Ok(None)));
}

#[rstest]
#[case::mid_header(&[0x00, 0x00][..])]
#[case::mid_frame(&[0x00, 0x00, 0x00, 0x10, 0x00, 0x17][..])]
fn decode_eof_mid_frame_is_premature(#[case] bytes: &[u8]) {
    let mut buf = BytesMut::from(bytes);
    let err = StreamCodec::default()
        .decode_eof(&mut buf)
        .expect_err("expected a premature EOF error");
    assert!(matches!(err, CodecError::Eof(_)));
}

#[test]
fn decode_eof_with_complete_frame_succeeds() {
    let mut buf = server_frame(key::HEARTBEAT, |_| {});
    let frame = StreamCodec::default()
        .decode_eof(&mut buf)
        .expect("decode should succeed")
        .expect("expected a frame");
    assert!(matches!(frame, ServerFrame::Heartbeat));
}

mod property;

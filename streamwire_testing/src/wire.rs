//! Server-side wire primitives for the mock broker.
//!
//! Deliberately independent of the client codec. Malformed input panics:
//! a client frame the broker cannot parse should fail the test loudly.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub(crate) const VERSION: u16 = 1;
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

/// Assemble one frame: length prefix, key, version, payload.
pub(crate) fn frame(wire_key: u16, build: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut payload = BytesMut::new();
    payload.put_u16(wire_key);
    payload.put_u16(VERSION);
    build(&mut payload);
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    buf.put_u32(u32::try_from(payload.len()).expect("frame fits u32"));
    buf.extend_from_slice(&payload);
    buf.freeze()
}

/// Assemble a correlated response frame for `base_key`.
pub(crate) fn response(
    base_key: u16,
    correlation_id: u32,
    build: impl FnOnce(&mut BytesMut),
) -> Bytes {
    frame(base_key | RESPONSE_FLAG, |dst| {
        dst.put_u32(correlation_id);
        build(dst);
    })
}

/// Response frame carrying only a status code.
pub(crate) fn status_response(base_key: u16, correlation_id: u32, code: u16) -> Bytes {
    response(base_key, correlation_id, |dst| dst.put_u16(code))
}

pub(crate) fn put_string(dst: &mut BytesMut, value: &str) {
    dst.put_i16(i16::try_from(value.len()).expect("string fits i16"));
    dst.put_slice(value.as_bytes());
}

pub(crate) fn put_string_map(dst: &mut BytesMut, entries: &[(String, String)]) {
    dst.put_i32(i32::try_from(entries.len()).expect("map fits i32"));
    for (map_key, value) in entries {
        put_string(dst, map_key);
        put_string(dst, value);
    }
}

pub(crate) fn get_string(src: &mut Bytes) -> String {
    let len = src.get_i16();
    if len <= 0 {
        return String::new();
    }
    let raw = src.split_to(usize::from(len.unsigned_abs()));
    String::from_utf8(raw.to_vec()).expect("client sent invalid UTF-8")
}

pub(crate) fn get_bytes(src: &mut Bytes) -> Bytes {
    let len = src.get_i32();
    if len <= 0 {
        return Bytes::new();
    }
    src.split_to(usize::try_from(len).expect("length is positive"))
}

pub(crate) fn get_string_map(src: &mut Bytes) -> Vec<(String, String)> {
    let count = src.get_i32();
    let mut entries = Vec::new();
    for _ in 0..count {
        let map_key = get_string(src);
        let value = get_string(src);
        entries.push((map_key, value));
    }
    entries
}

//! Primitive readers and writers for the stream wire format.
//!
//! All integers are network byte order. Strings carry an `i16` length
//! prefix (−1 encodes null), byte arrays an `i32` length prefix, and
//! arrays and maps an `i32` element count followed by their elements.
//! Readers fail with [`ProtocolError::Truncated`] when a length-complete
//! frame runs out of bytes mid-field; partial-read handling belongs to the
//! frame decoder above this layer, never here.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::ProtocolError;

fn ensure(src: &Bytes, need: usize, field: &'static str) -> Result<(), ProtocolError> {
    if src.remaining() < need {
        return Err(ProtocolError::Truncated { field });
    }
    Ok(())
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "wire lengths are at most u32::MAX, which fits usize on supported targets"
)]
pub(crate) fn len_to_usize(len: u32) -> usize { len as usize }

pub(crate) fn get_u8(src: &mut Bytes, field: &'static str) -> Result<u8, ProtocolError> {
    ensure(src, 1, field)?;
    Ok(src.get_u8())
}

pub(crate) fn get_u16(src: &mut Bytes, field: &'static str) -> Result<u16, ProtocolError> {
    ensure(src, 2, field)?;
    Ok(src.get_u16())
}

pub(crate) fn get_u32(src: &mut Bytes, field: &'static str) -> Result<u32, ProtocolError> {
    ensure(src, 4, field)?;
    Ok(src.get_u32())
}

pub(crate) fn get_i32(src: &mut Bytes, field: &'static str) -> Result<i32, ProtocolError> {
    ensure(src, 4, field)?;
    Ok(src.get_i32())
}

pub(crate) fn get_u64(src: &mut Bytes, field: &'static str) -> Result<u64, ProtocolError> {
    ensure(src, 8, field)?;
    Ok(src.get_u64())
}

pub(crate) fn get_i64(src: &mut Bytes, field: &'static str) -> Result<i64, ProtocolError> {
    ensure(src, 8, field)?;
    Ok(src.get_i64())
}

/// Read a length-prefixed string.
///
/// Null (length −1) and empty strings both decode to the empty string;
/// the protocol does not distinguish them anywhere this client reads.
pub(crate) fn get_string(src: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    ensure(src, 2, field)?;
    let len = src.get_i16();
    if len <= 0 {
        return if len >= -1 {
            Ok(String::new())
        } else {
            Err(ProtocolError::InvalidLength {
                field,
                value: i64::from(len),
            })
        };
    }
    let len = usize::from(len.unsigned_abs());
    ensure(src, len, field)?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { field })
}

/// Read a length-prefixed byte array. Null (length −1) decodes as empty.
pub(crate) fn get_bytes(src: &mut Bytes, field: &'static str) -> Result<Bytes, ProtocolError> {
    ensure(src, 4, field)?;
    let len = src.get_i32();
    if len <= 0 {
        return if len >= -1 {
            Ok(Bytes::new())
        } else {
            Err(ProtocolError::InvalidLength {
                field,
                value: i64::from(len),
            })
        };
    }
    let len = len_to_usize(len.unsigned_abs());
    ensure(src, len, field)?;
    Ok(src.split_to(len))
}

/// Read an array or map element count.
pub(crate) fn get_array_len(src: &mut Bytes, field: &'static str) -> Result<usize, ProtocolError> {
    ensure(src, 4, field)?;
    let count = src.get_i32();
    if count < 0 {
        return Err(ProtocolError::InvalidLength {
            field,
            value: i64::from(count),
        });
    }
    Ok(len_to_usize(count.unsigned_abs()))
}

pub(crate) fn get_string_array(
    src: &mut Bytes,
    field: &'static str,
) -> Result<Vec<String>, ProtocolError> {
    let count = get_array_len(src, field)?;
    // Each element occupies at least its length prefix, so a corrupt count
    // cannot force an allocation larger than the remaining payload.
    let mut entries = Vec::with_capacity(count.min(src.remaining()));
    for _ in 0..count {
        entries.push(get_string(src, field)?);
    }
    Ok(entries)
}

pub(crate) fn get_string_map(
    src: &mut Bytes,
    field: &'static str,
) -> Result<Vec<(String, String)>, ProtocolError> {
    let count = get_array_len(src, field)?;
    let mut entries = Vec::with_capacity(count.min(src.remaining()));
    for _ in 0..count {
        let key = get_string(src, field)?;
        let value = get_string(src, field)?;
        entries.push((key, value));
    }
    Ok(entries)
}

/// Write a length-prefixed string.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidLength`] when the string exceeds the
/// `i16` length prefix.
pub(crate) fn put_string(dst: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    let len = i16::try_from(value.len()).map_err(|_| ProtocolError::InvalidLength {
        field: "string",
        value: i64::try_from(value.len()).unwrap_or(i64::MAX),
    })?;
    dst.put_i16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

/// Write an optional string, encoding `None` as length −1.
pub(crate) fn put_opt_string(dst: &mut BytesMut, value: Option<&str>) -> Result<(), ProtocolError> {
    match value {
        Some(v) => put_string(dst, v),
        None => {
            dst.put_i16(-1);
            Ok(())
        }
    }
}

/// Write a length-prefixed byte array.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidLength`] when the slice exceeds the
/// `i32` length prefix.
pub(crate) fn put_bytes(dst: &mut BytesMut, value: &[u8]) -> Result<(), ProtocolError> {
    let len = i32::try_from(value.len()).map_err(|_| ProtocolError::InvalidLength {
        field: "bytes",
        value: i64::try_from(value.len()).unwrap_or(i64::MAX),
    })?;
    dst.put_i32(len);
    dst.put_slice(value);
    Ok(())
}

pub(crate) fn put_array_len(
    dst: &mut BytesMut,
    field: &'static str,
    count: usize,
) -> Result<(), ProtocolError> {
    let count = i32::try_from(count).map_err(|_| ProtocolError::InvalidLength {
        field,
        value: i64::try_from(count).unwrap_or(i64::MAX),
    })?;
    dst.put_i32(count);
    Ok(())
}

pub(crate) fn put_string_map(
    dst: &mut BytesMut,
    entries: &[(String, String)],
) -> Result<(), ProtocolError> {
    put_array_len(dst, "map", entries.len())?;
    for (key, value) in entries {
        put_string(dst, key)?;
        put_string(dst, value)?;
    }
    Ok(())
}

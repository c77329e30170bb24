//! Message envelope carried inside stream entries.
//!
//! The broker stores entry bytes opaquely. `streamwire` wraps each payload
//! in a small envelope: a flags byte, an optional string-to-string
//! properties map in the protocol's map encoding, then the payload as a
//! length-prefixed byte array. A message without properties carries its
//! payload bytes unchanged inside the envelope.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{ProtocolError, wire};

/// Envelope flag bit marking a present properties map.
const FLAG_PROPERTIES: u8 = 0x01;

/// A message published to or delivered from a stream.
///
/// Properties are kept in a [`BTreeMap`] so the encoded envelope is
/// deterministic for a given message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    properties: BTreeMap<String, String>,
    payload: Bytes,
}

impl Message {
    /// Create a message holding `payload` with no properties.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            properties: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    /// Start building a message with properties.
    ///
    /// ```rust
    /// use streamwire::message::Message;
    ///
    /// let message = Message::builder()
    ///     .payload("order created")
    ///     .property("content-type", "text/plain")
    ///     .build();
    /// assert_eq!(message.property("content-type"), Some("text/plain"));
    /// ```
    #[must_use]
    pub fn builder() -> MessageBuilder { MessageBuilder::default() }

    /// The message payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes { &self.payload }

    /// All message properties, sorted by key.
    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, String> { &self.properties }

    /// Look up a single property value.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Serialize the envelope into entry bytes for publishing.
    pub(crate) fn to_entry(&self) -> Result<Bytes, ProtocolError> {
        let mut dst = BytesMut::new();
        if self.properties.is_empty() {
            dst.put_u8(0);
        } else {
            dst.put_u8(FLAG_PROPERTIES);
            wire::put_array_len(&mut dst, "message properties", self.properties.len())?;
            for (key, value) in &self.properties {
                wire::put_string(&mut dst, key)?;
                wire::put_string(&mut dst, value)?;
            }
        }
        wire::put_bytes(&mut dst, &self.payload)?;
        Ok(dst.freeze())
    }

    /// Parse an envelope out of delivered entry bytes.
    ///
    /// Flag bits beyond the properties marker are ignored so envelopes
    /// written by newer clients still yield their payload.
    pub(crate) fn from_entry(src: &mut Bytes) -> Result<Self, ProtocolError> {
        let flags = wire::get_u8(src, "message flags")?;
        let properties = if flags & FLAG_PROPERTIES == 0 {
            BTreeMap::new()
        } else {
            wire::get_string_map(src, "message properties")?
                .into_iter()
                .collect()
        };
        let payload = wire::get_bytes(src, "message payload")?;
        Ok(Self {
            properties,
            payload,
        })
    }
}

impl From<Bytes> for Message {
    fn from(payload: Bytes) -> Self { Self::new(payload) }
}

impl From<&'static str> for Message {
    fn from(payload: &'static str) -> Self { Self::new(payload) }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self { Self::new(payload) }
}

/// Chained builder for [`Message`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    properties: BTreeMap<String, String>,
    payload: Bytes,
}

impl MessageBuilder {
    /// Set the payload bytes.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Attach one property, replacing any previous value for the key.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Finish building the message.
    #[must_use]
    pub fn build(self) -> Message {
        Message {
            properties: self.properties,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use super::*;

    #[test]
    fn payload_only_message_has_a_bare_envelope() {
        let message = Message::new("hello");
        let entry = message.to_entry().expect("encode should succeed");
        assert_eq!(
            entry.as_ref(),
            &[0x00, 0x00, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']
        );

        let mut src = entry;
        let decoded = Message::from_entry(&mut src).expect("decode should succeed");
        assert_eq!(decoded, message);
        assert!(src.is_empty());
    }

    #[test]
    fn properties_encode_sorted_by_key() {
        let message = Message::builder()
            .payload("x")
            .property("zone", "eu")
            .property("app", "billing")
            .build();
        let entry = message.to_entry().expect("encode should succeed");

        assert_eq!(entry[0], 0x01);
        // Map count, then "app" before "zone" regardless of insertion order.
        assert_eq!(&entry[1..5], &[0x00, 0x00, 0x00, 0x02]);
        assert_eq!(&entry[5..10], &[0x00, 0x03, b'a', b'p', b'p']);

        let mut src = entry;
        let decoded = Message::from_entry(&mut src).expect("decode should succeed");
        assert_eq!(decoded, message);
        assert_eq!(decoded.property("zone"), Some("eu"));
    }

    #[rstest]
    #[case::empty(&[][..])]
    #[case::flags_only(&[0x00][..])]
    #[case::cut_payload(&[0x00, 0x00, 0x00, 0x00, 0x05, b'h', b'i'][..])]
    fn truncated_envelopes_are_rejected(#[case] bytes: &[u8]) {
        let mut src = Bytes::copy_from_slice(bytes);
        let err = Message::from_entry(&mut src).expect_err("expected a truncation error");
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn unknown_flag_bits_still_yield_the_payload() {
        let mut src = Bytes::from_static(&[0x04, 0x00, 0x00, 0x00, 0x02, b'o', b'k']);
        let decoded = Message::from_entry(&mut src).expect("decode should succeed");
        assert_eq!(decoded.payload().as_ref(), b"ok");
        assert!(decoded.properties().is_empty());
    }

    #[test]
    fn empty_payload_round_trips() {
        let message = Message::default();
        let mut entry = message.to_entry().expect("encode should succeed");
        let decoded = Message::from_entry(&mut entry).expect("decode should succeed");
        assert_eq!(decoded, message);
    }
}

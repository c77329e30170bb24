//! Subscription start positions.

use bytes::{BufMut, BytesMut};

/// Where a new subscription starts reading a stream.
///
/// `First`, `Last`, and `Next` are resolved by the broker against the
/// stream's current contents; `Offset` and `Timestamp` pin an absolute
/// position. Brokers deliver from chunk boundaries, so a subscription
/// pinned to an offset inside a chunk receives that whole chunk; the
/// consumer drops messages below the requested offset before yielding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OffsetSpecification {
    /// Start at the first chunk still present in the stream.
    First,
    /// Start at the chunk containing the last confirmed message.
    Last,
    /// Start at the next chunk the broker writes.
    #[default]
    Next,
    /// Start at the chunk containing this offset.
    Offset(u64),
    /// Start at the first chunk stamped at or after this millisecond UNIX
    /// timestamp.
    Timestamp(i64),
}

impl OffsetSpecification {
    pub(crate) fn put(self, dst: &mut BytesMut) {
        match self {
            Self::First => dst.put_u16(1),
            Self::Last => dst.put_u16(2),
            Self::Next => dst.put_u16(3),
            Self::Offset(offset) => {
                dst.put_u16(4);
                dst.put_u64(offset);
            }
            Self::Timestamp(millis) => {
                dst.put_u16(5);
                dst.put_i64(millis);
            }
        }
    }

    /// Offset below which delivered messages are filtered out client-side.
    pub(crate) fn filter_below(self) -> Option<u64> {
        match self {
            Self::Offset(offset) => Some(offset),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::OffsetSpecification;

    #[rstest]
    #[case(OffsetSpecification::First, &[0, 1])]
    #[case(OffsetSpecification::Last, &[0, 2])]
    #[case(OffsetSpecification::Next, &[0, 3])]
    #[case(OffsetSpecification::Offset(7), &[0, 4, 0, 0, 0, 0, 0, 0, 0, 7])]
    #[case(OffsetSpecification::Timestamp(-1), &[0, 5, 255, 255, 255, 255, 255, 255, 255, 255])]
    fn encodes_type_then_value(#[case] spec: OffsetSpecification, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        spec.put(&mut buf);
        assert_eq!(buf.as_ref(), expected);
    }

    #[test]
    fn only_absolute_offsets_filter() {
        assert_eq!(OffsetSpecification::Offset(42).filter_below(), Some(42));
        assert_eq!(OffsetSpecification::Next.filter_below(), None);
        assert_eq!(OffsetSpecification::Timestamp(5).filter_below(), None);
    }
}

//! Shared proptest helpers for codec property tests.

use bytes::{BufMut, Bytes, BytesMut};
use proptest::{
    collection::{btree_map, vec},
    prelude::{Just, Strategy, any, prop_oneof},
    test_runner::{Config as ProptestConfig, RngAlgorithm, TestRng, TestRunner},
};

use crate::{codec::Request, offset::OffsetSpecification};

pub fn deterministic_runner(cases: u32) -> TestRunner {
    let config = ProptestConfig {
        cases,
        ..ProptestConfig::default()
    };
    let rng = TestRng::deterministic_rng(RngAlgorithm::ChaCha);
    TestRunner::new_with_rng(config, rng)
}

pub fn name_strategy() -> impl Strategy<Value = String> {
    vec(proptest::char::range('a', 'z'), 1..24).prop_map(|chars| chars.into_iter().collect())
}

pub fn payload_strategy(max_len: usize) -> impl Strategy<Value = Bytes> {
    vec(any::<u8>(), 0..max_len.max(1)).prop_map(Bytes::from)
}

pub fn record_sequence_strategy(
    max_record_len: usize,
    max_records: usize,
) -> impl Strategy<Value = Vec<Bytes>> {
    vec(payload_strategy(max_record_len), 1..max_records.max(2))
}

fn offset_strategy() -> impl Strategy<Value = OffsetSpecification> {
    prop_oneof![
        Just(OffsetSpecification::First),
        Just(OffsetSpecification::Last),
        Just(OffsetSpecification::Next),
        any::<u64>().prop_map(OffsetSpecification::Offset),
        any::<i64>().prop_map(OffsetSpecification::Timestamp),
    ]
}

fn properties_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    btree_map(name_strategy(), name_strategy(), 0..4)
        .prop_map(|map| map.into_iter().collect())
}

fn messages_strategy() -> impl Strategy<Value = Vec<(u64, Bytes)>> {
    vec((any::<u64>(), payload_strategy(64)), 1..8)
}

/// One of every request shape the codec can emit, with generated fields.
pub fn request_strategy() -> impl Strategy<Value = Request> {
    prop_oneof![
        properties_strategy().prop_map(|properties| Request::PeerProperties {
            correlation_id: 1,
            properties,
        }),
        (any::<u32>(), name_strategy(), payload_strategy(48)).prop_map(
            |(correlation_id, mechanism, data)| Request::SaslAuthenticate {
                correlation_id,
                mechanism,
                data,
            }
        ),
        (any::<u32>(), name_strategy()).prop_map(|(correlation_id, virtual_host)| {
            Request::Open {
                correlation_id,
                virtual_host,
            }
        }),
        (
            any::<u32>(),
            any::<u8>(),
            proptest::option::of(name_strategy()),
            name_strategy(),
        )
            .prop_map(|(correlation_id, publisher_id, reference, stream)| {
                Request::DeclarePublisher {
                    correlation_id,
                    publisher_id,
                    reference,
                    stream,
                }
            }),
        (any::<u8>(), messages_strategy()).prop_map(|(publisher_id, messages)| {
            Request::Publish {
                publisher_id,
                messages,
            }
        }),
        (
            any::<u32>(),
            any::<u8>(),
            name_strategy(),
            offset_strategy(),
            any::<u16>(),
            properties_strategy(),
        )
            .prop_map(
                |(correlation_id, subscription_id, stream, offset, credit, properties)| {
                    Request::Subscribe {
                        correlation_id,
                        subscription_id,
                        stream,
                        offset,
                        credit,
                        properties,
                    }
                },
            ),
        (any::<u8>(), any::<u16>()).prop_map(|(subscription_id, credit)| Request::Credit {
            subscription_id,
            credit,
        }),
        (name_strategy(), name_strategy(), any::<u64>()).prop_map(
            |(reference, stream, offset)| Request::StoreOffset {
                reference,
                stream,
                offset,
            }
        ),
        (any::<u32>(), name_strategy(), properties_strategy()).prop_map(
            |(correlation_id, stream, arguments)| Request::CreateStream {
                correlation_id,
                stream,
                arguments,
            }
        ),
        (any::<u32>(), vec(name_strategy(), 1..4)).prop_map(|(correlation_id, streams)| {
            Request::Metadata {
                correlation_id,
                streams,
            }
        }),
        Just(Request::Heartbeat),
    ]
}

/// Serialize records into an osiris user chunk starting at `first_offset`.
pub fn encode_chunk(first_offset: u64, records: &[Bytes]) -> BytesMut {
    let mut data = BytesMut::new();
    for record in records {
        data.put_u32(u32::try_from(record.len()).expect("test record fits u32"));
        data.put_slice(record);
    }
    let mut chunk = BytesMut::new();
    chunk.put_u8(0x50);
    chunk.put_u8(0);
    chunk.put_u16(u16::try_from(records.len()).expect("test entry count fits u16"));
    chunk.put_u32(u32::try_from(records.len()).expect("test record count fits u32"));
    chunk.put_i64(0);
    chunk.put_u64(1);
    chunk.put_u64(first_offset);
    chunk.put_u32(crc32fast::hash(&data));
    chunk.put_u32(u32::try_from(data.len()).expect("test data fits u32"));
    chunk.put_u32(0);
    chunk.put_u32(0);
    chunk.extend_from_slice(&data);
    chunk
}

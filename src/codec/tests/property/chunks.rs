//! Generated checks for osiris chunk parsing inside deliver frames.

use bytes::{BufMut, Bytes, BytesMut};
use proptest::{
    prelude::any,
    prop_assert,
    prop_assert_eq,
    test_runner::TestCaseError,
};
use rstest::rstest;
use tokio_util::codec::Decoder;

use super::shared::{deterministic_runner, encode_chunk, record_sequence_strategy};
use crate::codec::{
    CodecError,
    FramingError,
    ServerFrame,
    StreamCodec,
    VERSION,
    frame::key,
};

/// Byte offset of the chunk data section inside a deliver frame.
const DATA_SECTION_START: usize = 4 + 2 + 2 + 1 + 48;

fn deliver_frame(subscription_id: u8, chunk: &[u8]) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.put_u16(key::DELIVER);
    payload.put_u16(VERSION);
    payload.put_u8(subscription_id);
    payload.put_slice(chunk);
    let mut buf = BytesMut::new();
    buf.put_u32(u32::try_from(payload.len()).expect("test frame fits u32"));
    buf.extend_from_slice(&payload);
    buf
}

fn decode_deliver(wire: &mut BytesMut) -> Result<(u8, crate::chunk::Chunk), TestCaseError> {
    let frame = StreamCodec::default()
        .decode(wire)
        .map_err(|err| TestCaseError::fail(format!("decode failed: {err}")))?
        .ok_or_else(|| TestCaseError::fail("missing frame during decode".to_owned()))?;
    match frame {
        ServerFrame::Deliver {
            subscription_id,
            chunk,
        } => Ok((subscription_id, chunk)),
        other => Err(TestCaseError::fail(format!(
            "expected a deliver frame, got {other:?}"
        ))),
    }
}

#[rstest]
#[case(128)]
fn generated_chunks_round_trip_through_deliver(#[case] cases: u32) {
    let mut runner = deterministic_runner(cases);
    let strategy = (any::<u64>(), any::<u8>(), record_sequence_strategy(64, 8));

    runner
        .run(&strategy, |(first_offset, subscription_id, records)| {
            let chunk_bytes = encode_chunk(first_offset, &records);
            let mut wire = deliver_frame(subscription_id, &chunk_bytes);

            let (decoded_id, chunk) = decode_deliver(&mut wire)?;
            prop_assert!(wire.is_empty());
            prop_assert_eq!(decoded_id, subscription_id);
            prop_assert_eq!(chunk.first_offset(), first_offset);
            prop_assert_eq!(usize::from(chunk.num_entries()), records.len());

            let decoded: Vec<Bytes> = chunk
                .records()
                .collect::<Result<_, _>>()
                .map_err(|err| TestCaseError::fail(format!("record parse failed: {err}")))?;
            prop_assert_eq!(decoded, records);
            Ok(())
        })
        .expect("generated chunks should round-trip through deliver frames");
}

#[rstest]
#[case(128)]
fn any_strict_prefix_of_a_deliver_frame_needs_more_data(#[case] cases: u32) {
    let mut runner = deterministic_runner(cases);
    let strategy = (any::<usize>(), record_sequence_strategy(32, 6));

    runner
        .run(&strategy, |(cut_seed, records)| {
            let chunk_bytes = encode_chunk(0, &records);
            let full = deliver_frame(1, &chunk_bytes);
            let cut = cut_seed % full.len();

            let mut prefix = BytesMut::from(&full[..cut]);
            let result = StreamCodec::default()
                .decode(&mut prefix)
                .map_err(|err| TestCaseError::fail(format!("prefix errored: {err}")))?;
            prop_assert!(result.is_none());
            prop_assert_eq!(prefix.len(), cut);
            Ok(())
        })
        .expect("strict prefixes should always request more data");
}

#[rstest]
#[case(128)]
fn corrupting_the_data_section_breaks_the_checksum(#[case] cases: u32) {
    let mut runner = deterministic_runner(cases);
    let strategy = (any::<usize>(), record_sequence_strategy(32, 6));

    runner
        .run(&strategy, |(flip_seed, records)| {
            let chunk_bytes = encode_chunk(0, &records);
            let mut wire = deliver_frame(1, &chunk_bytes);
            let data_len = wire.len() - DATA_SECTION_START;
            let flip = DATA_SECTION_START + flip_seed % data_len;
            wire[flip] ^= 0x01;

            match StreamCodec::default().decode(&mut wire) {
                Err(CodecError::Framing(FramingError::ChecksumMismatch { .. })) => Ok(()),
                other => Err(TestCaseError::fail(format!(
                    "expected a checksum mismatch, got {other:?}"
                ))),
            }
        })
        .expect("a flipped data byte should always fail the checksum");
}

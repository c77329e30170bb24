//! Generated checks for client request framing.

use bytes::BytesMut;
use proptest::{collection::vec, prop_assert, prop_assert_eq, test_runner::TestCaseError};
use rstest::rstest;
use tokio_util::codec::Encoder;

use super::shared::{deterministic_runner, request_strategy};
use crate::codec::{
    CodecError,
    FramingError,
    LENGTH_HEADER_SIZE,
    Request,
    StreamCodec,
    VERSION,
};

fn encode(codec: &mut StreamCodec, request: Request) -> Result<BytesMut, TestCaseError> {
    let mut buf = BytesMut::new();
    codec
        .encode(request, &mut buf)
        .map_err(|err| TestCaseError::fail(format!("encode failed: {err}")))?;
    Ok(buf)
}

fn declared_length(wire: &BytesMut) -> usize {
    let declared = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]);
    usize::try_from(declared).expect("u32 fits usize on supported targets")
}

#[rstest]
#[case(256)]
fn generated_requests_carry_a_correct_header(#[case] cases: u32) {
    let mut runner = deterministic_runner(cases);

    runner
        .run(&request_strategy(), |request| {
            let expected_key = request.wire_key();
            let mut codec = StreamCodec::default();
            let buf = encode(&mut codec, request)?;

            prop_assert!(buf.len() >= LENGTH_HEADER_SIZE + 4);
            prop_assert_eq!(declared_length(&buf), buf.len() - LENGTH_HEADER_SIZE);
            let key = u16::from_be_bytes([buf[4], buf[5]]);
            prop_assert_eq!(key, expected_key);
            let version = u16::from_be_bytes([buf[6], buf[7]]);
            prop_assert_eq!(version, VERSION);
            Ok(())
        })
        .expect("generated requests should frame correctly");
}

#[rstest]
#[case(96)]
fn generated_request_sequences_chain_without_gaps(#[case] cases: u32) {
    let mut runner = deterministic_runner(cases);
    let strategy = vec(request_strategy(), 1..12);

    runner
        .run(&strategy, |requests| {
            let expected = requests.len();
            let mut codec = StreamCodec::default();
            let mut wire = BytesMut::new();
            for request in requests {
                codec
                    .encode(request, &mut wire)
                    .map_err(|err| TestCaseError::fail(format!("encode failed: {err}")))?;
            }

            let mut frames = 0_usize;
            while !wire.is_empty() {
                prop_assert!(wire.len() >= LENGTH_HEADER_SIZE);
                let declared = declared_length(&wire);
                prop_assert!(wire.len() >= LENGTH_HEADER_SIZE + declared);
                let _ = wire.split_to(LENGTH_HEADER_SIZE + declared);
                frames += 1;
            }
            prop_assert_eq!(frames, expected);
            Ok(())
        })
        .expect("generated request sequences should pack back-to-back");
}

#[rstest]
#[case(128)]
fn frame_max_is_enforced_at_the_exact_boundary(#[case] cases: u32) {
    let mut runner = deterministic_runner(cases);

    runner
        .run(&request_strategy(), |request| {
            let mut roomy = StreamCodec::default();
            let size = encode(&mut roomy, request.clone())?.len();
            let wire_size = u32::try_from(size)
                .map_err(|_| TestCaseError::fail("encoded size exceeded u32".to_owned()))?;

            let mut exact = StreamCodec::new(wire_size);
            let exact_buf = encode(&mut exact, request.clone())?;
            prop_assert_eq!(exact_buf.len(), size);

            let mut tight = StreamCodec::new(wire_size - 1);
            let mut buf = BytesMut::new();
            match tight.encode(request, &mut buf) {
                Err(CodecError::Framing(FramingError::OversizedFrame { max, .. })) => {
                    prop_assert_eq!(max, size - 1);
                }
                other => {
                    return Err(TestCaseError::fail(format!(
                        "expected an oversized-frame error, got {other:?}"
                    )));
                }
            }
            prop_assert!(buf.is_empty());
            Ok(())
        })
        .expect("frame limit should reject at exactly one byte over");
}

//! Framing behaviour through the public codec API: resync after noise and
//! corruption, and chunked delivery.

use martylink::codec::{Decoded, Dialect, ELEM_JSON, FrameCodec, RicRestCodec, RosSerialCodec};
use martylink::{Frame, FrameKind, TopicId};
use proptest::prelude::*;

/// Feed `bytes` in `chunk`-sized reads, draining complete frames after each.
/// Returns the frames and the total number of discarded bytes.
fn decode_chunked(codec: &dyn FrameCodec, bytes: &[u8], chunk: usize) -> (Vec<Frame>, usize) {
    let mut buf = Vec::new();
    let mut frames = Vec::new();
    let mut discarded = 0;

    for piece in bytes.chunks(chunk.max(1)) {
        buf.extend_from_slice(piece);
        loop {
            match codec.decode(&buf) {
                Decoded::Frame { frame, consumed } => {
                    frames.push(frame);
                    buf.drain(..consumed);
                }
                Decoded::Discard { consumed, .. } => {
                    discarded += consumed;
                    buf.drain(..consumed);
                }
                Decoded::Incomplete => break,
            }
        }
    }
    (frames, discarded)
}

fn status(payload: &[u8]) -> Frame {
    Frame::new(TopicId::ROBOT_STATUS, FrameKind::Publish, payload.to_vec())
}

#[test]
fn binary_stream_recovers_from_noise_and_corruption() {
    let garbage = [0x00, 0x13, 0x42, 0x7F];
    let first = RosSerialCodec.encode(&status(&[0x01, 4])).unwrap();
    let mut corrupt = RosSerialCodec.encode(&status(&[0x01, 3])).unwrap();
    corrupt[8] ^= 0x10;
    let second = RosSerialCodec.encode(&status(&[0x00, 0])).unwrap();

    let stream = [&garbage[..], &first, &corrupt, &second].concat();
    for chunk in [1, 3, stream.len()] {
        let (frames, discarded) = decode_chunked(&RosSerialCodec, &stream, chunk);
        assert_eq!(frames, vec![status(&[0x01, 4]), status(&[0x00, 0])], "chunk {chunk}");
        assert_eq!(discarded, garbage.len() + corrupt.len(), "chunk {chunk}");
    }
}

#[test]
fn rest_stream_skips_leading_noise() {
    let payload = RicRestCodec::rest_payload(ELEM_JSON, r#"{"rslt":"ok"}"#);
    let reply = Frame::new(TopicId::RIC_REST, FrameKind::Response, payload).with_correlation(9);
    let stream = [&[0x10, 0x20, 0x30][..], &RicRestCodec.encode(&reply).unwrap()].concat();

    let (frames, discarded) = decode_chunked(&RicRestCodec, &stream, 2);
    assert_eq!(frames, vec![reply]);
    assert_eq!(discarded, 3);
}

fn robot_topic() -> impl Strategy<Value = TopicId> {
    prop_oneof![
        Just(TopicId::SMART_SERVOS),
        Just(TopicId::ACCEL),
        Just(TopicId::POWER_STATUS),
        Just(TopicId::ADDONS),
        Just(TopicId::ROBOT_STATUS),
    ]
}

proptest! {
    #[test]
    fn binary_frames_survive_any_chunking(
        items in prop::collection::vec((robot_topic(), prop::collection::vec(any::<u8>(), 0..200)), 1..8),
        chunk in 1usize..64,
    ) {
        let frames: Vec<Frame> = items
            .into_iter()
            .map(|(topic, payload)| Frame::new(topic, RosSerialCodec::kind_for(topic), payload))
            .collect();
        let wire: Vec<u8> = frames.iter().flat_map(|f| RosSerialCodec.encode(f).unwrap()).collect();

        let (decoded, discarded) = decode_chunked(&RosSerialCodec, &wire, chunk);
        prop_assert_eq!(decoded, frames);
        prop_assert_eq!(discarded, 0);
    }

    #[test]
    fn numbered_frames_keep_their_numbers(
        items in prop::collection::vec((1u8..=255, prop::collection::vec(any::<u8>(), 0..300)), 1..6),
        chunk in 1usize..64,
    ) {
        let frames: Vec<Frame> = items
            .into_iter()
            .map(|(msg_num, payload)| {
                Frame::new(TopicId::RIC_REST, FrameKind::Response, payload).with_correlation(msg_num)
            })
            .collect();
        let wire: Vec<u8> = frames.iter().flat_map(|f| RicRestCodec.encode(f).unwrap()).collect();

        let (decoded, _) = decode_chunked(&RicRestCodec, &wire, chunk);
        prop_assert_eq!(decoded, frames);
    }

    #[test]
    fn decoders_always_make_progress(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        for dialect in [Dialect::RosSerial, Dialect::RicRest] {
            let codec = dialect.codec();
            let mut rest = &bytes[..];
            loop {
                match codec.decode(rest) {
                    Decoded::Frame { consumed, .. } | Decoded::Discard { consumed, .. } => {
                        prop_assert!(consumed >= 1 && consumed <= rest.len());
                        rest = &rest[consumed..];
                    }
                    Decoded::Incomplete => break,
                }
            }
        }
    }
}

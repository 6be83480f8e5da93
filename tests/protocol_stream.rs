//! Framing and decoding over a realistic noisy byte stream, exercised the
//! way the acquisition loop feeds it: arbitrary chunk boundaries into one
//! long-lived accumulator.

use bytes::BytesMut;
use cx505_daq::protocol::{decode_frame, extract_frames, END_MARKER, START_MARKER};

fn frame(header: &str, measurement: &str) -> Vec<u8> {
    let mut v = vec![START_MARKER];
    v.extend_from_slice(header.as_bytes());
    v.push(0x17);
    v.extend_from_slice(measurement.as_bytes());
    v.push(END_MARKER);
    v.extend_from_slice(b"\r\n");
    v
}

#[test]
fn noisy_stream_in_small_chunks_yields_every_frame() {
    let mut stream = Vec::new();
    stream.extend_from_slice(b"\xff\x00 power-on noise ");
    stream.extend_from_slice(&frame(
        "#CX-505 S/N 123#READY",
        "\u{2}#001# 7.12 pH# 24.5 C# 24-06-2024# 13:45:01",
    ));
    stream.extend_from_slice(b"line glitch");
    stream.extend_from_slice(&frame(
        "#CX-505 S/N 123#READY",
        "\u{2}#002# 7,08 pH# 24.6 C",
    ));
    stream.extend_from_slice(&frame("#CX-505 S/N 123#HOLD", "\u{2}#003# ---- pH"));
    // Trailing partial frame: must stay buffered, not be emitted.
    stream.push(START_MARKER);
    stream.extend_from_slice(b"#CX-505 S/N 123#READY");

    // Feed in every chunk size from 1 to 7 bytes; the frames and their
    // decoded content must come out the same regardless of where the
    // boundaries fall.
    for chunk_size in 1..=7 {
        let mut accumulator = BytesMut::new();
        let mut frames = Vec::new();
        for chunk in stream.chunks(chunk_size) {
            accumulator.extend_from_slice(chunk);
            frames.extend(extract_frames(&mut accumulator));
        }
        assert_eq!(frames.len(), 3, "chunk size {chunk_size}");

        let first = decode_frame(&frames[0]).unwrap();
        assert_eq!(first.header.serial.as_deref(), Some("123"));
        assert_eq!(first.measurement.value, Some(7.12));
        assert_eq!(first.measurement.derived.get("value_ph"), Some(&7.12));
        assert!(first.measurement.timestamp.is_some());

        let second = decode_frame(&frames[1]).unwrap();
        assert_eq!(second.measurement.value, Some(7.08));

        let third = decode_frame(&frames[2]).unwrap();
        assert_eq!(third.header.status.as_deref(), Some("HOLD"));
        assert!(third.measurement.value.is_none());

        // The partial tail is still waiting for its end marker.
        assert!(!accumulator.is_empty());
        assert_eq!(accumulator[0], START_MARKER);
    }
}

#[test]
fn completing_the_buffered_partial_releases_it() {
    let mut accumulator = BytesMut::new();
    accumulator.extend_from_slice(&[START_MARKER]);
    accumulator.extend_from_slice(b"#CX-505#READY\x17\x02#004# 6.95 pH");
    assert!(extract_frames(&mut accumulator).is_empty());

    accumulator.extend_from_slice(&[END_MARKER, b'\r', b'\n']);
    let frames = extract_frames(&mut accumulator);
    assert_eq!(frames.len(), 1);
    // The line terminators travel with the frame, not the buffer.
    assert!(frames[0].ends_with(b"\r\n"));
    let decoded = decode_frame(&frames[0]).unwrap();
    assert_eq!(decoded.measurement.sequence.as_deref(), Some("004"));
    assert_eq!(decoded.measurement.value, Some(6.95));
    assert!(accumulator.is_empty());
}

#[test]
fn garbage_only_stream_yields_nothing_and_buffers_nothing() {
    let mut accumulator = BytesMut::new();
    accumulator.extend_from_slice(b"not a frame at all \xfe\xfd");
    assert!(extract_frames(&mut accumulator).is_empty());
    assert!(accumulator.is_empty());
}

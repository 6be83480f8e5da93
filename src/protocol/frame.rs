//! Frame extraction from an accumulating byte buffer.

use bytes::{Bytes, BytesMut};

/// Start-of-frame marker (SOH).
pub const START_MARKER: u8 = 0x01;
/// End-of-frame marker (ETX).
pub const END_MARKER: u8 = 0x03;

/// Extract every complete frame currently in `buffer`.
///
/// Scans for [`START_MARKER`], dropping any bytes that precede it. If no
/// [`END_MARKER`] has arrived yet the partial frame is left in the buffer for
/// the next call — the buffer is a long-lived accumulator across repeated
/// reads. Once an end marker is found, any CR/LF bytes immediately following
/// it are swallowed into the frame before the consumed bytes are removed.
///
/// Calling this repeatedly on an empty or garbage-only buffer is a no-op
/// beyond discarding the garbage.
pub fn extract_frames(buffer: &mut BytesMut) -> Vec<Bytes> {
    let mut frames = Vec::new();
    loop {
        let Some(start) = buffer.iter().position(|&b| b == START_MARKER) else {
            // No start marker anywhere: everything is garbage.
            buffer.clear();
            break;
        };
        if start > 0 {
            drop(buffer.split_to(start));
        }
        let Some(end) = buffer.iter().position(|&b| b == END_MARKER) else {
            // Partial frame; wait for more bytes.
            break;
        };
        let mut consumed = end + 1;
        while buffer
            .get(consumed)
            .is_some_and(|&b| b == b'\r' || b == b'\n')
        {
            consumed += 1;
        }
        frames.push(buffer.split_to(consumed).freeze());
    }
    frames
}

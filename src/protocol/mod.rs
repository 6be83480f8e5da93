//! CX-505 wire protocol: framing and field decoding.
//!
//! The meter emits control-character-delimited binary frames:
//!
//! ```text
//! 0x01  <header sections>  0x17  <measurement sections>  0x03  [0x0D 0x0A]
//! ```
//!
//! There is no length prefix, so framing is resynchronizing: extraction scans
//! forward from any corrupted prefix and a partial frame simply waits in the
//! accumulator for the next read. Field decoding is maximally permissive —
//! every optional section is positionally inferred and absence is not an
//! error, because the firmware omits trailing fields depending on mode.
//!
//! - [`frame`]: frame extraction from a long-lived byte accumulator
//! - [`decode`]: one frame → [`DecodedFrame`]
//! - [`units`]: unit-label slugging and physical-quantity alias tables

pub mod decode;
pub mod frame;
pub mod units;

pub use decode::{decode_frame, DecodedFrame, FrameHeader, Measurement};
pub use frame::{extract_frames, END_MARKER, START_MARKER};

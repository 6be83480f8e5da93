//! # CX-505 DAQ Core Library
//!
//! Acquisition core for Elmetron CX-505 laboratory pH/ORP/DO meters over a
//! serial line. The crate turns the meter's control-character-delimited
//! protocol into structured measurements and drives the instrument with
//! configured, scheduled commands — all sharing one exclusive transport.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: frame extraction from the raw byte stream and permissive
//!   decoding of frames into [`protocol::DecodedFrame`] records.
//! - **`command`**: the command catalog, single-command executor with
//!   retry/backoff, the schedule phase machine, and the background worker.
//! - **`acquisition`**: the top-level [`acquisition::AcquisitionLoop`] tying
//!   capture windows, scheduling, and session lifecycle together.
//! - **`transport`**: the [`transport::Transport`] seam plus the shipped
//!   serial and mock implementations.
//! - **`sink`**: ingestion and audit seams with line-delimited-JSON and
//!   tracing-backed implementations.
//! - **`config`**: TOML settings via the `config` crate, with semantic
//!   validation.
//! - **`error`**: layered error types (`thiserror`) for each subsystem.
//! - **`logging`**: `tracing` subscriber setup.

pub mod acquisition;
pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod sink;
pub mod transport;

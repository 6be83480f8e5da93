//! Custom error types for the acquisition core.
//!
//! The taxonomy follows the failure categories the acquisition loop has to keep
//! apart:
//!
//! - **`DecodeError`**: a malformed protocol frame. Logged and dropped; never
//!   fatal to the loop.
//! - **`TransportError`**: anything the byte transport reports — open failures,
//!   mid-window I/O errors, write failures. Open failures are retried with
//!   backoff; window failures force a handle re-open.
//! - **`CommandError`**: the outcome of an exhausted command attempt sequence.
//!   Distinguishes a response that never matched its expectation
//!   (`ExpectationMismatch`) from a hard I/O failure (`ExecutionFailed`), and a
//!   configuration error (`NoPayload`) raised before any I/O. The attempt count
//!   is carried on the variant so upstream logging reports the true number of
//!   tries.
//! - **`ConfigError`**: file parsing (wrapping the `config` crate) or semantic
//!   validation failures, caught before a session starts.
//!
//! No single command failure terminates the acquisition loop; only
//! configuration errors permanently disable the offending schedule slot.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Top-level error for binary and collaborator seams.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration loading or validation failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Command execution failure.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// I/O error outside the transport (e.g. sink files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A protocol frame that could not be decoded.
///
/// Decoding is pure and total: any byte slice yields either a
/// [`crate::protocol::DecodedFrame`] or one of these variants, never a panic
/// and never a partial record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame was empty or contained only whitespace.
    #[error("frame is empty or all-whitespace")]
    Empty,

    /// First byte was not the 0x01 start marker.
    #[error("frame does not begin with start marker (0x01)")]
    MissingStart,

    /// No 0x03 end marker present.
    #[error("frame has no end marker (0x03)")]
    MissingEnd,
}

/// Errors reported by a [`crate::transport::Transport`] implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The device could not be opened.
    #[error("failed to open device: {0}")]
    Open(String),

    /// A write to the device failed.
    #[error("device write failed: {0}")]
    Write(String),

    /// A capture window failed mid-read.
    #[error("capture window failed: {0}")]
    Window(String),

    /// The transport is not open.
    #[error("device not connected")]
    NotConnected,

    /// Underlying I/O error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Final outcome of an exhausted command attempt sequence.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The definition produced zero write payloads. Raised before any I/O;
    /// the schedule slot referencing this command is disabled for the session.
    #[error("command '{name}' defines neither a hex nor an ascii payload")]
    NoPayload {
        /// Offending command name.
        name: String,
    },

    /// The definition carried an invalid hex payload or expectation string.
    #[error("command '{name}' has invalid hex: {detail}")]
    BadHex {
        /// Offending command name.
        name: String,
        /// What failed to parse.
        detail: String,
    },

    /// The command ran but its response never matched the configured
    /// expectation prefix, across all attempts.
    #[error("command '{name}' response mismatch after {attempts} attempt(s)")]
    ExpectationMismatch {
        /// Command name.
        name: String,
        /// Total attempts made (retries + 1).
        attempts: u32,
    },

    /// A hard I/O failure persisted across all attempts.
    #[error("command '{name}' failed after {attempts} attempt(s): {source}")]
    ExecutionFailed {
        /// Command name.
        name: String,
        /// Total attempts made (retries + 1).
        attempts: u32,
        /// The last transport error observed.
        source: TransportError,
    },
}

impl CommandError {
    /// Attempt count carried by the terminal variants, if any.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            CommandError::ExpectationMismatch { attempts, .. }
            | CommandError::ExecutionFailed { attempts, .. } => Some(*attempts),
            CommandError::NoPayload { .. } | CommandError::BadHex { .. } => None,
        }
    }

    /// True for the variants that mark the command definition itself as
    /// unusable (as opposed to a transient runtime failure).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CommandError::NoPayload { .. } | CommandError::BadHex { .. }
        )
    }
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or parsed.
    #[error("configuration error: {0}")]
    Parse(#[from] config::ConfigError),

    /// Parsed fine but a value is semantically invalid.
    #[error("configuration validation error: {0}")]
    Validation(String),
}

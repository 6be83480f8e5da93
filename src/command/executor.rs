//! Executes one command definition against the transport.
//!
//! Write → settle delay → optional response capture window → optional
//! expectation check, wrapped in a linearly-backing-off retry loop. The final
//! error preserves whether exhaustion was due to expectation mismatches or
//! hard I/O failures, plus the true attempt count, for accurate logging
//! upstream.

use crate::command::catalog::CommandDefinition;
use crate::error::{CommandError, TransportError};
use crate::protocol::extract_frames;
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Outcome of one executed attempt sequence.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Command name.
    pub name: String,
    /// Total bytes written.
    pub bytes_written: usize,
    /// Complete frames collected from the response window.
    pub frames: Vec<Bytes>,
    /// Total bytes read in the response window.
    pub bytes_read: usize,
    /// Wall time of the successful attempt.
    pub elapsed: Duration,
    /// `Some(matched)` when an expectation is configured, `None` otherwise.
    pub expectation_matched: Option<bool>,
}

/// Terminal failure of an attempt sequence.
///
/// When the last attempt did run and return a response — i.e. the sequence
/// exhausted on expectation mismatches rather than hard I/O errors — the
/// attempt's [`CommandResult`] rides along so its frames still reach the
/// ingestion path.
#[derive(Debug)]
pub struct ExecuteFailure {
    /// The terminal error.
    pub error: CommandError,
    /// Result of the last attempt, when one completed.
    pub last_result: Option<CommandResult>,
}

impl From<CommandError> for ExecuteFailure {
    fn from(error: CommandError) -> Self {
        Self {
            error,
            last_result: None,
        }
    }
}

/// Execute `definition`, retrying up to `retries` extra times.
///
/// Attempt N (1-based) that fails — by transport error or expectation
/// mismatch — is retried after `backoff * N`. Returns the successful result
/// and the attempt number that produced it.
///
/// # Errors
/// Configuration errors ([`CommandError::NoPayload`]/[`CommandError::BadHex`])
/// are raised before any I/O. Otherwise the terminal
/// [`CommandError::ExpectationMismatch`] or [`CommandError::ExecutionFailed`]
/// carries `attempts = retries + 1`; a mismatch also carries the last
/// attempt's [`CommandResult`] (with `expectation_matched == Some(false)`).
pub async fn execute(
    transport: &mut dyn Transport,
    definition: &CommandDefinition,
    retries: u32,
    backoff: Duration,
) -> Result<(CommandResult, u32), ExecuteFailure> {
    let payloads = definition.payloads()?;
    let expected = definition.expected_prefix()?;
    let total_attempts = retries + 1;

    let mut last_error = CommandError::ExecutionFailed {
        name: definition.name.clone(),
        attempts: 0,
        source: TransportError::NotConnected,
    };
    let mut last_result = None;
    for attempt in 1..=total_attempts {
        match run_attempt(transport, definition, &payloads, expected.as_deref()).await {
            Ok(result) if result.expectation_matched != Some(false) => {
                return Ok((result, attempt));
            }
            Ok(result) => {
                tracing::debug!(
                    command = %definition.name,
                    attempt,
                    "response did not match expectation"
                );
                last_error = CommandError::ExpectationMismatch {
                    name: definition.name.clone(),
                    attempts: attempt,
                };
                last_result = Some(result);
            }
            Err(source) => {
                tracing::debug!(
                    command = %definition.name,
                    attempt,
                    error = %source,
                    "command attempt failed"
                );
                last_error = CommandError::ExecutionFailed {
                    name: definition.name.clone(),
                    attempts: attempt,
                    source,
                };
                last_result = None;
            }
        }
        if attempt < total_attempts {
            sleep(backoff * attempt).await;
        }
    }
    Err(ExecuteFailure {
        error: last_error,
        last_result,
    })
}

async fn run_attempt(
    transport: &mut dyn Transport,
    definition: &CommandDefinition,
    payloads: &[Vec<u8>],
    expected: Option<&[u8]>,
) -> Result<CommandResult, TransportError> {
    let started = Instant::now();
    let bytes_written = transport.write(payloads).await?;
    if !definition.post_delay.is_zero() {
        sleep(definition.post_delay).await;
    }

    let mut frames = Vec::new();
    let mut bytes_read = 0usize;
    if let Some(duration) = definition.read_duration {
        let mut accumulator = BytesMut::new();
        bytes_read = transport
            .run_window(duration, &mut |chunk| {
                accumulator.extend_from_slice(chunk);
            })
            .await?;
        frames = extract_frames(&mut accumulator);
    }

    let expectation_matched =
        expected.map(|prefix| frames.first().is_some_and(|f| f.starts_with(prefix)));

    Ok(CommandResult {
        name: definition.name.clone(),
        bytes_written,
        frames,
        bytes_read,
        elapsed: started.elapsed(),
        expectation_matched,
    })
}

//! Collaborator seams: measurement ingestion and the audit/event channel.
//!
//! Persistent storage and the health/diagnostics API live outside this crate;
//! the core only calls these two narrow traits. [`JsonlSink`] is the shipped
//! stand-in ingestion backend (line-delimited JSON), and [`TracingAuditSink`]
//! forwards audit events to the tracing subscriber.

use crate::error::DecodeError;
use crate::protocol::DecodedFrame;
use crate::transport::DeviceIdentity;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    /// Routine lifecycle event.
    Info,
    /// Degraded but recovered/recoverable behavior.
    Warning,
    /// Failure needing operator attention.
    Error,
}

/// Structured event emitted on every command completion, decode failure,
/// device-open failure, and capture-window failure. The sole channel other
/// subsystems observe core behavior through.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Severity.
    pub level: AuditLevel,
    /// Fixed category ("command", "decode", "device", "window", "session").
    pub category: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// When the event was created.
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    /// New event at the given level.
    pub fn new(
        level: AuditLevel,
        category: &'static str,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            level,
            category,
            message: message.into(),
            payload,
            at: Utc::now(),
        }
    }
}

/// Receives audit events. Implementations must be cheap and non-blocking;
/// they are called from the acquisition loop thread.
pub trait AuditSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: AuditEvent);
}

/// Receives decoded measurements. One call per successfully decoded frame and
/// one per malformed-frame event.
pub trait IngestSink: Send {
    /// Start a capture session for the opened device; returns a session id.
    fn begin_session(&mut self, identity: &DeviceIdentity) -> Result<u64>;

    /// Store one decoded frame (with its raw bytes); returns a record id.
    fn ingest_frame(&mut self, frame: &DecodedFrame, raw: &[u8]) -> Result<u64>;

    /// Note a malformed frame. A structured warning, never a crash.
    fn ingest_malformed(&mut self, raw: &[u8], error: &DecodeError);

    /// Close the current session, if any.
    fn end_session(&mut self);
}

/// Audit sink that forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match event.level {
            AuditLevel::Info => tracing::info!(
                category = event.category,
                payload = %event.payload,
                "{}",
                event.message
            ),
            AuditLevel::Warning => tracing::warn!(
                category = event.category,
                payload = %event.payload,
                "{}",
                event.message
            ),
            AuditLevel::Error => tracing::error!(
                category = event.category,
                payload = %event.payload,
                "{}",
                event.message
            ),
        }
    }
}

/// Line-delimited-JSON ingestion sink.
///
/// One JSON object per line: session markers, decoded frames, and malformed
/// frame warnings. Raw bytes are stored as lossy text so the file stays
/// greppable.
pub struct JsonlSink {
    writer: BufWriter<File>,
    next_record: u64,
    session: Option<u64>,
}

impl JsonlSink {
    /// Append to (or create) the file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            next_record: 1,
            session: None,
        })
    }

    fn write_line(&mut self, value: &serde_json::Value) -> Result<()> {
        serde_json::to_writer(&mut self.writer, value)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_record;
        self.next_record += 1;
        id
    }
}

impl IngestSink for JsonlSink {
    fn begin_session(&mut self, identity: &DeviceIdentity) -> Result<u64> {
        let id = self.next_id();
        self.session = Some(id);
        self.write_line(&json!({
            "kind": "session_start",
            "session": id,
            "device": identity,
            "at": Utc::now(),
        }))?;
        Ok(id)
    }

    fn ingest_frame(&mut self, frame: &DecodedFrame, raw: &[u8]) -> Result<u64> {
        let id = self.next_id();
        self.write_line(&json!({
            "kind": "frame",
            "record": id,
            "session": self.session,
            "frame": frame,
            "raw": String::from_utf8_lossy(raw),
        }))?;
        Ok(id)
    }

    fn ingest_malformed(&mut self, raw: &[u8], error: &DecodeError) {
        let line = json!({
            "kind": "malformed",
            "session": self.session,
            "error": error.to_string(),
            "raw": String::from_utf8_lossy(raw),
        });
        if let Err(e) = self.write_line(&line) {
            tracing::warn!(error = %e, "failed to record malformed frame");
        }
    }

    fn end_session(&mut self) {
        if let Some(id) = self.session.take() {
            let line = json!({
                "kind": "session_end",
                "session": id,
                "at": Utc::now(),
            });
            if let Err(e) = self.write_line(&line) {
                tracing::warn!(error = %e, "failed to record session end");
            }
        }
    }
}

/// Ingestion sink that only logs; used when no capture file is configured.
#[derive(Debug, Default)]
pub struct LoggingIngestSink {
    next_record: u64,
}

impl IngestSink for LoggingIngestSink {
    fn begin_session(&mut self, identity: &DeviceIdentity) -> Result<u64> {
        self.next_record += 1;
        tracing::info!(device = %identity.description, session = self.next_record, "session started");
        Ok(self.next_record)
    }

    fn ingest_frame(&mut self, frame: &DecodedFrame, _raw: &[u8]) -> Result<u64> {
        self.next_record += 1;
        tracing::debug!(
            sequence = frame.measurement.sequence.as_deref().unwrap_or("-"),
            value = frame.measurement.value,
            unit = frame.measurement.unit.as_deref().unwrap_or("-"),
            "frame ingested"
        );
        Ok(self.next_record)
    }

    fn ingest_malformed(&mut self, raw: &[u8], error: &DecodeError) {
        tracing::warn!(error = %error, bytes = raw.len(), "malformed frame dropped");
    }

    fn end_session(&mut self) {
        tracing::info!("session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_frame;
    use std::io::Read;

    fn sample_frame() -> (DecodedFrame, Vec<u8>) {
        let mut raw = vec![0x01];
        raw.extend_from_slice("#CX-505 S/N 1#READY\u{17}\u{2}#001# 7.00 pH".as_bytes());
        raw.push(0x03);
        (decode_frame(&raw).unwrap(), raw)
    }

    #[test]
    fn jsonl_sink_writes_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");
        let mut sink = JsonlSink::create(&path).unwrap();

        let identity = DeviceIdentity {
            model: Some("CX-505".into()),
            serial: None,
            description: "test".into(),
        };
        let session = sink.begin_session(&identity).unwrap();
        let (frame, raw) = sample_frame();
        let record = sink.ingest_frame(&frame, &raw).unwrap();
        assert!(record > session);
        sink.ingest_malformed(b"garbage", &DecodeError::MissingStart);
        sink.end_session();

        let mut text = String::new();
        File::open(&path).unwrap().read_to_string(&mut text).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        for line in &lines {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
        assert!(lines[0].contains("session_start"));
        assert!(lines[3].contains("session_end"));
    }
}

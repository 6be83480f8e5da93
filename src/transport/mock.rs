//! Simulated CX-505 meter.
//!
//! Emits protocol frames at a fixed cadence with small random jitter on the
//! pH and temperature values, and answers writes with a canned status frame.
//! Lets the binary and the integration tests run the full acquisition path
//! with no hardware attached.

use crate::error::TransportError;
use crate::protocol::{END_MARKER, START_MARKER};
use crate::transport::{ChunkSink, DeviceIdentity, Transport};
use async_trait::async_trait;
use chrono::Local;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// In-memory simulated meter.
pub struct MockMeter {
    open: bool,
    sequence: u32,
    rng: StdRng,
    frame_interval: Duration,
    /// Response queued by the last write, emitted at the start of the next
    /// capture window.
    pending_response: Option<Vec<u8>>,
}

impl MockMeter {
    /// Meter emitting one frame per second.
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    /// Meter with a custom frame cadence (tests use a few milliseconds).
    pub fn with_interval(frame_interval: Duration) -> Self {
        Self {
            open: false,
            sequence: 0,
            rng: StdRng::seed_from_u64(0x505),
            frame_interval,
            pending_response: None,
        }
    }

    fn build_frame(&mut self) -> Vec<u8> {
        self.sequence = self.sequence.wrapping_add(1);
        let ph = 7.0 + self.rng.gen_range(-0.05..0.05);
        let temp = 22.0 + self.rng.gen_range(-0.3..0.3);
        let now = Local::now();
        let body = format!(
            "#CX-505 S/N 50001#READY\u{17}\u{2}#{:03}# {ph:.2} pH# {temp:.1} C# {}# {}",
            self.sequence,
            now.format("%d-%m-%Y"),
            now.format("%H:%M:%S"),
        );
        let mut frame = vec![START_MARKER];
        frame.extend_from_slice(body.as_bytes());
        frame.push(END_MARKER);
        frame.extend_from_slice(b"\r\n");
        frame
    }

    fn build_ack(&self) -> Vec<u8> {
        let mut frame = vec![START_MARKER];
        frame.extend_from_slice("#CX-505 S/N 50001#OK\u{17}\u{2}#000# OK".as_bytes());
        frame.push(END_MARKER);
        frame.extend_from_slice(b"\r\n");
        frame
    }
}

impl Default for MockMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockMeter {
    async fn open(&mut self) -> Result<DeviceIdentity, TransportError> {
        self.open = true;
        self.sequence = 0;
        Ok(DeviceIdentity {
            model: Some("CX-505".to_string()),
            serial: Some("50001".to_string()),
            description: "simulated CX-505".to_string(),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        self.pending_response = None;
        Ok(())
    }

    async fn write(&mut self, payloads: &[Vec<u8>]) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }
        let written = payloads.iter().map(Vec::len).sum();
        self.pending_response = Some(self.build_ack());
        Ok(written)
    }

    async fn run_window(
        &mut self,
        duration: Duration,
        sink: ChunkSink<'_>,
    ) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }
        let deadline = Instant::now() + duration;
        let mut total = 0usize;
        if let Some(response) = self.pending_response.take() {
            total += response.len();
            sink(&response);
        }
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let step = self.frame_interval.min(deadline - now);
            sleep(step).await;
            if step < self.frame_interval {
                break;
            }
            let frame = self.build_frame();
            total += frame.len();
            sink(&frame);
        }
        Ok(total)
    }
}

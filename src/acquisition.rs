//! Top-level acquisition control loop.
//!
//! Owns the session lifecycle: open the device with bounded retry, start a
//! storage session, run startup commands, then alternate capture windows with
//! scheduled-command processing until stopped. A capture-window failure
//! forces a device re-open but is never fatal; only a stop request, a
//! configured open-retry cap, or the max-runtime budget ends the loop.
//!
//! Transport discipline: one mutex guards the shared handle. When async
//! commands are enabled the window uses a non-blocking lock attempt so a slow
//! scheduled command never stalls live polling indefinitely — on contention
//! the loop drains ready results, yields briefly, and retries.

use crate::command::executor::{self, CommandResult, ExecuteFailure};
use crate::command::{
    AsyncCommandWorker, CommandCatalog, CommandDefinition, CommandExecutionEvent, DispatchSource,
    ScheduledCommandConfig, ScheduledCommandState, WorkerTask,
};
use crate::config::{AcquisitionSettings, Settings};
use crate::error::{AppResult, CommandError, TransportError};
use crate::protocol::{decode_frame, extract_frames};
use crate::sink::{AuditEvent, AuditLevel, AuditSink, IngestSink};
use crate::transport::{DeviceIdentity, SharedTransport, Transport};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Depth of the worker dispatch and result queues.
const WORKER_QUEUE_CAPACITY: usize = 16;

/// Byte and frame counters accumulated across a run.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CaptureStats {
    /// Capture windows completed.
    pub windows: u64,
    /// Raw bytes read by capture windows.
    pub bytes_read: u64,
    /// Frames decoded successfully.
    pub frames_decoded: u64,
    /// Malformed frames dropped.
    pub decode_failures: u64,
    /// Command attempt sequences that succeeded.
    pub commands_completed: u64,
    /// Command attempt sequences that failed terminally.
    pub command_failures: u64,
}

/// The acquisition loop. Construct once per process, then [`run`].
///
/// [`run`]: AcquisitionLoop::run
pub struct AcquisitionLoop {
    settings: AcquisitionSettings,
    catalog: CommandCatalog,
    schedules: Vec<ScheduledCommandState>,
    transport: SharedTransport,
    ingest: Box<dyn IngestSink>,
    audit: Arc<dyn AuditSink>,
    stop: watch::Receiver<bool>,
    worker: Option<AsyncCommandWorker>,
    device: Option<DeviceIdentity>,
    accumulator: BytesMut,
    stats: CaptureStats,
}

impl AcquisitionLoop {
    /// Build the loop from settings and collaborators. `stop` is the
    /// cooperative stop flag, checked at loop-iteration granularity.
    pub fn new(
        settings: &Settings,
        transport: SharedTransport,
        ingest: Box<dyn IngestSink>,
        audit: Arc<dyn AuditSink>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let catalog = CommandCatalog::new(settings.commands.clone());
        let schedules = settings
            .schedule
            .iter()
            .cloned()
            .map(ScheduledCommandState::new)
            .collect();
        Self {
            settings: settings.acquisition.clone(),
            catalog,
            schedules,
            transport,
            ingest,
            audit,
            stop,
            worker: None,
            device: None,
            accumulator: BytesMut::new(),
            stats: CaptureStats::default(),
        }
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Current schedule states (inspection/testing).
    pub fn schedules(&self) -> &[ScheduledCommandState] {
        &self.schedules
    }

    /// Run until stopped or the max-runtime budget is spent.
    pub async fn run(&mut self) -> AppResult<()> {
        let deadline = self.settings.max_runtime.map(|d| Instant::now() + d);
        if self.settings.async_commands && self.worker.is_none() {
            self.worker = Some(AsyncCommandWorker::spawn(
                Arc::clone(&self.transport),
                self.stop.clone(),
                WORKER_QUEUE_CAPACITY,
            ));
        }

        loop {
            if self.stopped() {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::info!("max runtime reached");
                break;
            }
            if self.device.is_none() && !self.open_device().await {
                break;
            }
            match self.capture_window().await {
                Ok(()) => {}
                Err(err) => {
                    self.handle_window_failure(err).await;
                    continue;
                }
            }
            self.apply_ready_events();
            self.dispatch_due(Utc::now()).await;
        }

        self.shutdown().await;
        Ok(())
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Open with bounded retry. Returns false when stopped mid-retry or the
    /// configured attempt cap is reached.
    async fn open_device(&mut self) -> bool {
        let mut attempt: u32 = 0;
        loop {
            if self.stopped() {
                return false;
            }
            attempt += 1;
            let opened = {
                let transport = Arc::clone(&self.transport);
                let mut guard = transport.lock().await;
                guard.open().await
            };
            match opened {
                Ok(identity) => {
                    self.audit.record(AuditEvent::new(
                        AuditLevel::Info,
                        "device",
                        format!("device opened: {}", identity.description),
                        json!({ "identity": &identity, "attempt": attempt }),
                    ));
                    match self.ingest.begin_session(&identity) {
                        Ok(session) => tracing::info!(session, "storage session started"),
                        Err(err) => self.audit.record(AuditEvent::new(
                            AuditLevel::Error,
                            "session",
                            format!("failed to start storage session: {err}"),
                            json!({}),
                        )),
                    }
                    self.reset_schedules(Utc::now());
                    self.device = Some(identity);
                    self.run_startup_commands().await;
                    return true;
                }
                Err(err) => {
                    self.audit.record(AuditEvent::new(
                        AuditLevel::Warning,
                        "device",
                        format!("device open failed: {err}"),
                        json!({ "attempt": attempt }),
                    ));
                    if self.settings.open_retry_max.is_some_and(|cap| attempt >= cap) {
                        self.audit.record(AuditEvent::new(
                            AuditLevel::Error,
                            "device",
                            format!("giving up after {attempt} open attempts"),
                            json!({}),
                        ));
                        return false;
                    }
                    self.sleep_observing_stop(self.settings.open_retry_delay).await;
                }
            }
        }
    }

    /// Arm every schedule slot for the new session, disabling slots whose
    /// command name is not in the catalog.
    fn reset_schedules(&mut self, now: DateTime<Utc>) {
        for slot in &mut self.schedules {
            slot.reset(now);
        }
        for idx in 0..self.schedules.len() {
            let name = self.schedules[idx].config.command.clone();
            if !self.catalog.contains(&name) {
                self.schedules[idx].disable(format!("undefined command '{name}'"));
                self.audit.record(AuditEvent::new(
                    AuditLevel::Error,
                    "command",
                    format!("schedule references undefined command '{name}'; slot disabled"),
                    json!({ "slot": idx }),
                ));
            }
        }
    }

    /// Startup commands: the explicit startup list, then schedule entries
    /// flagged `run_on_startup`. All run synchronously before polling starts.
    async fn run_startup_commands(&mut self) {
        for name in self.settings.startup_commands.clone() {
            let Some(definition) = self.catalog.get(&name).cloned() else {
                self.audit.record(AuditEvent::new(
                    AuditLevel::Error,
                    "command",
                    format!("startup command '{name}' is not defined"),
                    json!({}),
                ));
                continue;
            };
            let (retries, backoff) = self.policy(None, &definition);
            let outcome = self.execute_locked(&definition, retries, backoff).await;
            self.finish_command(None, DispatchSource::Startup, &name, outcome);
        }

        for idx in 0..self.schedules.len() {
            let config = &self.schedules[idx].config;
            if !config.run_on_startup || !config.enabled || self.schedules[idx].is_exhausted() {
                continue;
            }
            let name = config.command.clone();
            let Some(definition) = self.catalog.get(&name).cloned() else {
                // reset_schedules already disabled and audited this slot
                continue;
            };
            let (retries, backoff) = self.policy(Some(&self.schedules[idx].config), &definition);
            self.schedules[idx].begin_dispatch(DispatchSource::Startup);
            let outcome = self.execute_locked(&definition, retries, backoff).await;
            self.finish_command(Some(idx), DispatchSource::Startup, &name, outcome);
        }
    }

    /// One capture window under the transport lock. With async commands the
    /// lock attempt is non-blocking; contention drains ready results and
    /// yields instead of stalling live polling behind a slow command.
    async fn capture_window(&mut self) -> Result<(), TransportError> {
        let window = self.settings.window;
        let transport = Arc::clone(&self.transport);
        if self.worker.is_some() {
            loop {
                if self.stopped() {
                    return Ok(());
                }
                match transport.try_lock() {
                    Ok(mut guard) => return self.windowed_read(guard.as_mut(), window).await,
                    Err(_) => {
                        self.apply_ready_events();
                        tokio::time::sleep(self.settings.contention_yield).await;
                    }
                }
            }
        } else {
            let mut guard = transport.lock().await;
            self.windowed_read(guard.as_mut(), window).await
        }
    }

    async fn windowed_read(
        &mut self,
        transport: &mut dyn Transport,
        window: Duration,
    ) -> Result<(), TransportError> {
        let mut harvested: Vec<Bytes> = Vec::new();
        let accumulator = &mut self.accumulator;
        let read = transport
            .run_window(window, &mut |chunk| {
                accumulator.extend_from_slice(chunk);
                harvested.extend(extract_frames(accumulator));
            })
            .await?;
        self.stats.windows += 1;
        self.stats.bytes_read += read as u64;
        tracing::debug!(read, frames = harvested.len(), "capture window complete");
        for frame in &harvested {
            self.ingest_raw(frame);
        }
        Ok(())
    }

    /// Decode one raw frame and hand it to the ingestion sink; malformed
    /// frames become structured warnings, never a crash.
    fn ingest_raw(&mut self, raw: &Bytes) {
        match decode_frame(raw) {
            Ok(frame) => {
                self.stats.frames_decoded += 1;
                if let Err(err) = self.ingest.ingest_frame(&frame, raw) {
                    tracing::warn!(error = %err, "ingestion sink failed");
                }
            }
            Err(err) => {
                self.stats.decode_failures += 1;
                self.ingest.ingest_malformed(raw, &err);
                self.audit.record(AuditEvent::new(
                    AuditLevel::Warning,
                    "decode",
                    format!("malformed frame dropped: {err}"),
                    json!({ "bytes": raw.len() }),
                ));
            }
        }
    }

    /// Drain and apply every ready worker event.
    fn apply_ready_events(&mut self) {
        let events = match &mut self.worker {
            Some(worker) => worker.drain_ready(),
            None => return,
        };
        for event in events {
            self.apply_event(event);
        }
    }

    /// Reconcile one completion event with its schedule slot. The event is
    /// applied only when the slot is still in flight with the same source
    /// tag; anything else is a stale echo and is discarded without mutating
    /// state.
    fn apply_event(&mut self, event: CommandExecutionEvent) {
        let Some(state) = self.schedules.get_mut(event.state_index) else {
            tracing::debug!(index = event.state_index, "event for unknown slot discarded");
            return;
        };
        if state.pending_source() != Some(event.source) {
            tracing::debug!(
                index = event.state_index,
                source = %event.source,
                "stale command event discarded"
            );
            return;
        }
        let name = state.config.command.clone();
        if event.config_error {
            state.disable(
                event
                    .error
                    .clone()
                    .unwrap_or_else(|| "configuration error".to_string()),
            );
        } else {
            state.mark_attempt(event.completed_at, event.success, event.error.clone());
        }

        self.record_completion(
            &name,
            event.source,
            event.success,
            event.mismatch,
            event.config_error,
            event.attempts,
            event.error.as_deref(),
            event.result.as_ref(),
        );
        if let Some(result) = &event.result {
            for frame in result.frames.clone() {
                self.ingest_raw(&frame);
            }
        }
    }

    /// Evaluate due schedule slots; dispatch each to the worker or run it
    /// inline, never both.
    async fn dispatch_due(&mut self, now: DateTime<Utc>) {
        for idx in 0..self.schedules.len() {
            if !self.schedules[idx].is_due(now) {
                continue;
            }
            let name = self.schedules[idx].config.command.clone();
            let Some(definition) = self.catalog.get(&name).cloned() else {
                self.schedules[idx].disable(format!("undefined command '{name}'"));
                self.audit.record(AuditEvent::new(
                    AuditLevel::Error,
                    "command",
                    format!("schedule references undefined command '{name}'; slot disabled"),
                    json!({ "slot": idx }),
                ));
                continue;
            };
            let (retries, backoff) = self.policy(Some(&self.schedules[idx].config), &definition);

            if let Some(worker) = &self.worker {
                let task = WorkerTask::Execute {
                    state_index: idx,
                    source: DispatchSource::Schedule,
                    definition,
                    retries,
                    backoff,
                };
                if worker.try_enqueue(task) {
                    self.schedules[idx].begin_dispatch(DispatchSource::Schedule);
                } else {
                    // Queue full: keep the slot armed and retry next cycle.
                    tracing::warn!(command = %name, "worker queue full; dispatch deferred");
                }
            } else {
                self.schedules[idx].begin_dispatch(DispatchSource::Schedule);
                let outcome = self.execute_locked(&definition, retries, backoff).await;
                self.finish_command(Some(idx), DispatchSource::Schedule, &name, outcome);
            }
        }
    }

    /// Resolve the retry policy: schedule override → calibration-category
    /// override → command default → global default.
    fn policy(
        &self,
        schedule: Option<&ScheduledCommandConfig>,
        definition: &CommandDefinition,
    ) -> (u32, Duration) {
        let is_calibration = schedule.is_some_and(|s| s.calibration_label.is_some());
        let retries = schedule
            .and_then(|s| s.retries)
            .or(if is_calibration {
                self.settings.calibration_retries
            } else {
                None
            })
            .or(definition.retries)
            .unwrap_or(self.settings.default_retries);
        let backoff = schedule
            .and_then(|s| s.backoff)
            .or(if is_calibration {
                self.settings.calibration_backoff
            } else {
                None
            })
            .or(definition.backoff)
            .unwrap_or(self.settings.default_backoff);
        (retries, backoff)
    }

    async fn execute_locked(
        &mut self,
        definition: &CommandDefinition,
        retries: u32,
        backoff: Duration,
    ) -> Result<(CommandResult, u32), ExecuteFailure> {
        let transport = Arc::clone(&self.transport);
        let mut guard = transport.lock().await;
        executor::execute(guard.as_mut(), definition, retries, backoff).await
    }

    /// Apply a synchronous execution outcome: audit, ingest, state update.
    /// Frames returned by a mismatched response are ingested just like a
    /// success's.
    fn finish_command(
        &mut self,
        slot: Option<usize>,
        source: DispatchSource,
        name: &str,
        outcome: Result<(CommandResult, u32), ExecuteFailure>,
    ) {
        match outcome {
            Ok((result, attempts)) => {
                if let Some(idx) = slot {
                    self.schedules[idx].mark_attempt(Utc::now(), true, None);
                }
                self.record_completion(name, source, true, false, false, attempts, None, Some(&result));
                for frame in result.frames {
                    self.ingest_raw(&frame);
                }
            }
            Err(ExecuteFailure { error, last_result }) => {
                let mismatch = matches!(error, CommandError::ExpectationMismatch { .. });
                let config_error = error.is_configuration();
                let attempts = error.attempts().unwrap_or(0);
                let text = error.to_string();
                if let Some(idx) = slot {
                    if config_error {
                        self.schedules[idx].disable(text.clone());
                    } else {
                        self.schedules[idx].mark_attempt(Utc::now(), false, Some(text.clone()));
                    }
                }
                self.record_completion(
                    name,
                    source,
                    false,
                    mismatch,
                    config_error,
                    attempts,
                    Some(&text),
                    last_result.as_ref(),
                );
                if let Some(result) = last_result {
                    for frame in result.frames {
                        self.ingest_raw(&frame);
                    }
                }
            }
        }
    }

    /// Audit one command completion. Mismatches and runtime failures are
    /// warnings; configuration errors are errors; successes are info.
    #[allow(clippy::too_many_arguments)]
    fn record_completion(
        &mut self,
        name: &str,
        source: DispatchSource,
        success: bool,
        mismatch: bool,
        config_error: bool,
        attempts: u32,
        error: Option<&str>,
        result: Option<&CommandResult>,
    ) {
        if success {
            self.stats.commands_completed += 1;
        } else {
            self.stats.command_failures += 1;
        }
        let level = if success {
            AuditLevel::Info
        } else if config_error {
            AuditLevel::Error
        } else {
            AuditLevel::Warning
        };
        let message = if success {
            format!("command '{name}' completed")
        } else if mismatch {
            format!("command '{name}' response mismatch")
        } else {
            format!("command '{name}' failed")
        };
        self.audit.record(AuditEvent::new(
            level,
            "command",
            message,
            json!({
                "source": source.to_string(),
                "attempts": attempts,
                "mismatch": mismatch,
                "error": error,
                "bytes_read": result.map(|r| r.bytes_read),
                "frames": result.map(|r| r.frames.len()),
                "expectation_matched": result.and_then(|r| r.expectation_matched),
            }),
        ));
    }

    /// A capture-window failure forces a re-open; it is never fatal.
    async fn handle_window_failure(&mut self, err: TransportError) {
        self.audit.record(AuditEvent::new(
            AuditLevel::Error,
            "window",
            format!("capture window failed: {err}"),
            json!({}),
        ));
        {
            let transport = Arc::clone(&self.transport);
            let mut guard = transport.lock().await;
            if let Err(close_err) = guard.close().await {
                tracing::warn!(error = %close_err, "close after window failure failed");
            }
        }
        self.device = None;
        self.sleep_observing_stop(self.settings.restart_delay).await;
    }

    /// Drain remaining results, end the session, stop the worker, close the
    /// transport.
    async fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let events = worker.shutdown(self.settings.worker_join_timeout).await;
            for event in events {
                self.apply_event(event);
            }
        }
        self.ingest.end_session();
        {
            let transport = Arc::clone(&self.transport);
            let mut guard = transport.lock().await;
            if let Err(err) = guard.close().await {
                tracing::warn!(error = %err, "transport close failed at shutdown");
            }
        }
        self.device = None;
        self.audit.record(AuditEvent::new(
            AuditLevel::Info,
            "session",
            "acquisition stopped",
            json!(self.stats),
        ));
    }

    async fn sleep_observing_stop(&mut self, duration: Duration) {
        let mut stop = self.stop.clone();
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            changed = stop.changed() => {
                let _ = changed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::schedule::SchedulePhase;
    use crate::sink::LoggingIngestSink;
    use crate::transport::mock::MockMeter;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAudit {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl AuditSink for RecordingAudit {
        fn record(&self, event: AuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn settings_with_schedule(entries: Vec<ScheduledCommandConfig>) -> Settings {
        let mut commands = HashMap::new();
        commands.insert(
            "status".to_string(),
            CommandDefinition {
                name: String::new(),
                write_hex: None,
                write_ascii: Some("S\r".into()),
                post_delay: Duration::ZERO,
                read_duration: None,
                expect_hex: None,
                expect_ascii: None,
                retries: None,
                backoff: None,
            },
        );
        Settings {
            log_level: "info".into(),
            log_format: crate::config::LogFormat::Pretty,
            device: crate::config::DeviceSettings {
                kind: crate::config::DeviceKind::Mock,
                port: None,
                baud: 9600,
            },
            acquisition: AcquisitionSettings::default(),
            output: crate::config::OutputSettings::default(),
            commands,
            schedule: entries,
        }
    }

    fn schedule_entry(command: &str) -> ScheduledCommandConfig {
        ScheduledCommandConfig {
            command: command.into(),
            run_on_startup: false,
            interval: Some(Duration::from_secs(5)),
            first_delay: Duration::ZERO,
            max_runs: None,
            retries: None,
            backoff: None,
            calibration_label: None,
            enabled: true,
        }
    }

    fn build_loop(settings: &Settings) -> (AcquisitionLoop, Arc<RecordingAudit>, watch::Sender<bool>) {
        let transport = crate::transport::shared(Box::new(MockMeter::new()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let audit = Arc::new(RecordingAudit::default());
        let looper = AcquisitionLoop::new(
            settings,
            transport,
            Box::new(LoggingIngestSink::default()),
            Arc::clone(&audit) as Arc<dyn AuditSink>,
            stop_rx,
        );
        (looper, audit, stop_tx)
    }

    #[test]
    fn policy_resolution_order() {
        let mut settings = settings_with_schedule(vec![]);
        settings.acquisition.default_retries = 1;
        settings.acquisition.calibration_retries = Some(7);
        let (looper, _audit, _stop) = build_loop(&settings);

        let mut definition = looper.catalog.get("status").cloned().unwrap();

        // Global default when nothing else is set.
        assert_eq!(looper.policy(None, &definition).0, 1);

        // Command default beats the global default.
        definition.retries = Some(3);
        assert_eq!(looper.policy(None, &definition).0, 3);

        // Calibration label pulls the category override.
        let mut entry = schedule_entry("status");
        entry.calibration_label = Some("pH7".into());
        assert_eq!(looper.policy(Some(&entry), &definition).0, 7);

        // Explicit schedule override wins over everything.
        entry.retries = Some(9);
        assert_eq!(looper.policy(Some(&entry), &definition).0, 9);
    }

    #[test]
    fn stale_event_is_discarded_without_mutating_state() {
        let settings = settings_with_schedule(vec![schedule_entry("status")]);
        let (mut looper, _audit, _stop) = build_loop(&settings);
        let now = Utc::now();
        looper.reset_schedules(now);
        looper.schedules[0].begin_dispatch(DispatchSource::Schedule);

        // Event tagged "startup" arriving after the pending source became
        // "schedule" must not mutate runs or last_error.
        let stale = CommandExecutionEvent {
            state_index: 0,
            source: DispatchSource::Startup,
            success: false,
            mismatch: false,
            config_error: false,
            attempts: 2,
            result: None,
            error: Some("stale failure".into()),
            completed_at: now,
        };
        looper.apply_event(stale);
        assert_eq!(looper.schedules[0].runs(), 0);
        assert_eq!(looper.schedules[0].last_error(), None);
        assert_eq!(
            looper.schedules[0].pending_source(),
            Some(DispatchSource::Schedule)
        );

        // The matching event applies normally.
        let fresh = CommandExecutionEvent {
            state_index: 0,
            source: DispatchSource::Schedule,
            success: true,
            mismatch: false,
            config_error: false,
            attempts: 1,
            result: None,
            error: None,
            completed_at: now,
        };
        looper.apply_event(fresh);
        assert_eq!(looper.schedules[0].runs(), 1);
    }

    #[test]
    fn mismatched_response_frames_still_reach_the_sink() {
        let settings = settings_with_schedule(vec![schedule_entry("status")]);
        let (mut looper, _audit, _stop) = build_loop(&settings);
        let now = Utc::now();
        looper.reset_schedules(now);
        looper.schedules[0].begin_dispatch(DispatchSource::Schedule);

        let mut frame = vec![0x01u8];
        frame.extend_from_slice(b"#CX-505 S/N 1#READY\x17\x02#001# 7.00 pH");
        frame.push(0x03);
        looper.apply_event(CommandExecutionEvent {
            state_index: 0,
            source: DispatchSource::Schedule,
            success: false,
            mismatch: true,
            config_error: false,
            attempts: 2,
            result: Some(CommandResult {
                name: "status".into(),
                bytes_written: 2,
                frames: vec![Bytes::from(frame)],
                bytes_read: 40,
                elapsed: Duration::from_millis(5),
                expectation_matched: Some(false),
            }),
            error: Some("command 'status' response mismatch after 2 attempt(s)".into()),
            completed_at: now,
        });

        // The mismatched response's frame was decoded and handed to the sink.
        assert_eq!(looper.stats().frames_decoded, 1);
        assert_eq!(looper.stats().command_failures, 1);
        // A mismatch counts as a completed attempt sequence, not a stop.
        assert_eq!(looper.schedules[0].runs(), 1);
        assert!(looper.schedules[0].last_error().is_some());
    }

    #[test]
    fn event_for_unknown_slot_is_ignored() {
        let settings = settings_with_schedule(vec![]);
        let (mut looper, _audit, _stop) = build_loop(&settings);
        looper.apply_event(CommandExecutionEvent {
            state_index: 42,
            source: DispatchSource::Schedule,
            success: true,
            mismatch: false,
            config_error: false,
            attempts: 1,
            result: None,
            error: None,
            completed_at: Utc::now(),
        });
        // No panic, no state.
        assert!(looper.schedules().is_empty());
    }

    #[test]
    fn config_error_event_disables_the_slot() {
        let settings = settings_with_schedule(vec![schedule_entry("status")]);
        let (mut looper, audit, _stop) = build_loop(&settings);
        looper.reset_schedules(Utc::now());
        looper.schedules[0].begin_dispatch(DispatchSource::Schedule);
        looper.apply_event(CommandExecutionEvent {
            state_index: 0,
            source: DispatchSource::Schedule,
            success: false,
            mismatch: false,
            config_error: true,
            attempts: 0,
            result: None,
            error: Some("command 'status' defines neither a hex nor an ascii payload".into()),
            completed_at: Utc::now(),
        });
        assert!(looper.schedules[0].is_exhausted());
        assert!(looper.schedules[0].last_error().is_some());

        let events = audit.events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| e.level == AuditLevel::Error && e.category == "command"));
    }

    #[test]
    fn undefined_schedule_command_is_disabled_at_reset() {
        let settings = settings_with_schedule(vec![schedule_entry("ghost")]);
        let (mut looper, _audit, _stop) = build_loop(&settings);
        looper.reset_schedules(Utc::now());
        assert!(looper.schedules[0].is_exhausted());
        assert_eq!(
            looper.schedules[0].last_error(),
            Some("undefined command 'ghost'")
        );
    }

    #[tokio::test]
    async fn due_check_does_not_double_dispatch_in_flight_slots() {
        let settings = settings_with_schedule(vec![schedule_entry("status")]);
        let (mut looper, _audit, _stop) = build_loop(&settings);
        let now = Utc::now();
        looper.reset_schedules(now);

        // Simulate an in-flight dispatch, then run the due check twice.
        looper.schedules[0].begin_dispatch(DispatchSource::Schedule);
        looper.dispatch_due(now).await;
        looper.dispatch_due(now).await;
        assert_eq!(
            looper.schedules[0].phase(),
            SchedulePhase::InFlight {
                source: DispatchSource::Schedule
            }
        );
        assert_eq!(looper.schedules[0].runs(), 0);
    }
}

//! Full acquisition runs against the simulated meter: capture windows,
//! startup commands, scheduling, and capture-file output, with no hardware.

use cx505_daq::acquisition::AcquisitionLoop;
use cx505_daq::config::Settings;
use cx505_daq::sink::{JsonlSink, LoggingIngestSink, TracingAuditSink};
use cx505_daq::transport::{self, mock::MockMeter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn settings(extra: &str) -> Settings {
    let base = r#"
        [device]
        kind = "mock"

        [acquisition]
        window = "20ms"
        contention_yield = "5ms"
        restart_delay = "10ms"
        default_retries = 0
        default_backoff = "10ms"

        [commands.identify]
        write_ascii = "ID\r"
        read_duration = "10ms"
        expect_ascii = "\u0001#CX-505"

        [commands.status]
        write_ascii = "S\r"
        read_duration = "10ms"
    "#;
    let settings: Settings = toml::from_str(&format!("{base}\n{extra}")).expect("fixture parses");
    settings.validate().expect("fixture validates");
    settings
}

fn build(settings: &Settings) -> (AcquisitionLoop, watch::Sender<bool>) {
    let meter = MockMeter::with_interval(Duration::from_millis(5));
    let (stop_tx, stop_rx) = watch::channel(false);
    let looper = AcquisitionLoop::new(
        settings,
        transport::shared(Box::new(meter)),
        Box::new(LoggingIngestSink::default()),
        Arc::new(TracingAuditSink),
        stop_rx,
    );
    (looper, stop_tx)
}

#[tokio::test]
async fn bounded_run_captures_and_decodes_frames() {
    let mut settings = settings("");
    settings.acquisition.max_runtime = Some(Duration::from_millis(300));
    settings.acquisition.async_commands = false;

    let (mut looper, _stop) = build(&settings);
    looper.run().await.unwrap();

    let stats = looper.stats();
    assert!(stats.windows >= 2, "windows: {}", stats.windows);
    assert!(stats.bytes_read > 0);
    assert!(stats.frames_decoded > 0, "no frames decoded");
    assert_eq!(stats.decode_failures, 0);
}

#[tokio::test]
async fn startup_command_runs_and_schedule_exhausts_at_max_runs() {
    let mut settings = settings(
        r#"
        [[schedule]]
        command = "status"
        interval = "50ms"
        first_delay = "0s"
        max_runs = 2
        "#,
    );
    settings.acquisition.startup_commands = vec!["identify".to_string()];
    settings.acquisition.async_commands = false;
    settings.acquisition.max_runtime = Some(Duration::from_millis(500));

    let (mut looper, _stop) = build(&settings);
    looper.run().await.unwrap();

    let stats = looper.stats();
    // identify at startup plus two scheduled status runs.
    assert!(stats.commands_completed >= 3, "completed: {}", stats.commands_completed);
    assert_eq!(stats.command_failures, 0);

    let slot = &looper.schedules()[0];
    assert_eq!(slot.runs(), 2);
    assert!(slot.is_exhausted());
}

#[tokio::test]
async fn stop_signal_ends_an_unbounded_run() {
    let mut settings = settings("");
    settings.acquisition.async_commands = true;
    let (mut looper, stop) = build(&settings);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        stop.send(true).ok();
    });
    looper.run().await.unwrap();
    assert!(looper.stats().windows >= 1);
}

#[tokio::test]
async fn worker_path_completes_scheduled_commands() {
    let mut settings = settings(
        r#"
        [[schedule]]
        command = "status"
        interval = "40ms"
        first_delay = "0s"
        "#,
    );
    settings.acquisition.async_commands = true;
    settings.acquisition.max_runtime = Some(Duration::from_millis(500));

    let (mut looper, _stop) = build(&settings);
    looper.run().await.unwrap();

    let stats = looper.stats();
    assert!(stats.commands_completed >= 1, "completed: {}", stats.commands_completed);
    assert!(looper.schedules()[0].runs() >= 1);
}

#[tokio::test]
async fn jsonl_capture_file_records_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.jsonl");

    let mut settings = settings("");
    settings.acquisition.async_commands = false;
    settings.acquisition.max_runtime = Some(Duration::from_millis(200));

    let meter = MockMeter::with_interval(Duration::from_millis(5));
    let (_stop_tx, stop_rx) = watch::channel(false);
    let mut looper = AcquisitionLoop::new(
        &settings,
        transport::shared(Box::new(meter)),
        Box::new(JsonlSink::create(&path).unwrap()),
        Arc::new(TracingAuditSink),
        stop_rx,
    );
    looper.run().await.unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines.len() >= 3, "lines: {}", lines.len());
    for line in &lines {
        serde_json::from_str::<serde_json::Value>(line).unwrap();
    }
    assert!(lines.first().unwrap().contains("session_start"));
    assert!(lines.last().unwrap().contains("session_end"));
    assert!(text.contains("\"kind\":\"frame\""));
}

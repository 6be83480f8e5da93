//! Background command worker.
//!
//! A single consumer task pulls queued commands, runs each under the shared
//! transport lock, and pushes a completion event for every task — success,
//! mismatch, and hard failure alike; a task is never dropped silently. The
//! acquisition loop drains the results channel before checking new due
//! commands and once more at final shutdown, so no result is lost even if the
//! loop exits mid-cycle.

use crate::command::catalog::CommandDefinition;
use crate::command::executor::{self, CommandResult, ExecuteFailure};
use crate::command::schedule::DispatchSource;
use crate::error::CommandError;
use crate::transport::SharedTransport;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Work queued for the background worker.
#[derive(Debug)]
pub enum WorkerTask {
    /// Run one command and report back.
    Execute {
        /// Index of the originating schedule slot.
        state_index: usize,
        /// Dispatch origin, echoed on the completion event.
        source: DispatchSource,
        /// Command to run.
        definition: CommandDefinition,
        /// Extra attempts after the first.
        retries: u32,
        /// Backoff base for failed attempts.
        backoff: Duration,
    },
    /// Sentinel for clean shutdown.
    Shutdown,
}

/// Completion event for one executed attempt sequence.
#[derive(Debug)]
pub struct CommandExecutionEvent {
    /// Index of the originating schedule slot.
    pub state_index: usize,
    /// Dispatch origin; must match the slot's pending source to be applied.
    pub source: DispatchSource,
    /// Whether the attempt sequence succeeded.
    pub success: bool,
    /// True when the terminal failure was an expectation mismatch.
    pub mismatch: bool,
    /// True when the failure was a configuration error (slot must be
    /// disabled, not retried).
    pub config_error: bool,
    /// Attempts made (0 when the command never reached I/O).
    pub attempts: u32,
    /// Result of the last attempt that produced a response: the successful
    /// one, or the final mismatched one. Its frames are ingested either way.
    pub result: Option<CommandResult>,
    /// Terminal error text, when the sequence failed.
    pub error: Option<String>,
    /// Completion timestamp.
    pub completed_at: DateTime<Utc>,
}

impl CommandExecutionEvent {
    /// Build an event from an executor outcome.
    pub fn from_outcome(
        state_index: usize,
        source: DispatchSource,
        outcome: Result<(CommandResult, u32), ExecuteFailure>,
    ) -> Self {
        let completed_at = Utc::now();
        match outcome {
            Ok((result, attempts)) => Self {
                state_index,
                source,
                success: true,
                mismatch: false,
                config_error: false,
                attempts,
                result: Some(result),
                error: None,
                completed_at,
            },
            Err(failure) => Self {
                state_index,
                source,
                success: false,
                mismatch: matches!(failure.error, CommandError::ExpectationMismatch { .. }),
                config_error: failure.error.is_configuration(),
                attempts: failure.error.attempts().unwrap_or(0),
                result: failure.last_result,
                error: Some(failure.error.to_string()),
                completed_at,
            },
        }
    }
}

/// Handle to the spawned worker task.
pub struct AsyncCommandWorker {
    tasks: mpsc::Sender<WorkerTask>,
    results: mpsc::Receiver<CommandExecutionEvent>,
    handle: JoinHandle<()>,
}

impl AsyncCommandWorker {
    /// Spawn the worker on the current runtime.
    pub fn spawn(
        transport: SharedTransport,
        stop: watch::Receiver<bool>,
        queue_capacity: usize,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::channel(queue_capacity);
        let (result_tx, result_rx) = mpsc::channel(queue_capacity);
        let handle = tokio::spawn(worker_loop(transport, task_rx, result_tx, stop));
        Self {
            tasks: task_tx,
            results: result_rx,
            handle,
        }
    }

    /// Try to queue a task without blocking. `false` means the queue is full
    /// (or the worker is gone); the caller keeps the slot armed and retries
    /// on a later cycle.
    pub fn try_enqueue(&self, task: WorkerTask) -> bool {
        self.tasks.try_send(task).is_ok()
    }

    /// Drain every ready completion event.
    pub fn drain_ready(&mut self) -> Vec<CommandExecutionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.results.try_recv() {
            events.push(event);
        }
        events
    }

    /// Send the shutdown sentinel, join with a bounded timeout (aborting on
    /// expiry — shutdown never blocks indefinitely), and return any remaining
    /// events.
    pub async fn shutdown(mut self, join_timeout: Duration) -> Vec<CommandExecutionEvent> {
        let _ = self.tasks.try_send(WorkerTask::Shutdown);
        drop(self.tasks);
        if tokio::time::timeout(join_timeout, &mut self.handle)
            .await
            .is_err()
        {
            tracing::warn!("command worker did not stop in time; aborting");
            self.handle.abort();
        }
        let mut events = Vec::new();
        while let Ok(event) = self.results.try_recv() {
            events.push(event);
        }
        events
    }
}

async fn worker_loop(
    transport: SharedTransport,
    mut tasks: mpsc::Receiver<WorkerTask>,
    results: mpsc::Sender<CommandExecutionEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let task = tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
            task = tasks.recv() => match task {
                Some(task) => task,
                None => break, // queue closed
            },
        };
        let WorkerTask::Execute {
            state_index,
            source,
            definition,
            retries,
            backoff,
        } = task
        else {
            break; // shutdown sentinel
        };

        tracing::debug!(command = %definition.name, state_index, %source, "worker executing");
        let outcome = {
            let mut guard = transport.lock().await;
            executor::execute(guard.as_mut(), &definition, retries, backoff).await
        };
        let event = CommandExecutionEvent::from_outcome(state_index, source, outcome);
        if results.send(event).await.is_err() {
            break; // loop side gone; nothing left to report to
        }
    }
}

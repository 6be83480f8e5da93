//! Instrument command machinery: catalog, executor, scheduling, worker.
//!
//! - [`catalog`]: named command definitions from configuration
//! - [`executor`]: one command against the transport, with retry/backoff
//! - [`schedule`]: per-command schedule configuration and phase machine
//! - [`worker`]: background task running queued commands under the shared
//!   transport lock

pub mod catalog;
pub mod executor;
pub mod schedule;
pub mod worker;

pub use catalog::{CommandCatalog, CommandDefinition};
pub use executor::{CommandResult, ExecuteFailure};
pub use schedule::{DispatchSource, ScheduledCommandConfig, ScheduledCommandState, SchedulePhase};
pub use worker::{AsyncCommandWorker, CommandExecutionEvent, WorkerTask};

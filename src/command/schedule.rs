//! Per-command schedule configuration and runtime state machine.
//!
//! Each schedule entry owns a phase machine with four states:
//!
//! ```text
//! Inactive ──reset(interval set)──▶ Armed ──dispatch──▶ InFlight
//!     ▲                               ▲                    │
//!     └── reset (no interval) ────────┴── mark_attempt ────┤
//!                                                          ▼
//!                                                      Exhausted
//! ```
//!
//! `Exhausted` is terminal for the session: reached after `max_runs` completed
//! attempts, after a one-shot command completes once, or by `disable()` when
//! the entry references an undefined command. Failures never stop recurrence;
//! they only populate `last_error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Where a dispatch originated. Carried on in-flight state and on completion
/// events; an event is applied only when the tags still match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchSource {
    /// Run once before the polling loop starts.
    Startup,
    /// Periodic dispatch from the due check.
    Schedule,
}

impl fmt::Display for DispatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchSource::Startup => f.write_str("startup"),
            DispatchSource::Schedule => f.write_str("schedule"),
        }
    }
}

/// One `[[schedule]]` entry from the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduledCommandConfig {
    /// Name of the command in the catalog.
    pub command: String,

    /// Run once, synchronously, before the polling loop starts.
    #[serde(default)]
    pub run_on_startup: bool,

    /// Recurrence interval; absent means one-shot.
    #[serde(default, with = "humantime_serde::option")]
    pub interval: Option<Duration>,

    /// Delay before the first periodic run of a session.
    #[serde(default, with = "humantime_serde")]
    pub first_delay: Duration,

    /// Stop after this many completed attempts.
    pub max_runs: Option<u32>,

    /// Retry-count override for this entry.
    pub retries: Option<u32>,

    /// Backoff override for this entry.
    #[serde(default, with = "humantime_serde::option")]
    pub backoff: Option<Duration>,

    /// Calibration category label; entries carrying one pick up the
    /// calibration retry overrides from the acquisition settings.
    pub calibration_label: Option<String>,

    /// Disabled entries never arm.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Phase of a scheduled command within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePhase {
    /// Not scheduled this session (no interval, or disabled).
    Inactive,
    /// Waiting for its due time.
    Armed {
        /// When the next dispatch becomes eligible.
        next_due: DateTime<Utc>,
    },
    /// Dispatched, awaiting its completion event.
    InFlight {
        /// Tag the eventual completion event must carry to be applied.
        source: DispatchSource,
    },
    /// Terminal for the session.
    Exhausted,
}

/// Mutable runtime companion to a [`ScheduledCommandConfig`].
#[derive(Debug, Clone)]
pub struct ScheduledCommandState {
    /// The immutable schedule entry.
    pub config: ScheduledCommandConfig,
    phase: SchedulePhase,
    runs: u32,
    last_error: Option<String>,
}

impl ScheduledCommandState {
    /// Wrap a config; starts `Inactive` until `reset` is called at session
    /// start.
    pub fn new(config: ScheduledCommandConfig) -> Self {
        Self {
            config,
            phase: SchedulePhase::Inactive,
            runs: 0,
            last_error: None,
        }
    }

    /// Re-arm for a new session starting at `now`.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.runs = 0;
        self.last_error = None;
        self.phase = if self.config.enabled && self.config.interval.is_some() {
            SchedulePhase::Armed {
                next_due: now + to_chrono(self.config.first_delay),
            }
        } else {
            SchedulePhase::Inactive
        };
    }

    /// Eligible for dispatch: armed, due, and not in flight.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.phase, SchedulePhase::Armed { next_due } if now >= next_due)
    }

    /// Transition to `InFlight` for a dispatch from `source`.
    pub fn begin_dispatch(&mut self, source: DispatchSource) {
        self.phase = SchedulePhase::InFlight { source };
    }

    /// The source tag of the pending dispatch, if one is in flight.
    pub fn pending_source(&self) -> Option<DispatchSource> {
        match self.phase {
            SchedulePhase::InFlight { source } => Some(source),
            _ => None,
        }
    }

    /// Record a completed attempt sequence.
    ///
    /// Increments `runs`; transitions to `Exhausted` when `max_runs` is
    /// reached or the command is one-shot, otherwise re-arms at
    /// `now + interval` regardless of success or failure.
    pub fn mark_attempt(&mut self, now: DateTime<Utc>, success: bool, error: Option<String>) {
        self.runs += 1;
        self.last_error = if success { None } else { error };
        let exhausted = self.config.max_runs.is_some_and(|max| self.runs >= max);
        self.phase = match (exhausted, self.config.interval) {
            (true, _) | (false, None) => SchedulePhase::Exhausted,
            (false, Some(interval)) => SchedulePhase::Armed {
                next_due: now + to_chrono(interval),
            },
        };
    }

    /// Force the terminal state, recording why. Used when the entry
    /// references an undefined command or an unusable definition.
    pub fn disable(&mut self, reason: impl Into<String>) {
        self.phase = SchedulePhase::Exhausted;
        self.last_error = Some(reason.into());
    }

    /// Current phase.
    pub fn phase(&self) -> SchedulePhase {
        self.phase
    }

    /// Completed attempt sequences this session.
    pub fn runs(&self) -> u32 {
        self.runs
    }

    /// Error text from the most recent failed attempt, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Next due time, when armed.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        match self.phase {
            SchedulePhase::Armed { next_due } => Some(next_due),
            _ => None,
        }
    }

    /// True once the terminal state is reached.
    pub fn is_exhausted(&self) -> bool {
        self.phase == SchedulePhase::Exhausted
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

//! Shared data model for hashq cracking jobs.
//!
//! A [`JobRecord`] is the single persisted description of one tool invocation.
//! Its [`JobStatus`] follows a small state machine whose legal moves are
//! encoded in [`JobStatus::can_transition_to`]; every writer goes through
//! [`JobStatus::ensure_transition`] so terminal states are reached once.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const JOB_RECORD_SCHEMA_VERSION: u32 = 1;
const JOB_ID_PREFIX: &str = "job";

static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn job_record_schema_version() -> u32 {
    JOB_RECORD_SCHEMA_VERSION
}

/// Error returned when a status transition is not part of the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid job status transition: {from} -> {to}")]
pub struct StatusTransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for an admission slot.
    Queued,
    /// Admitted; the session launcher has not produced a handle yet.
    Starting,
    /// The tool is executing inside a session.
    Running,
    /// Every target hash was recovered, or the tool reported `Cracked`.
    CompletedSuccess,
    /// The keyspace was exhausted before every hash was recovered.
    CompletedExhausted,
    /// The tool ended cleanly without a more specific signal.
    Completed,
    /// The tool aborted or reported an error.
    Failed,
    /// The engine could not launch or keep observing the tool.
    Error,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        Self::Queued,
        Self::Starting,
        Self::Running,
        Self::CompletedSuccess,
        Self::CompletedExhausted,
        Self::Completed,
        Self::Failed,
        Self::Error,
    ];

    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::CompletedSuccess => "completed_success",
            Self::CompletedExhausted => "completed_exhausted",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }

    /// Returns true once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::CompletedSuccess
                | Self::CompletedExhausted
                | Self::Completed
                | Self::Failed
                | Self::Error
        )
    }

    /// Returns true for states that occupy an admission slot.
    pub fn occupies_slot(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Returns true when this status can move to `next`.
    ///
    /// Terminal states reject every move, including a move to themselves.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self == next {
            return true;
        }

        match (self, next) {
            (Self::Queued, Self::Starting) | (Self::Queued, Self::Error) => true,
            (Self::Starting, Self::Running) | (Self::Starting, Self::Error) => true,
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    /// Returns an error if moving to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(StatusTransitionError {
            from: self,
            to: next,
        })
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Background execution strategy used for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Named detached tmux session.
    Tmux,
    /// Detached GNU screen session.
    Screen,
    /// `nohup` background process writing to a log file.
    Disowned,
    /// Tool run to completion inside the launch call.
    Synchronous,
}

impl SessionKind {
    /// Detached backends in launch preference order.
    pub const DETACHED_PREFERENCE: [SessionKind; 3] = [Self::Tmux, Self::Screen, Self::Disowned];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tmux => "tmux",
            Self::Screen => "screen",
            Self::Disowned => "disowned",
            Self::Synchronous => "synchronous",
        }
    }

    /// Parses a backend token, accepting `nohup` for the disowned backend.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tmux" => Some(Self::Tmux),
            "screen" => Some(Self::Screen),
            "disowned" | "nohup" => Some(Self::Disowned),
            "synchronous" | "sync" => Some(Self::Synchronous),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the detached context a job runs in.
///
/// Every later liveness, capture and termination call dispatches on `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub kind: SessionKind,
    /// Session name for tmux/screen, informational for the other backends.
    pub name: String,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Raw log the backend writes tool output to, when it has one.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Pattern for `pgrep -f`/`pkill -f` when nothing better is known.
    pub match_pattern: String,
    /// Set by the synchronous backend: output is final, nothing to poll.
    #[serde(default)]
    pub already_complete: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Parameters accepted by `StartJob`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRequest {
    pub hash_mode: String,
    pub attack_mode: String,
    pub hash_input_path: PathBuf,
    pub wordlist_path: PathBuf,
    pub extra_options: String,
    pub auto_delete_input: bool,
    pub admit_when_busy: bool,
}

/// Durable record for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(default = "job_record_schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub status: JobStatus,
    pub hash_input_path: PathBuf,
    pub wordlist_path: PathBuf,
    pub hash_mode: String,
    pub attack_mode: String,
    #[serde(default)]
    pub extra_options: String,
    pub output_path: PathBuf,
    pub cracked_output_path: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cracked_count: u64,
    #[serde(default)]
    pub total_count: u64,
    /// Highest progress percentage seen in tool output.
    #[serde(default)]
    pub progress_percent: Option<f64>,
    /// Last `Recovered` line, verbatim.
    #[serde(default)]
    pub progress_line: Option<String>,
    #[serde(default)]
    pub auto_delete_input: bool,
    #[serde(default)]
    pub input_deleted: bool,
    #[serde(default)]
    pub admit_when_busy: bool,
    #[serde(default)]
    pub session: Option<SessionHandle>,
    #[serde(default)]
    pub output_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub near_completion_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub probe_failures: u32,
    /// When an engine took ownership of launching this `starting` job.
    #[serde(default)]
    pub launch_claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Builds a record for `request` in the given initial status.
    pub fn from_request(
        id: impl Into<String>,
        request: &JobRequest,
        output_path: PathBuf,
        cracked_output_path: PathBuf,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: JOB_RECORD_SCHEMA_VERSION,
            id: id.into(),
            status: JobStatus::Starting,
            hash_input_path: request.hash_input_path.clone(),
            wordlist_path: request.wordlist_path.clone(),
            hash_mode: request.hash_mode.trim().to_string(),
            attack_mode: request.attack_mode.trim().to_string(),
            extra_options: request.extra_options.trim().to_string(),
            output_path,
            cracked_output_path,
            created_at,
            queued_at: None,
            started_at: None,
            completed_at: None,
            cracked_count: 0,
            total_count: 0,
            progress_percent: None,
            progress_line: None,
            auto_delete_input: request.auto_delete_input,
            input_deleted: false,
            admit_when_busy: request.admit_when_busy,
            session: None,
            output_updated_at: None,
            near_completion_at: None,
            probe_failures: 0,
            launch_claimed_at: None,
            last_error: None,
        }
    }

    /// Moves to `next`, maintaining the timestamp invariants.
    ///
    /// `queued_at` lives only while the job is queued. `started_at` is
    /// stamped on entering `running` (or a terminal state if the job never
    /// ran) and `completed_at` on entering a terminal state.
    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<(), StatusTransitionError> {
        self.status.ensure_transition(next)?;
        if next == self.status {
            return Ok(());
        }
        match self.status {
            JobStatus::Queued => self.queued_at = None,
            JobStatus::Starting => self.launch_claimed_at = None,
            _ => {}
        }
        match next {
            JobStatus::Queued => {
                if self.queued_at.is_none() {
                    self.queued_at = Some(now);
                }
            }
            JobStatus::Starting => {}
            JobStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            terminal => {
                debug_assert!(terminal.is_terminal());
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                self.completed_at = Some(now);
            }
        }
        self.status = next;
        Ok(())
    }

    /// True while another launcher's claim on this `starting` job is fresh.
    pub fn launch_claim_is_live(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.launch_claimed_at
            .map(|claimed_at| now - claimed_at < lease)
            .unwrap_or(false)
    }

    /// Takes the launch claim for a `starting` job unless a live one exists.
    ///
    /// Returns whether the caller now owns the launch.
    pub fn claim_launch(&mut self, now: DateTime<Utc>, lease: Duration) -> bool {
        if self.status != JobStatus::Starting || self.launch_claim_is_live(now, lease) {
            return false;
        }
        self.launch_claimed_at = Some(now);
        true
    }

    /// Folds observed `Recovered N/M` counts in without ever going backwards.
    pub fn record_counts(&mut self, cracked: u64, total: u64) {
        self.total_count = self.total_count.max(total);
        self.cracked_count = self.cracked_count.max(cracked);
        if self.total_count > 0 {
            self.cracked_count = self.cracked_count.min(self.total_count);
        }
    }

    /// Keeps the highest progress percentage seen.
    pub fn record_progress(&mut self, percent: f64) {
        if !percent.is_finite() {
            return;
        }
        let percent = percent.clamp(0.0, 100.0);
        self.progress_percent = Some(match self.progress_percent {
            Some(previous) => previous.max(percent),
            None => percent,
        });
    }
}

/// Result of `StartJob`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTicket {
    pub job_id: String,
    pub status: JobStatus,
}

/// Result of `GetQueueStatus`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub has_running: bool,
    /// Jobs in `starting` or `running`.
    pub running_count: usize,
    pub queued_count: usize,
    pub total_count: usize,
}

impl QueueStatus {
    /// Tallies a snapshot of records.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut status = Self::default();
        for record in records {
            status.total_count += 1;
            if record.status.occupies_slot() {
                status.running_count += 1;
            } else if record.status == JobStatus::Queued {
                status.queued_count += 1;
            }
        }
        status.has_running = status.running_count > 0;
        status
    }
}

/// Allocates a fresh job id of the form `job-<unix_ms>-<seq>`.
pub fn next_job_id(now: DateTime<Utc>) -> String {
    let suffix = JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{JOB_ID_PREFIX}-{}-{suffix:04}", now.timestamp_millis())
}

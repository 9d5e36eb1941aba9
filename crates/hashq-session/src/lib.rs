//! Session launcher: runs the cracking tool inside a detachable background
//! context and answers liveness, capture and termination queries for it.
//!
//! Backends implement [`SessionBackend`]; [`SessionLauncher`] picks one per
//! launch and later dispatches on the [`SessionKind`] recorded in the
//! returned [`SessionHandle`].

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod backends;
mod command;
mod executable;
mod launcher;
mod probe;

pub use backends::{DisownedBackend, ScreenBackend, SynchronousBackend, TmuxBackend};
pub use command::{render_header, ToolCommand};
pub use executable::{is_executable_available, HostCapabilities};
pub use hashq_types::{SessionHandle, SessionKind};
pub use launcher::SessionLauncher;

const DEFAULT_TOOL_BINARY: &str = "hashcat";
const DEFAULT_STATUS_TIMER_SECS: u64 = 1;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CAPTURE_SCROLLBACK_LINES: usize = 2_000;

/// Launcher settings, read from the `[launcher]` table of the engine config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Tool executable: an absolute path or a name looked up on `PATH`.
    pub tool_binary: String,
    /// Potfile passed as `--potfile-path`; omitted when unset.
    pub potfile_path: Option<PathBuf>,
    pub status_timer_secs: u64,
    pub probe_timeout_ms: u64,
    /// Forces one backend instead of the platform preference order.
    pub preferred_backend: Option<SessionKind>,
    pub capture_scrollback_lines: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            tool_binary: DEFAULT_TOOL_BINARY.to_string(),
            potfile_path: None,
            status_timer_secs: DEFAULT_STATUS_TIMER_SECS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            preferred_backend: None,
            capture_scrollback_lines: DEFAULT_CAPTURE_SCROLLBACK_LINES,
        }
    }
}

impl LauncherConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }
}

/// Errors that prevent a job from being launched.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("tool binary '{0}' is not executable or not on PATH")]
    ToolNotFound(String),
    #[error("{label} '{}' does not exist", path.display())]
    MissingInput { label: &'static str, path: PathBuf },
    #[error("invalid tool parameters: {0}")]
    InvalidParameters(String),
    #[error("invalid extra options: {0}")]
    InvalidOptions(String),
    #[error("no session backend is available on this host")]
    NoViableBackend,
    #[error("{backend} launch failed: {detail}")]
    Spawn { backend: SessionKind, detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from liveness, capture and termination probes.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe '{program}' timed out after {timeout_ms}ms")]
    Timeout { program: String, timeout_ms: u64 },
    #[error("failed to spawn probe '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no {0} backend is registered")]
    UnknownBackend(SessionKind),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything a backend needs to start one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub job_id: String,
    pub session_name: String,
    pub command: ToolCommand,
    /// Captured-output artifact; already holds the header when `launch` runs.
    pub output_path: PathBuf,
    /// Raw log for backends that redirect tool output to a file.
    pub log_path: PathBuf,
    pub match_pattern: String,
}

/// One way of running the tool detached from the engine.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    fn kind(&self) -> SessionKind;

    async fn launch(&self, spec: &LaunchSpec) -> Result<SessionHandle, LaunchError>;

    /// Reports whether the tool is still executing.
    async fn is_alive(&self, handle: &SessionHandle) -> Result<bool, ProbeError>;

    /// Returns the latest tool output, or `None` when nothing is capturable.
    async fn capture(&self, handle: &SessionHandle) -> Result<Option<String>, ProbeError>;

    /// Best-effort stop; never fails.
    async fn terminate(&self, handle: &SessionHandle);
}

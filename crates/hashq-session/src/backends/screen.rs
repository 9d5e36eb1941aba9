use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use hashq_types::{SessionHandle, SessionKind};
use tracing::debug;

use super::read_log_tail;
use crate::probe::{kill_pattern, kill_pid, pid_alive, run_probe};
use crate::{LaunchError, LaunchSpec, ProbeError, SessionBackend};

const SCREEN: &str = "screen";
const HARDCOPY_SUFFIX: &str = "screen";

/// Detached GNU screen session.
#[derive(Debug, Clone)]
pub struct ScreenBackend {
    probe_timeout: Duration,
    scrollback_lines: usize,
}

impl ScreenBackend {
    pub fn new(probe_timeout: Duration, scrollback_lines: usize) -> Self {
        Self {
            probe_timeout,
            scrollback_lines,
        }
    }

    async fn list_sessions(&self) -> Result<String, ProbeError> {
        // `screen -ls` exits non-zero even when it lists sessions.
        let output = run_probe(SCREEN, ["-ls"], self.probe_timeout).await?;
        Ok(output.stdout)
    }
}

/// Finds the pid of session `name` in `screen -ls` output.
///
/// Session lines look like `\t12345.hashcat_job-1\t(Detached)`.
pub(crate) fn parse_screen_pid(listing: &str, name: &str) -> Option<u32> {
    listing.lines().find_map(|line| {
        let token = line.split_whitespace().next()?;
        let (pid, session) = token.split_once('.')?;
        if session != name {
            return None;
        }
        pid.parse::<u32>().ok()
    })
}

/// Scratch file `capture` asks screen to dump its scrollback into.
pub(crate) fn hardcopy_path(handle: &SessionHandle) -> Option<PathBuf> {
    let log = handle.log_path.as_ref()?;
    Some(log.with_extension(HARDCOPY_SUFFIX))
}

#[async_trait]
impl SessionBackend for ScreenBackend {
    fn kind(&self) -> SessionKind {
        SessionKind::Screen
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<SessionHandle, LaunchError> {
        let spawn_error = |detail: String| LaunchError::Spawn {
            backend: SessionKind::Screen,
            detail,
        };
        let rendered = spec.command.render();
        let created = run_probe(
            SCREEN,
            ["-dmS", spec.session_name.as_str(), "sh", "-c", rendered.as_str()],
            self.probe_timeout,
        )
        .await
        .map_err(|error| spawn_error(error.to_string()))?;
        if !created.success {
            return Err(spawn_error(created.stderr.trim().to_string()));
        }

        let pid = match self.list_sessions().await {
            Ok(listing) => parse_screen_pid(&listing, &spec.session_name),
            Err(error) => {
                debug!(session = %spec.session_name, %error, "screen -ls failed after launch");
                None
            }
        };

        Ok(SessionHandle {
            kind: SessionKind::Screen,
            name: spec.session_name.clone(),
            pid,
            log_path: Some(spec.log_path.clone()),
            match_pattern: spec.match_pattern.clone(),
            already_complete: false,
            exit_code: None,
        })
    }

    async fn is_alive(&self, handle: &SessionHandle) -> Result<bool, ProbeError> {
        if let Some(pid) = handle.pid {
            return pid_alive(pid, self.probe_timeout).await;
        }
        let listing = self.list_sessions().await?;
        Ok(parse_screen_pid(&listing, &handle.name).is_some())
    }

    async fn capture(&self, handle: &SessionHandle) -> Result<Option<String>, ProbeError> {
        let Some(path) = hardcopy_path(handle) else {
            return Ok(None);
        };
        let target = path.display().to_string();
        let output = run_probe(
            SCREEN,
            ["-S", handle.name.as_str(), "-X", "hardcopy", "-h", target.as_str()],
            self.probe_timeout,
        )
        .await?;
        if !output.success {
            debug!(session = %handle.name, "screen hardcopy refused; session likely gone");
        }
        read_log_tail(&path, self.scrollback_lines).await
    }

    async fn terminate(&self, handle: &SessionHandle) {
        if let Err(error) = run_probe(
            SCREEN,
            ["-S", handle.name.as_str(), "-X", "quit"],
            self.probe_timeout,
        )
        .await
        {
            debug!(session = %handle.name, %error, "screen quit failed");
        }
        match handle.pid {
            Some(pid) => kill_pid(pid, self.probe_timeout).await,
            None => kill_pattern(&handle.match_pattern, self.probe_timeout).await,
        }
    }
}

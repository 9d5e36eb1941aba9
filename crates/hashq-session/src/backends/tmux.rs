use std::time::Duration;

use async_trait::async_trait;
use hashq_types::{SessionHandle, SessionKind};
use tracing::debug;

use super::{parse_first_pid, read_log_tail};
use crate::probe::{kill_pattern, kill_pid, pid_alive, run_probe};
use crate::{LaunchError, LaunchSpec, ProbeError, SessionBackend};

const TMUX: &str = "tmux";

/// Named detached tmux session with its pane piped into a log file.
#[derive(Debug, Clone)]
pub struct TmuxBackend {
    probe_timeout: Duration,
    scrollback_lines: usize,
}

impl TmuxBackend {
    pub fn new(probe_timeout: Duration, scrollback_lines: usize) -> Self {
        Self {
            probe_timeout,
            scrollback_lines,
        }
    }

    async fn has_session(&self, name: &str) -> Result<bool, ProbeError> {
        Ok(run_probe(TMUX, ["has-session", "-t", name], self.probe_timeout)
            .await?
            .success)
    }
}

#[async_trait]
impl SessionBackend for TmuxBackend {
    fn kind(&self) -> SessionKind {
        SessionKind::Tmux
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<SessionHandle, LaunchError> {
        let spawn_error = |detail: String| LaunchError::Spawn {
            backend: SessionKind::Tmux,
            detail,
        };
        let rendered = spec.command.render();
        let created = run_probe(
            TMUX,
            ["new-session", "-d", "-s", spec.session_name.as_str(), rendered.as_str()],
            self.probe_timeout,
        )
        .await
        .map_err(|error| spawn_error(error.to_string()))?;
        if !created.success {
            return Err(spawn_error(created.stderr.trim().to_string()));
        }

        let pipe_target = format!(
            "cat >> {}",
            shell_words::quote(&spec.log_path.display().to_string())
        );
        match run_probe(
            TMUX,
            ["pipe-pane", "-o", "-t", spec.session_name.as_str(), pipe_target.as_str()],
            self.probe_timeout,
        )
        .await
        {
            Ok(output) if !output.success => {
                debug!(session = %spec.session_name, stderr = %output.stderr.trim(), "tmux pipe-pane refused");
            }
            Err(error) => debug!(session = %spec.session_name, %error, "tmux pipe-pane failed"),
            Ok(_) => {}
        }

        let pid = match run_probe(
            TMUX,
            ["list-panes", "-t", spec.session_name.as_str(), "-F", "#{pane_pid}"],
            self.probe_timeout,
        )
        .await
        {
            Ok(output) if output.success => parse_first_pid(&output.stdout),
            _ => None,
        };

        Ok(SessionHandle {
            kind: SessionKind::Tmux,
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
        self.has_session(&handle.name).await
    }

    async fn capture(&self, handle: &SessionHandle) -> Result<Option<String>, ProbeError> {
        if self.has_session(&handle.name).await? {
            let start = format!("-{}", self.scrollback_lines);
            let output = run_probe(
                TMUX,
                ["capture-pane", "-p", "-J", "-t", handle.name.as_str(), "-S", start.as_str()],
                self.probe_timeout,
            )
            .await?;
            if output.success && !output.stdout.trim().is_empty() {
                return Ok(Some(output.stdout));
            }
        }
        match handle.log_path.as_ref() {
            Some(path) => read_log_tail(path, self.scrollback_lines).await,
            None => Ok(None),
        }
    }

    async fn terminate(&self, handle: &SessionHandle) {
        if let Err(error) = run_probe(
            TMUX,
            ["kill-session", "-t", handle.name.as_str()],
            self.probe_timeout,
        )
        .await
        {
            debug!(session = %handle.name, %error, "tmux kill-session failed");
        }
        match handle.pid {
            Some(pid) => kill_pid(pid, self.probe_timeout).await,
            None => kill_pattern(&handle.match_pattern, self.probe_timeout).await,
        }
    }
}

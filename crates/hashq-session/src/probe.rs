//! Bounded subprocess probes shared by the backends.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::ProbeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProbeOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `program args…` to completion, killing it after `timeout`.
pub(crate) async fn run_probe<I, S>(
    program: &str,
    args: I,
    timeout: Duration,
) -> Result<ProbeOutput, ProbeError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = command.spawn().map_err(|source| ProbeError::Spawn {
        program: program.to_string(),
        source,
    })?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ProbeError::Timeout {
                program: program.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        }
    };
    let probe = ProbeOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    debug!(program, success = probe.success, "probe finished");
    Ok(probe)
}

/// `kill -0 <pid>`: true while the process exists.
pub(crate) async fn pid_alive(pid: u32, timeout: Duration) -> Result<bool, ProbeError> {
    let script = format!("kill -0 {pid} >/dev/null 2>&1");
    Ok(run_probe("/bin/sh", ["-c", script.as_str()], timeout)
        .await?
        .success)
}

/// `pgrep -f <pattern>`: true while any matching process exists.
pub(crate) async fn pattern_alive(pattern: &str, timeout: Duration) -> Result<bool, ProbeError> {
    Ok(run_probe("pgrep", ["-f", pattern], timeout).await?.success)
}

pub(crate) async fn kill_pid(pid: u32, timeout: Duration) {
    let script = format!("kill {pid} >/dev/null 2>&1");
    if let Err(error) = run_probe("/bin/sh", ["-c", script.as_str()], timeout).await {
        debug!(pid, %error, "kill probe failed");
    }
}

pub(crate) async fn kill_pattern(pattern: &str, timeout: Duration) {
    if let Err(error) = run_probe("pkill", ["-f", pattern], timeout).await {
        debug!(pattern, %error, "pkill probe failed");
    }
}

/// Keeps the last `max_lines` lines of `text`.
pub(crate) fn tail_lines(text: &str, max_lines: usize) -> String {
    if max_lines == 0 {
        return text.to_string();
    }
    let lines = text.lines().collect::<Vec<_>>();
    let start = lines.len().saturating_sub(max_lines);
    let mut tail = lines[start..].join("\n");
    if text.ends_with('\n') && !tail.is_empty() {
        tail.push('\n');
    }
    tail
}

#[cfg(test)]
mod tests {
    use super::{run_probe, tail_lines};
    use crate::ProbeError;
    use std::time::Duration;

    #[test]
    fn unit_tail_lines_keeps_most_recent_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc\n");
        assert_eq!(tail_lines("a\nb", 5), "a\nb");
        assert_eq!(tail_lines("a\nb\nc", 0), "a\nb\nc");
    }

    #[tokio::test]
    async fn unit_run_probe_reports_spawn_failure() {
        let error = run_probe(
            "hashq-definitely-missing-binary",
            ["--version"],
            Duration::from_secs(1),
        )
        .await
        .expect_err("missing binary");
        assert!(matches!(error, ProbeError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn regression_run_probe_times_out_hung_commands() {
        let error = run_probe("/bin/sh", ["-c", "sleep 5"], Duration::from_millis(100))
            .await
            .expect_err("timeout");
        assert!(matches!(error, ProbeError::Timeout { timeout_ms: 100, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unit_pid_alive_tracks_process_lifetime() {
        let alive = super::pid_alive(std::process::id(), Duration::from_secs(2))
            .await
            .expect("probe self");
        assert!(alive);
        let dead = super::pid_alive(u32::MAX / 2, Duration::from_secs(2))
            .await
            .expect("probe missing pid");
        assert!(!dead);
    }
}

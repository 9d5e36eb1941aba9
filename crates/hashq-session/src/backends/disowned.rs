use std::time::Duration;

use async_trait::async_trait;
use hashq_types::{SessionHandle, SessionKind};

use super::{parse_first_pid, read_log_tail};
use crate::probe::{kill_pattern, kill_pid, pattern_alive, pid_alive, run_probe};
use crate::{LaunchError, LaunchSpec, ProbeError, SessionBackend};

/// `nohup` background process writing to a log file.
#[derive(Debug, Clone)]
pub struct DisownedBackend {
    probe_timeout: Duration,
    scrollback_lines: usize,
}

impl DisownedBackend {
    pub fn new(probe_timeout: Duration, scrollback_lines: usize) -> Self {
        Self {
            probe_timeout,
            scrollback_lines,
        }
    }
}

/// `nohup <cmd> > <log> 2>&1 & echo $!`
pub(crate) fn disowned_script(spec: &LaunchSpec) -> String {
    format!(
        "nohup {} > {} 2>&1 < /dev/null & echo $!",
        spec.command.render(),
        shell_words::quote(&spec.log_path.display().to_string())
    )
}

#[async_trait]
impl SessionBackend for DisownedBackend {
    fn kind(&self) -> SessionKind {
        SessionKind::Disowned
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<SessionHandle, LaunchError> {
        let spawn_error = |detail: String| LaunchError::Spawn {
            backend: SessionKind::Disowned,
            detail,
        };
        let script = disowned_script(spec);
        let output = run_probe("sh", ["-c", script.as_str()], self.probe_timeout)
            .await
            .map_err(|error| spawn_error(error.to_string()))?;
        if !output.success {
            return Err(spawn_error(output.stderr.trim().to_string()));
        }
        let pid = parse_first_pid(&output.stdout);
        if pid.is_none() {
            return Err(spawn_error(format!(
                "background shell did not report a pid: '{}'",
                output.stdout.trim()
            )));
        }

        Ok(SessionHandle {
            kind: SessionKind::Disowned,
            name: spec.session_name.clone(),
            pid,
            log_path: Some(spec.log_path.clone()),
            match_pattern: spec.match_pattern.clone(),
            already_complete: false,
            exit_code: None,
        })
    }

    async fn is_alive(&self, handle: &SessionHandle) -> Result<bool, ProbeError> {
        match handle.pid {
            Some(pid) => pid_alive(pid, self.probe_timeout).await,
            None => pattern_alive(&handle.match_pattern, self.probe_timeout).await,
        }
    }

    async fn capture(&self, handle: &SessionHandle) -> Result<Option<String>, ProbeError> {
        match handle.log_path.as_ref() {
            Some(path) => read_log_tail(path, self.scrollback_lines).await,
            None => Ok(None),
        }
    }

    async fn terminate(&self, handle: &SessionHandle) {
        match handle.pid {
            Some(pid) => kill_pid(pid, self.probe_timeout).await,
            None => kill_pattern(&handle.match_pattern, self.probe_timeout).await,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::DisownedBackend;
    use crate::{LaunchSpec, SessionBackend, ToolCommand};
    use std::time::Duration;

    fn spec(dir: &std::path::Path, script: &str) -> LaunchSpec {
        let command = ToolCommand::from_argv(vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
        .expect("argv");
        LaunchSpec {
            job_id: "job-test".to_string(),
            session_name: "hashcat_job-test".to_string(),
            command,
            output_path: dir.join("hashcat_job-test.txt"),
            log_path: dir.join("hashcat_job-test.txt.log"),
            match_pattern: "sh.*job-test".to_string(),
        }
    }

    async fn wait_until_dead(backend: &DisownedBackend, handle: &hashq_types::SessionHandle) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while backend.is_alive(handle).await.expect("probe") {
            assert!(tokio::time::Instant::now() < deadline, "process did not exit");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn functional_disowned_backend_logs_output_and_reports_exit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = DisownedBackend::new(Duration::from_secs(2), 100);
        let spec = spec(temp.path(), "echo 'Recovered........: 1/2 (50.00%)'; sleep 0.3");

        let handle = backend.launch(&spec).await.expect("launch");
        assert!(handle.pid.is_some());
        assert_eq!(handle.log_path.as_deref(), Some(spec.log_path.as_path()));

        wait_until_dead(&backend, &handle).await;
        let captured = backend
            .capture(&handle)
            .await
            .expect("capture")
            .expect("log exists");
        assert!(captured.contains("Recovered........: 1/2"));
    }

    #[tokio::test]
    async fn functional_disowned_backend_terminate_stops_process() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = DisownedBackend::new(Duration::from_secs(2), 100);
        let spec = spec(temp.path(), "sleep 30");

        let handle = backend.launch(&spec).await.expect("launch");
        assert!(backend.is_alive(&handle).await.expect("probe"));
        backend.terminate(&handle).await;
        wait_until_dead(&backend, &handle).await;
    }
}

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashq_types::{JobRecord, SessionHandle, SessionKind};
use tracing::{debug, info, warn};

use crate::backends::{side_files, DisownedBackend, ScreenBackend, SynchronousBackend, TmuxBackend};
use crate::command::{render_header, ToolCommand};
use crate::executable::{is_executable_available, HostCapabilities};
use crate::{LaunchError, LaunchSpec, LauncherConfig, ProbeError, SessionBackend};

const SESSION_NAME_PREFIX: &str = "hashcat";

/// Validates, launches and later probes tool sessions.
#[derive(Clone)]
pub struct SessionLauncher {
    config: LauncherConfig,
    capabilities: HostCapabilities,
    backends: BTreeMap<SessionKind, Arc<dyn SessionBackend>>,
}

impl std::fmt::Debug for SessionLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLauncher")
            .field("config", &self.config)
            .field("capabilities", &self.capabilities)
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SessionLauncher {
    /// Registers the built-in backends and probes the host once.
    pub fn new(config: LauncherConfig) -> Self {
        let timeout = config.probe_timeout();
        let lines = config.capture_scrollback_lines;
        let backends: Vec<Arc<dyn SessionBackend>> = vec![
            Arc::new(TmuxBackend::new(timeout, lines)),
            Arc::new(ScreenBackend::new(timeout, lines)),
            Arc::new(DisownedBackend::new(timeout, lines)),
            Arc::new(SynchronousBackend::new()),
        ];
        let capabilities = HostCapabilities::detect();
        debug!(?capabilities, "probed session backends");
        Self {
            config,
            capabilities,
            backends: backends
                .into_iter()
                .map(|backend| (backend.kind(), backend))
                .collect(),
        }
    }

    /// Uses exactly `backends`, all treated as available.
    pub fn with_backends(
        config: LauncherConfig,
        backends: impl IntoIterator<Item = Arc<dyn SessionBackend>>,
    ) -> Self {
        let backends = backends
            .into_iter()
            .map(|backend| (backend.kind(), backend))
            .collect::<BTreeMap<_, _>>();
        let capabilities = HostCapabilities {
            tmux: backends.contains_key(&SessionKind::Tmux),
            screen: backends.contains_key(&SessionKind::Screen),
            disowned: backends.contains_key(&SessionKind::Disowned),
        };
        Self {
            config,
            capabilities,
            backends,
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Backend a launch would use right now.
    pub fn select_backend(&self) -> Result<SessionKind, LaunchError> {
        let usable = |kind: SessionKind| {
            self.backends.contains_key(&kind) && self.capabilities.supports(kind)
        };
        if let Some(kind) = self.config.preferred_backend {
            return if usable(kind) {
                Ok(kind)
            } else {
                Err(LaunchError::NoViableBackend)
            };
        }
        if cfg!(windows) && usable(SessionKind::Synchronous) {
            return Ok(SessionKind::Synchronous);
        }
        SessionKind::DETACHED_PREFERENCE
            .into_iter()
            .find(|kind| usable(*kind))
            .ok_or(LaunchError::NoViableBackend)
    }

    /// `hashcat_<job_id>`
    pub fn session_name(job_id: &str) -> String {
        format!("{SESSION_NAME_PREFIX}_{job_id}")
    }

    /// `pgrep -f` pattern matching the tool process of one job.
    pub fn match_pattern(&self, job_id: &str) -> String {
        let tool = Path::new(self.config.tool_binary.trim())
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.tool_binary.trim().to_string());
        format!("{tool}.*{job_id}")
    }

    /// Raw log written next to the output artifact: `<output>.log`.
    pub fn log_path(output_path: &Path) -> PathBuf {
        let mut raw = OsString::from(output_path.as_os_str());
        raw.push(".log");
        PathBuf::from(raw)
    }

    /// Validates `record`, writes the output header and starts the tool.
    pub async fn launch(&self, record: &JobRecord) -> Result<SessionHandle, LaunchError> {
        let command = ToolCommand::for_job(&self.config, record)?;
        ensure_exists("hash input", &record.hash_input_path).await?;
        ensure_exists("wordlist", &record.wordlist_path).await?;
        if !is_executable_available(&self.config.tool_binary) {
            return Err(LaunchError::ToolNotFound(self.config.tool_binary.clone()));
        }
        let kind = self.select_backend()?;
        let backend = self
            .backends
            .get(&kind)
            .ok_or(LaunchError::NoViableBackend)?;

        if let Some(parent) = record.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut document = render_header(&command);
        document.push_str(&format!(
            "Job {} started in background using {kind}.\n",
            record.id
        ));
        tokio::fs::write(&record.output_path, document).await?;

        let spec = LaunchSpec {
            job_id: record.id.clone(),
            session_name: Self::session_name(&record.id),
            command,
            output_path: record.output_path.clone(),
            log_path: Self::log_path(&record.output_path),
            match_pattern: self.match_pattern(&record.id),
        };
        let handle = backend.launch(&spec).await?;
        info!(job_id = %record.id, backend = %kind, pid = ?handle.pid, "launched tool session");
        Ok(handle)
    }

    fn backend_for(&self, handle: &SessionHandle) -> Result<&Arc<dyn SessionBackend>, ProbeError> {
        self.backends
            .get(&handle.kind)
            .ok_or(ProbeError::UnknownBackend(handle.kind))
    }

    pub async fn is_alive(&self, handle: &SessionHandle) -> Result<bool, ProbeError> {
        if handle.already_complete {
            return Ok(false);
        }
        self.backend_for(handle)?.is_alive(handle).await
    }

    pub async fn capture(&self, handle: &SessionHandle) -> Result<Option<String>, ProbeError> {
        if handle.already_complete {
            return Ok(None);
        }
        self.backend_for(handle)?.capture(handle).await
    }

    /// Best-effort stop, then removal of backend side files.
    pub async fn terminate(&self, handle: &SessionHandle) {
        if !handle.already_complete {
            match self.backend_for(handle) {
                Ok(backend) => backend.terminate(handle).await,
                Err(error) => debug!(session = %handle.name, %error, "cannot terminate session"),
            }
        }
        self.release_artifacts(handle).await;
    }

    /// Removes the log and scratch files a session left next to the output.
    pub async fn release_artifacts(&self, handle: &SessionHandle) {
        for path in side_files(handle) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(session = %handle.name, path = %path.display(), "removed session file"),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    warn!(session = %handle.name, path = %path.display(), %error, "failed to remove session file");
                }
            }
        }
    }
}

async fn ensure_exists(label: &'static str, path: &Path) -> Result<(), LaunchError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Ok(()),
        _ => Err(LaunchError::MissingInput {
            label,
            path: path.to_path_buf(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::SessionLauncher;
    use crate::{
        LaunchError, LaunchSpec, LauncherConfig, ProbeError, SessionBackend, SynchronousBackend,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use hashq_types::{JobRecord, JobRequest, SessionHandle, SessionKind};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingBackend {
        launched: Mutex<Vec<LaunchSpec>>,
    }

    #[async_trait]
    impl SessionBackend for RecordingBackend {
        fn kind(&self) -> SessionKind {
            SessionKind::Screen
        }

        async fn launch(&self, spec: &LaunchSpec) -> Result<SessionHandle, LaunchError> {
            self.launched.lock().expect("lock").push(spec.clone());
            Ok(SessionHandle {
                kind: SessionKind::Screen,
                name: spec.session_name.clone(),
                pid: Some(7),
                log_path: Some(spec.log_path.clone()),
                match_pattern: spec.match_pattern.clone(),
                already_complete: false,
                exit_code: None,
            })
        }

        async fn is_alive(&self, _handle: &SessionHandle) -> Result<bool, ProbeError> {
            Ok(true)
        }

        async fn capture(&self, _handle: &SessionHandle) -> Result<Option<String>, ProbeError> {
            Ok(None)
        }

        async fn terminate(&self, _handle: &SessionHandle) {}
    }

    fn job(dir: &Path) -> JobRecord {
        let hashes = dir.join("hashes.txt");
        let wordlist = dir.join("words.txt");
        std::fs::write(&hashes, "5f4dcc3b5aa765d61d8327deb882cf99\n").expect("hashes");
        std::fs::write(&wordlist, "password\n").expect("wordlist");
        let request = JobRequest {
            hash_mode: "0".to_string(),
            attack_mode: "0".to_string(),
            hash_input_path: hashes,
            wordlist_path: wordlist,
            ..JobRequest::default()
        };
        JobRecord::from_request(
            "job-5-0001",
            &request,
            dir.join("out/hashcat_job-5-0001.txt"),
            dir.join("out/hashcat_job-5-0001.cracked"),
            Utc::now(),
        )
    }

    fn sh_config() -> LauncherConfig {
        LauncherConfig {
            tool_binary: "sh".to_string(),
            ..LauncherConfig::default()
        }
    }

    #[tokio::test]
    async fn functional_launch_writes_header_before_handing_off() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(RecordingBackend::default());
        let launcher = SessionLauncher::with_backends(sh_config(), [backend.clone() as Arc<dyn SessionBackend>]);
        let record = job(temp.path());

        let handle = launcher.launch(&record).await.expect("launch");
        assert_eq!(handle.kind, SessionKind::Screen);
        assert_eq!(handle.name, "hashcat_job-5-0001");
        assert_eq!(handle.match_pattern, "sh.*job-5-0001");

        let written = std::fs::read_to_string(&record.output_path).expect("output");
        let (header, body) = written.split_once("\n\n").expect("header block");
        assert!(header.starts_with("COMMAND:\nsh -m 0 -a 0 --status"));
        assert!(body.contains("started in background using screen"));

        let launched = backend.launched.lock().expect("lock");
        assert_eq!(
            launched[0].log_path,
            PathBuf::from(format!("{}.log", record.output_path.display()))
        );
    }

    #[tokio::test]
    async fn regression_session_side_files_are_released_without_touching_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(RecordingBackend::default());
        let launcher = SessionLauncher::with_backends(sh_config(), [backend.clone() as Arc<dyn SessionBackend>]);
        let record = job(temp.path());
        let handle = launcher.launch(&record).await.expect("launch");
        let log_path = handle.log_path.clone().expect("log path");
        let hardcopy = log_path.with_extension("screen");
        std::fs::write(&log_path, "Recovered........: 1/1\n").expect("log");
        std::fs::write(&hardcopy, "Recovered........: 1/1\n").expect("hardcopy");

        launcher.release_artifacts(&handle).await;
        assert!(!log_path.exists());
        assert!(!hardcopy.exists());
        assert!(record.output_path.exists());

        // Already gone: nothing to do, nothing to report.
        launcher.release_artifacts(&handle).await;
        std::fs::write(&log_path, "again\n").expect("log");
        launcher.terminate(&handle).await;
        assert!(!log_path.exists());
    }

    #[tokio::test]
    async fn unit_missing_inputs_fail_before_any_backend_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(RecordingBackend::default());
        let launcher = SessionLauncher::with_backends(sh_config(), [backend.clone() as Arc<dyn SessionBackend>]);
        let mut record = job(temp.path());
        record.wordlist_path = temp.path().join("absent.txt");

        let error = launcher.launch(&record).await.expect_err("missing wordlist");
        assert!(matches!(error, LaunchError::MissingInput { label: "wordlist", .. }));
        assert!(backend.launched.lock().expect("lock").is_empty());
        assert!(!record.output_path.exists());
    }

    #[tokio::test]
    async fn unit_unknown_tool_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = LauncherConfig {
            tool_binary: "hashq-no-such-tool".to_string(),
            ..LauncherConfig::default()
        };
        let launcher = SessionLauncher::with_backends(
            config,
            [Arc::new(RecordingBackend::default()) as Arc<dyn SessionBackend>],
        );
        let error = launcher.launch(&job(temp.path())).await.expect_err("no tool");
        assert!(matches!(error, LaunchError::ToolNotFound(tool) if tool == "hashq-no-such-tool"));
    }

    #[test]
    fn unit_preferred_backend_must_be_registered() {
        let config = LauncherConfig {
            preferred_backend: Some(SessionKind::Synchronous),
            ..sh_config()
        };
        let launcher = SessionLauncher::with_backends(
            config.clone(),
            [Arc::new(RecordingBackend::default()) as Arc<dyn SessionBackend>],
        );
        assert!(matches!(
            launcher.select_backend(),
            Err(LaunchError::NoViableBackend)
        ));

        let launcher = SessionLauncher::with_backends(
            config,
            [Arc::new(SynchronousBackend::new()) as Arc<dyn SessionBackend>],
        );
        assert_eq!(launcher.select_backend().expect("select"), SessionKind::Synchronous);
    }

    #[tokio::test]
    async fn unit_completed_handles_are_never_probed() {
        let launcher = SessionLauncher::with_backends(sh_config(), Vec::<Arc<dyn SessionBackend>>::new());
        let handle = SessionHandle {
            kind: SessionKind::Synchronous,
            name: "hashcat_job-x".to_string(),
            pid: None,
            log_path: None,
            match_pattern: "sh.*job-x".to_string(),
            already_complete: true,
            exit_code: Some(0),
        };
        assert!(!launcher.is_alive(&handle).await.expect("alive"));
        assert!(launcher.capture(&handle).await.expect("capture").is_none());
    }
}

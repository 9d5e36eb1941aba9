use std::process::Stdio;

use async_trait::async_trait;
use hashq_types::{SessionHandle, SessionKind};
use tokio::process::Command;

use crate::command::render_header;
use crate::{LaunchError, LaunchSpec, ProbeError, SessionBackend};

/// Runs the tool to completion inside `launch`.
///
/// Used where detachment is unnecessary. The handle comes back with
/// `already_complete` set so the engine finalizes without polling.
#[derive(Debug, Clone, Default)]
pub struct SynchronousBackend;

impl SynchronousBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionBackend for SynchronousBackend {
    fn kind(&self) -> SessionKind {
        SessionKind::Synchronous
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<SessionHandle, LaunchError> {
        let output = Command::new(spec.command.program())
            .args(spec.command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| LaunchError::Spawn {
                backend: SessionKind::Synchronous,
                detail: error.to_string(),
            })?;

        let mut document = render_header(&spec.command);
        document.push_str(&String::from_utf8_lossy(&output.stdout));
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !document.ends_with('\n') {
                document.push('\n');
            }
            document.push_str(&stderr);
        }
        tokio::fs::write(&spec.output_path, document).await?;

        Ok(SessionHandle {
            kind: SessionKind::Synchronous,
            name: spec.session_name.clone(),
            pid: None,
            log_path: None,
            match_pattern: spec.match_pattern.clone(),
            already_complete: true,
            exit_code: output.status.code(),
        })
    }

    async fn is_alive(&self, _handle: &SessionHandle) -> Result<bool, ProbeError> {
        Ok(false)
    }

    async fn capture(&self, _handle: &SessionHandle) -> Result<Option<String>, ProbeError> {
        Ok(None)
    }

    async fn terminate(&self, _handle: &SessionHandle) {}
}

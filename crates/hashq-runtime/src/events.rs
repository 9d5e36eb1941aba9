use std::path::{Path, PathBuf};

use hashq_core::{append_line_with_rotation, current_unix_timestamp_ms, LogRotationPolicy};
use hashq_types::JobRecord;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One line of the JSONL audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEventRecord {
    pub timestamp_unix_ms: u64,
    pub job_id: String,
    pub event: String,
    pub status: String,
    pub detail: String,
}

/// Append-only lifecycle audit log with size-based rotation.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
    policy: LogRotationPolicy,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            policy: LogRotationPolicy::from_env(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records `event` for `record`. Failures are logged, never returned.
    pub fn append(&self, record: &JobRecord, event: &str, detail: &str) {
        let entry = JobEventRecord {
            timestamp_unix_ms: current_unix_timestamp_ms(),
            job_id: record.id.clone(),
            event: event.to_string(),
            status: record.status.as_str().to_string(),
            detail: detail.to_string(),
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(error) => {
                warn!(job_id = %record.id, event, %error, "failed to encode job event");
                return;
            }
        };
        if let Err(error) = append_line_with_rotation(&self.path, &line, self.policy) {
            warn!(job_id = %record.id, event, error = %format!("{error:#}"), "failed to append job event");
        }
    }

    /// Reads every event in the current (unrotated) log file.
    pub fn read_all(&self) -> anyhow::Result<Vec<JobEventRecord>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(anyhow::Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::EventLog;
    use chrono::Utc;
    use hashq_types::{JobRecord, JobRequest};
    use std::path::PathBuf;

    #[test]
    fn unit_event_log_appends_json_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::new(temp.path().join("events.jsonl"));
        let record = JobRecord::from_request(
            "job-9",
            &JobRequest::default(),
            PathBuf::from("/tmp/a.txt"),
            PathBuf::from("/tmp/a.cracked"),
            Utc::now(),
        );
        log.append(&record, "created", "job accepted");
        log.append(&record, "starting", "admitted");

        let events = log.read_all().expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "created");
        assert_eq!(events[1].status, "starting");
        assert_eq!(events[1].job_id, "job-9");
    }
}

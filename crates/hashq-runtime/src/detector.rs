//! Decides when a running job is finished and which terminal state it gets.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hashq_types::{JobRecord, JobStatus};

use crate::config::EngineConfig;
use crate::heuristic::{CompletionHeuristic, ExplicitStatus, OutputSignals};

/// Inputs for one completion decision.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    /// Record after this tick's counts and timestamps were applied.
    pub record: &'a JobRecord,
    pub signals: &'a OutputSignals,
    pub alive: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Finalize {
        status: JobStatus,
        reason: &'static str,
    },
}

/// Completion rules, parameterized by the engine's timing config.
#[derive(Clone)]
pub struct CompletionDetector {
    heuristic: Arc<dyn CompletionHeuristic>,
    idle_timeout: Duration,
    near_completion_percent: f64,
    near_completion_grace: Duration,
}

impl std::fmt::Debug for CompletionDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionDetector")
            .field("heuristic", &self.heuristic.name())
            .field("idle_timeout", &self.idle_timeout)
            .field("near_completion_percent", &self.near_completion_percent)
            .field("near_completion_grace", &self.near_completion_grace)
            .finish()
    }
}

fn millis(value: u64) -> Duration {
    Duration::milliseconds(i64::try_from(value).unwrap_or(i64::MAX))
}

impl CompletionDetector {
    pub fn new(config: &EngineConfig, heuristic: Arc<dyn CompletionHeuristic>) -> Self {
        Self {
            heuristic,
            idle_timeout: millis(config.idle_timeout_ms),
            near_completion_percent: config.near_completion_percent,
            near_completion_grace: millis(config.near_completion_grace_ms),
        }
    }

    pub fn heuristic(&self) -> &Arc<dyn CompletionHeuristic> {
        &self.heuristic
    }

    /// True once progress reached the near-completion threshold.
    pub fn is_near_completion(&self, record: &JobRecord) -> bool {
        record
            .progress_percent
            .map(|percent| percent >= self.near_completion_percent)
            .unwrap_or(false)
    }

    pub fn evaluate(&self, observation: Observation<'_>) -> Verdict {
        let Observation {
            record,
            signals,
            alive,
            now,
        } = observation;
        let handle_complete = record
            .session
            .as_ref()
            .map(|handle| handle.already_complete)
            .unwrap_or(false);

        if signals.explicit_status.is_some() {
            return self.finalize(record, signals, "explicit_status");
        }
        if handle_complete {
            return self.finalize(record, signals, "synchronous_exit");
        }

        if let Some(near_at) = record.near_completion_at {
            if now - near_at < self.near_completion_grace {
                return Verdict::Continue;
            }
        }
        if alive {
            return Verdict::Continue;
        }

        let full_progress = record
            .progress_percent
            .map(|percent| percent >= 100.0)
            .unwrap_or(false);
        if signals.exhaustion_keyword || full_progress {
            return self.finalize(record, signals, "process_exited_after_keyspace");
        }
        if record.near_completion_at.is_some() {
            return self.finalize(record, signals, "process_exited_near_completion");
        }
        let last_change = record
            .output_updated_at
            .or(record.started_at)
            .unwrap_or(record.created_at);
        if now - last_change >= self.idle_timeout {
            return self.finalize(record, signals, "process_exited_idle");
        }
        Verdict::Continue
    }

    fn finalize(&self, record: &JobRecord, signals: &OutputSignals, reason: &'static str) -> Verdict {
        Verdict::Finalize {
            status: self.classify(record, signals),
            reason,
        }
    }

    /// Terminal state for a finished job, most specific signal first.
    pub fn classify(&self, record: &JobRecord, signals: &OutputSignals) -> JobStatus {
        let explicit = signals.explicit_status;
        let exit_code = record.session.as_ref().and_then(|handle| handle.exit_code);

        let all_cracked = record.total_count > 0 && record.cracked_count == record.total_count;
        if explicit == Some(ExplicitStatus::Cracked) || all_cracked {
            return JobStatus::CompletedSuccess;
        }
        let exhausted_exit = exit_code
            .map(|code| self.heuristic.exit_code_means_exhausted(code))
            .unwrap_or(false);
        if explicit == Some(ExplicitStatus::Exhausted) || signals.exhaustion_keyword || exhausted_exit {
            return JobStatus::CompletedExhausted;
        }
        let aborted = matches!(explicit, Some(ExplicitStatus::Aborted | ExplicitStatus::Quit));
        let failed_exit = exit_code.map(|code| code != 0).unwrap_or(false);
        if aborted || failed_exit || signals.error_marker {
            return JobStatus::Failed;
        }
        JobStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::{CompletionDetector, Observation, Verdict};
    use crate::config::EngineConfig;
    use crate::heuristic::{CompletionHeuristic, HashcatHeuristic};
    use chrono::{Duration, Utc};
    use hashq_types::{JobRecord, JobRequest, JobStatus, SessionHandle, SessionKind};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn detector() -> CompletionDetector {
        CompletionDetector::new(&EngineConfig::default(), Arc::new(HashcatHeuristic))
    }

    fn running_record() -> JobRecord {
        let mut record = JobRecord::from_request(
            "job-1",
            &JobRequest::default(),
            PathBuf::from("/tmp/out.txt"),
            PathBuf::from("/tmp/out.cracked"),
            Utc::now() - Duration::minutes(10),
        );
        record
            .transition(JobStatus::Running, Utc::now() - Duration::minutes(5))
            .expect("running");
        record.output_updated_at = Some(Utc::now());
        record.session = Some(SessionHandle {
            kind: SessionKind::Tmux,
            name: "hashcat_job-1".to_string(),
            pid: Some(10),
            log_path: None,
            match_pattern: "hashcat.*job-1".to_string(),
            already_complete: false,
            exit_code: None,
        });
        record
    }

    fn evaluate(record: &JobRecord, body: &str, alive: bool) -> Verdict {
        let signals = HashcatHeuristic.scan(body);
        detector().evaluate(Observation {
            record,
            signals: &signals,
            alive,
            now: Utc::now(),
        })
    }

    #[test]
    fn unit_live_process_with_partial_progress_continues() {
        let mut record = running_record();
        record.record_counts(3, 10);
        assert_eq!(
            evaluate(&record, "Recovered........: 3/10\n", true),
            Verdict::Continue
        );
    }

    #[test]
    fn unit_explicit_cracked_wins_over_other_signals() {
        let mut record = running_record();
        record.record_counts(1, 10);
        let verdict = evaluate(
            &record,
            "Status...........: Cracked\nNo hashes loaded\nApproaching final keyspace\n",
            true,
        );
        assert!(matches!(
            verdict,
            Verdict::Finalize {
                status: JobStatus::CompletedSuccess,
                ..
            }
        ));
    }

    #[test]
    fn unit_explicit_exhausted_on_dead_process_is_exhausted() {
        let record = running_record();
        let verdict = evaluate(&record, "Status...........: Exhausted\n", false);
        assert_eq!(
            verdict,
            Verdict::Finalize {
                status: JobStatus::CompletedExhausted,
                reason: "explicit_status"
            }
        );
    }

    #[test]
    fn unit_dead_process_waits_for_idle_timeout_without_keywords() {
        let mut record = running_record();
        assert_eq!(evaluate(&record, "Status...........: Running\n", false), Verdict::Continue);

        record.output_updated_at = Some(Utc::now() - Duration::minutes(2));
        assert_eq!(
            evaluate(&record, "Status...........: Running\n", false),
            Verdict::Finalize {
                status: JobStatus::Completed,
                reason: "process_exited_idle"
            }
        );
    }

    #[test]
    fn regression_near_completion_defers_until_grace_elapses() {
        let mut record = running_record();
        record.record_progress(99.95);
        record.near_completion_at = Some(Utc::now());
        assert_eq!(
            evaluate(&record, "Approaching final keyspace\n", false),
            Verdict::Continue
        );

        record.near_completion_at = Some(Utc::now() - Duration::seconds(30));
        assert_eq!(
            evaluate(&record, "Progress.........: 99/100 (99.95%)\n", false),
            Verdict::Finalize {
                status: JobStatus::Completed,
                reason: "process_exited_near_completion"
            }
        );
    }

    #[test]
    fn unit_classification_precedence() {
        let detector = detector();
        let mut record = running_record();
        let quiet = HashcatHeuristic.scan("");

        record.record_counts(10, 10);
        assert_eq!(detector.classify(&record, &quiet), JobStatus::CompletedSuccess);

        let mut record = running_record();
        if let Some(handle) = record.session.as_mut() {
            handle.exit_code = Some(1);
        }
        assert_eq!(detector.classify(&record, &quiet), JobStatus::CompletedExhausted);

        if let Some(handle) = record.session.as_mut() {
            handle.exit_code = Some(255);
        }
        assert_eq!(detector.classify(&record, &quiet), JobStatus::Failed);

        let aborted = HashcatHeuristic.scan("Status...........: Aborted\n");
        let clean = running_record();
        assert_eq!(detector.classify(&clean, &aborted), JobStatus::Failed);
        assert_eq!(detector.classify(&clean, &quiet), JobStatus::Completed);
    }

    #[test]
    fn unit_completed_handle_finalizes_without_polling() {
        let mut record = running_record();
        if let Some(handle) = record.session.as_mut() {
            handle.already_complete = true;
            handle.exit_code = Some(0);
        }
        assert_eq!(
            evaluate(&record, "Recovered........: 0/5\n", true),
            Verdict::Finalize {
                status: JobStatus::Completed,
                reason: "synchronous_exit"
            }
        );
    }
}

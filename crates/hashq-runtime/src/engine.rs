use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use hashq_core::{current_unix_timestamp_ms, elapsed_ms_since, remove_file_if_exists};
use hashq_session::{ProbeError, SessionHandle, SessionLauncher};
use hashq_store::{FileJobStore, JobStore, JobStoreError};
use hashq_types::{next_job_id, JobRecord, JobRequest, JobStatus, JobTicket, QueueStatus};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{absolutize, BusyPolicy, EngineConfig};
use crate::detector::{CompletionDetector, Observation, Verdict};
use crate::events::EventLog;
use crate::heuristic::{CompletionHeuristic, HashcatHeuristic};
use crate::output::refresh_output;

const ORPHANED_LAUNCH: &str = "orphaned on restart: launch did not complete";
const ORPHANED_RUNNING: &str = "orphaned on restart: running job has no session handle";
const MISSING_SESSION: &str = "running job has no session handle";
const NO_OUTPUT_PLACEHOLDER: &str = "No output available";

/// Errors surfaced by the engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job '{0}' not found")]
    NotFound(String),
    #[error("engine is busy: {active} active job(s) for {limit} admission slot(s)")]
    Admission { active: usize, limit: usize },
    #[error(transparent)]
    Store(JobStoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<JobStoreError> for EngineError {
    fn from(error: JobStoreError) -> Self {
        match error {
            JobStoreError::NotFound(job_id) => Self::NotFound(job_id),
            other => Self::Store(other),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Collaborators the engine is assembled from.
pub struct EngineParts {
    pub store: Arc<dyn JobStore>,
    pub launcher: SessionLauncher,
    pub heuristic: Arc<dyn CompletionHeuristic>,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    launcher: SessionLauncher,
    detector: CompletionDetector,
    events: EventLog,
    tick_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    monitored: Mutex<HashSet<String>>,
    launches_in_flight: tokio::sync::watch::Sender<usize>,
}

/// Job lifecycle orchestrator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct JobEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEngine")
            .field("state_dir", &self.inner.config.state_dir)
            .field("admission_slots", &self.inner.config.admission_slots)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Continue,
    Done,
}

impl JobEngine {
    /// Opens the durable engine and reconciles state left by a previous run.
    pub async fn open(config: EngineConfig) -> EngineResult<Self> {
        let engine = Self::connect(config)?;
        engine.recover().await?;
        Ok(engine)
    }

    /// Opens the durable engine without touching existing jobs.
    ///
    /// Meant for short-lived clients sharing a state directory with a
    /// supervising process.
    pub fn connect(config: EngineConfig) -> EngineResult<Self> {
        let store = FileJobStore::open(&config.state_dir)?;
        let launcher = SessionLauncher::new(config.launcher.clone());
        Self::with_parts(
            config,
            EngineParts {
                store: Arc::new(store),
                launcher,
                heuristic: Arc::new(HashcatHeuristic),
            },
        )
    }

    pub fn with_parts(config: EngineConfig, parts: EngineParts) -> EngineResult<Self> {
        ensure_layout(&config)?;
        let detector = CompletionDetector::new(&config, parts.heuristic);
        let events = EventLog::new(config.events_path());
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store: parts.store,
                launcher: parts.launcher,
                detector,
                events,
                tick_locks: Mutex::new(HashMap::new()),
                monitored: Mutex::new(HashSet::new()),
                launches_in_flight: tokio::sync::watch::channel(0).0,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }

    /// Restart reconciliation: fails orphaned launches, resumes monitors and
    /// re-checks the queue.
    ///
    /// A `starting` job whose launch claim is still fresh belongs to another
    /// live process and is left alone.
    pub async fn recover(&self) -> EngineResult<()> {
        let lease = self.inner.config.launch_lease();
        for record in self.inner.store.list().await? {
            match record.status {
                JobStatus::Starting if record.launch_claim_is_live(Utc::now(), lease) => {
                    debug!(job_id = %record.id, "launch in progress elsewhere; leaving it");
                }
                JobStatus::Starting => {
                    self.inner.events.append(&record, "recovered", ORPHANED_LAUNCH);
                    self.finish_from(
                        &record.id,
                        Some(JobStatus::Starting),
                        JobStatus::Error,
                        "recovered",
                        Some(ORPHANED_LAUNCH),
                    )
                    .await;
                }
                JobStatus::Running if record.session.is_none() => {
                    self.inner.events.append(&record, "recovered", ORPHANED_RUNNING);
                    self.finish(&record.id, JobStatus::Error, "recovered", Some(ORPHANED_RUNNING))
                        .await;
                }
                JobStatus::Running => {
                    info!(job_id = %record.id, "resuming monitor after restart");
                    self.inner
                        .events
                        .append(&record, "recovered", "resumed monitoring");
                    self.ensure_monitor(&record.id);
                }
                _ => {}
            }
        }
        self.promote_queued().await;
        Ok(())
    }

    /// Creates a job and admits, queues or rejects it.
    pub async fn start_job(&self, request: JobRequest) -> EngineResult<JobTicket> {
        let inner = &self.inner;
        let cwd = std::env::current_dir()?;
        let request = JobRequest {
            hash_input_path: absolutize(&cwd, &request.hash_input_path),
            wordlist_path: absolutize(&cwd, &request.wordlist_path),
            ..request
        };

        let now = Utc::now();
        let job_id = next_job_id(now);
        let output_path = inner.config.output_dir.join(format!("hashcat_{job_id}.txt"));
        let cracked_output_path = inner
            .config
            .output_dir
            .join(format!("hashcat_{job_id}.cracked"));
        let candidate =
            JobRecord::from_request(job_id.clone(), &request, output_path, cracked_output_path, now);

        // Counting and inserting happen under the store's write lock so two
        // processes cannot both take the last slot.
        let limit = inner.config.admission_slots.max(1);
        let busy_policy = inner.config.busy_policy;
        let admit_when_busy = request.admit_when_busy;
        let mut active = 0;
        let observed_active = &mut active;
        let written = inner
            .store
            .transact(Box::new(move |records| {
                if records.iter().any(|record| record.id == candidate.id) {
                    return Err(JobStoreError::AlreadyExists(candidate.id));
                }
                *observed_active = count_active(records);
                let status = if *observed_active < limit {
                    JobStatus::Starting
                } else if admit_when_busy {
                    JobStatus::Queued
                } else {
                    match busy_policy {
                        BusyPolicy::SoftAllow => JobStatus::Starting,
                        BusyPolicy::Reject => return Ok(Vec::new()),
                    }
                };
                let mut record = candidate;
                if status == JobStatus::Queued {
                    record.status = JobStatus::Queued;
                    record.queued_at = Some(now);
                } else {
                    record.launch_claimed_at = Some(now);
                }
                Ok(vec![record])
            }))
            .await?;
        let Some(record) = written.into_iter().next() else {
            return Err(EngineError::Admission { active, limit });
        };
        let status = record.status;
        if status == JobStatus::Starting && active >= limit {
            warn!(active, limit, "admitting job beyond the slot limit");
        }

        info!(job_id = %job_id, status = %status, active, limit, "job created");
        inner.events.append(&record, "created", "job accepted");
        let detail = match status {
            JobStatus::Queued => "waiting for an admission slot",
            _ if active >= limit => "admitted beyond the slot limit",
            _ => "admitted",
        };
        inner.events.append(&record, status.as_str(), detail);
        if status == JobStatus::Starting {
            self.spawn_launch(&job_id, now);
        }
        Ok(JobTicket { job_id, status })
    }

    pub async fn get_job(&self, job_id: &str) -> EngineResult<JobRecord> {
        self.inner
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(job_id.to_string()))
    }

    /// Every job, newest first.
    pub async fn list_jobs(&self) -> EngineResult<Vec<JobRecord>> {
        Ok(self.inner.store.list().await?)
    }

    pub async fn queue_status(&self) -> EngineResult<QueueStatus> {
        let records = self.inner.store.list().await?;
        Ok(QueueStatus::from_records(&records))
    }

    /// Output artifact bytes; writes a placeholder when none exists yet.
    pub async fn job_output(&self, job_id: &str) -> EngineResult<Vec<u8>> {
        let record = self.get_job(job_id).await?;
        match tokio::fs::read(&record.output_path).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                let placeholder = render_placeholder(&record);
                if let Some(parent) = record.output_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&record.output_path, &placeholder).await?;
                Ok(placeholder.into_bytes())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Runs one synchronous monitoring pass for a running job.
    ///
    /// Other states are returned unchanged.
    pub async fn refresh_job(&self, job_id: &str) -> EngineResult<JobRecord> {
        let record = self.get_job(job_id).await?;
        if record.status != JobStatus::Running {
            return Ok(record);
        }
        self.tick(job_id).await;
        self.get_job(job_id).await
    }

    /// Removes a job from any state and stops its session best-effort.
    pub async fn delete_job(&self, job_id: &str) -> EngineResult<bool> {
        let inner = &self.inner;
        let Some(record) = inner.store.remove(job_id).await? else {
            return Ok(false);
        };
        info!(job_id, status = %record.status, "job deleted");
        inner.events.append(&record, "deleted", "job removed");
        lock_unpoisoned(&inner.tick_locks).remove(job_id);

        if let Some(handle) = record.session.as_ref() {
            inner.launcher.terminate(handle).await;
        }
        for path in [&record.output_path, &record.cracked_output_path] {
            if let Err(error) = remove_file_if_exists(path) {
                warn!(job_id, error = %format!("{error:#}"), "failed to remove job artifact");
            }
        }
        self.promote_queued().await;
        Ok(true)
    }

    /// Resolves once no launch started by this engine is still running.
    ///
    /// Short-lived clients call this before exiting so a promotion they made
    /// is not left to a supervisor.
    pub async fn wait_for_launches(&self) {
        let mut in_flight = self.inner.launches_in_flight.subscribe();
        if let Err(error) = in_flight.wait_for(|count| *count == 0).await {
            debug!(%error, "launch tracker closed");
        };
    }

    /// Describes degraded durability of the job store, if any.
    pub fn persistence_warning(&self) -> Option<String> {
        self.inner.store.persistence_warning()
    }

    /// Adopts running jobs without a local monitor and `starting` jobs whose
    /// launcher went away, then re-checks the queue.
    pub async fn supervise_tick(&self) -> EngineResult<()> {
        let lease = self.inner.config.launch_lease();
        for record in self.inner.store.list().await? {
            match record.status {
                JobStatus::Running => self.ensure_monitor(&record.id),
                JobStatus::Starting if !record.launch_claim_is_live(Utc::now(), lease) => {
                    self.adopt_launch(&record.id).await;
                }
                _ => {}
            }
        }
        self.promote_queued().await;
        Ok(())
    }

    /// Takes over the launch of a `starting` job whose claim has lapsed.
    async fn adopt_launch(&self, job_id: &str) {
        let inner = &self.inner;
        let now = Utc::now();
        let lease = inner.config.launch_lease();
        let claimed = inner
            .store
            .update(
                job_id,
                Box::new(move |record| {
                    record.claim_launch(now, lease);
                    Ok(())
                }),
            )
            .await;
        match claimed {
            Ok(record) if record.launch_claimed_at == Some(now) => {
                info!(job_id, "adopting stalled launch");
                inner.events.append(&record, "starting", "launch adopted");
                self.spawn_launch(job_id, now);
            }
            Ok(_) | Err(JobStoreError::NotFound(_)) => {}
            Err(error) => warn!(job_id, %error, "failed to claim stalled launch"),
        }
    }

    fn spawn_launch(&self, job_id: &str, claimed_at: DateTime<Utc>) {
        let tracked = LaunchInFlight::new(self.clone());
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tracked.engine.launch_job(&job_id, claimed_at).await;
        });
    }

    /// Keeps a launch claim fresh while a slow launch is in flight.
    fn spawn_claim_renewal(
        &self,
        job_id: &str,
        claimed_at: DateTime<Utc>,
    ) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let mut held = claimed_at;
            loop {
                tokio::time::sleep(engine.inner.config.launch_lease_renewal()).await;
                let now = Utc::now();
                let renewed = engine
                    .inner
                    .store
                    .update(
                        &job_id,
                        Box::new(move |record| {
                            if record.status == JobStatus::Starting
                                && record.launch_claimed_at == Some(held)
                            {
                                record.launch_claimed_at = Some(now);
                            }
                            Ok(())
                        }),
                    )
                    .await;
                match renewed {
                    Ok(record) if record.launch_claimed_at == Some(now) => held = now,
                    Ok(_) | Err(JobStoreError::NotFound(_)) => return,
                    Err(error) => warn!(job_id, %error, "failed to renew launch claim"),
                }
            }
        })
    }

    async fn launch_job(&self, job_id: &str, claimed_at: DateTime<Utc>) {
        let inner = &self.inner;
        let record = match inner.store.get(job_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(error) => {
                warn!(job_id, %error, "failed to load job for launch");
                return;
            }
        };
        if record.status != JobStatus::Starting || record.launch_claimed_at != Some(claimed_at) {
            debug!(job_id, status = %record.status, "launch owned elsewhere; skipping");
            return;
        }

        let renewal = AbortOnDrop(self.spawn_claim_renewal(job_id, claimed_at));
        let launched = inner.launcher.launch(&record).await;
        drop(renewal);
        let handle = match launched {
            Ok(handle) => handle,
            Err(error) => {
                warn!(job_id, %error, "job launch failed");
                let detail = error.to_string();
                if self
                    .finish_from(
                        job_id,
                        Some(JobStatus::Starting),
                        JobStatus::Error,
                        "launch_failed",
                        Some(&detail),
                    )
                    .await
                    .is_some()
                {
                    self.promote_queued().await;
                }
                return;
            }
        };

        let now = Utc::now();
        let session = handle.clone();
        let updated = inner
            .store
            .update(
                job_id,
                Box::new(move |record| {
                    if record.status != JobStatus::Starting {
                        return Err(JobStoreError::InvalidTransition {
                            from: record.status,
                            to: JobStatus::Running,
                        });
                    }
                    record.transition(JobStatus::Running, now)?;
                    record.session = Some(session);
                    record.output_updated_at = Some(now);
                    Ok(())
                }),
            )
            .await;
        match updated {
            Ok(record) => {
                info!(job_id, backend = %handle.kind, session = %handle.name, "job running");
                inner.events.append(
                    &record,
                    "running",
                    &format!("backend={} session={}", handle.kind, handle.name),
                );
                self.ensure_monitor(job_id);
            }
            Err(JobStoreError::NotFound(_)) => {
                debug!(job_id, "job deleted while launching; stopping session");
                inner.launcher.terminate(&handle).await;
                if let Err(error) = remove_file_if_exists(&record.output_path) {
                    warn!(job_id, error = %format!("{error:#}"), "failed to remove output of deleted job");
                }
            }
            Err(JobStoreError::InvalidTransition { from, .. }) => {
                warn!(job_id, status = %from, "job left starting during launch; stopping new session");
                inner.launcher.terminate(&handle).await;
            }
            Err(error) => {
                warn!(job_id, %error, "failed to record launched session");
                inner.launcher.terminate(&handle).await;
                let detail = error.to_string();
                self.finalize(job_id, JobStatus::Error, "launch_failed", Some(&detail))
                    .await;
            }
        }
    }

    fn ensure_monitor(&self, job_id: &str) {
        if !lock_unpoisoned(&self.inner.monitored).insert(job_id.to_string()) {
            return;
        }
        let engine = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            engine.monitor_loop(&job_id).await;
            lock_unpoisoned(&engine.inner.monitored).remove(&job_id);
        });
    }

    async fn monitor_loop(&self, job_id: &str) {
        loop {
            if self.tick(job_id).await == TickOutcome::Done {
                debug!(job_id, "monitor finished");
                return;
            }
            tokio::time::sleep(self.inner.config.poll_interval()).await;
        }
    }

    fn tick_lock(&self, job_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock_unpoisoned(&self.inner.tick_locks)
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }

    async fn tick(&self, job_id: &str) -> TickOutcome {
        let lock = self.tick_lock(job_id);
        let _guard = lock.lock().await;
        let started_ms = current_unix_timestamp_ms();
        let outcome = self.tick_locked(job_id).await;
        debug!(job_id, elapsed_ms = elapsed_ms_since(started_ms), ?outcome, "monitor tick");
        if outcome == TickOutcome::Done {
            lock_unpoisoned(&self.inner.tick_locks).remove(job_id);
        }
        outcome
    }

    async fn tick_locked(&self, job_id: &str) -> TickOutcome {
        let inner = &self.inner;
        let record = match inner.store.get(job_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return TickOutcome::Done,
            Err(error) => {
                warn!(job_id, %error, "failed to load job; skipping tick");
                return TickOutcome::Continue;
            }
        };
        if record.status != JobStatus::Running {
            return TickOutcome::Done;
        }
        let Some(handle) = record.session.clone() else {
            self.finalize(job_id, JobStatus::Error, "missing_session", Some(MISSING_SESSION))
                .await;
            return TickOutcome::Done;
        };

        let alive = if handle.already_complete {
            false
        } else {
            match self.probe_liveness(&handle).await {
                Ok(alive) => alive,
                Err(error) => return self.record_probe_failure(job_id, &error.to_string()).await,
            }
        };

        let captured = match inner.launcher.capture(&handle).await {
            Ok(captured) => captured,
            Err(error) => {
                warn!(job_id, %error, "output capture failed; keeping previous body");
                None
            }
        };
        let snapshot = match refresh_output(&record.output_path, captured.as_deref()) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(job_id, error = %format!("{error:#}"), "failed to refresh output; skipping tick");
                return TickOutcome::Continue;
            }
        };
        let signals = inner.detector.heuristic().scan(&snapshot.body);

        let now = Utc::now();
        let detector = &inner.detector;
        let observed = &signals;
        let output_changed = snapshot.changed;
        let updated = inner
            .store
            .update(
                job_id,
                Box::new(move |record| {
                    record.transition(JobStatus::Running, now)?;
                    record.probe_failures = 0;
                    if let Some((cracked, total)) = observed.counts {
                        record.record_counts(cracked, total);
                    }
                    if let Some(line) = observed.recovered_line.as_ref() {
                        record.progress_line = Some(line.clone());
                    }
                    if let Some(percent) = observed.progress_percent {
                        record.record_progress(percent);
                    }
                    if output_changed {
                        record.output_updated_at = Some(now);
                    }
                    if record.near_completion_at.is_none() && detector.is_near_completion(record) {
                        record.near_completion_at = Some(now);
                    }
                    Ok(())
                }),
            )
            .await;
        let updated = match updated {
            Ok(updated) => updated,
            Err(JobStoreError::NotFound(_) | JobStoreError::InvalidTransition { .. }) => {
                return TickOutcome::Done
            }
            Err(error) => {
                warn!(job_id, %error, "failed to record progress; skipping tick");
                return TickOutcome::Continue;
            }
        };

        if (updated.cracked_count, updated.total_count) != (record.cracked_count, record.total_count)
        {
            info!(
                job_id,
                cracked = updated.cracked_count,
                total = updated.total_count,
                "job progress"
            );
            inner.events.append(
                &updated,
                "progress",
                updated.progress_line.as_deref().unwrap_or_default(),
            );
        }

        match inner.detector.evaluate(Observation {
            record: &updated,
            signals: &signals,
            alive,
            now,
        }) {
            Verdict::Continue => TickOutcome::Continue,
            Verdict::Finalize { status, reason } => {
                self.finalize(job_id, status, reason, None).await;
                TickOutcome::Done
            }
        }
    }

    /// A negative answer counts only when a second probe agrees.
    async fn probe_liveness(&self, handle: &SessionHandle) -> Result<bool, ProbeError> {
        let launcher = &self.inner.launcher;
        if launcher.is_alive(handle).await? {
            return Ok(true);
        }
        tokio::time::sleep(self.inner.config.liveness_confirm_delay()).await;
        launcher.is_alive(handle).await
    }

    async fn record_probe_failure(&self, job_id: &str, detail: &str) -> TickOutcome {
        let updated = self
            .inner
            .store
            .update(
                job_id,
                Box::new(|record| {
                    record.probe_failures = record.probe_failures.saturating_add(1);
                    Ok(())
                }),
            )
            .await;
        let failures = match updated {
            Ok(record) => record.probe_failures,
            Err(JobStoreError::NotFound(_)) => return TickOutcome::Done,
            Err(error) => {
                warn!(job_id, %error, "failed to record probe failure");
                return TickOutcome::Continue;
            }
        };
        let limit = self.inner.config.max_probe_failures.max(1);
        warn!(job_id, failures, limit, error = detail, "liveness probe failed; skipping tick");
        if failures < limit {
            return TickOutcome::Continue;
        }
        let message = format!("liveness probe failed {failures} consecutive times: {detail}");
        self.finalize(job_id, JobStatus::Error, "probe_failures", Some(&message))
            .await;
        TickOutcome::Done
    }

    async fn finalize(&self, job_id: &str, status: JobStatus, reason: &str, error: Option<&str>) {
        if self.finish(job_id, status, reason, error).await.is_some() {
            self.promote_queued().await;
        }
    }

    /// Performs the terminal transition; `None` when another caller won it.
    async fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        reason: &str,
        error: Option<&str>,
    ) -> Option<JobRecord> {
        self.finish_from(job_id, None, status, reason, error).await
    }

    /// Like `finish`, but only from `from` when given.
    async fn finish_from(
        &self,
        job_id: &str,
        from: Option<JobStatus>,
        status: JobStatus,
        reason: &str,
        error: Option<&str>,
    ) -> Option<JobRecord> {
        let inner = &self.inner;
        let now = Utc::now();
        let last_error = error.map(str::to_string);
        let result = inner
            .store
            .update(
                job_id,
                Box::new(move |record| {
                    if from.is_some_and(|from| from != record.status) {
                        return Err(JobStoreError::InvalidTransition {
                            from: record.status,
                            to: status,
                        });
                    }
                    record.transition(status, now)?;
                    if last_error.is_some() {
                        record.last_error = last_error;
                    }
                    Ok(())
                }),
            )
            .await;
        let record = match result {
            Ok(record) => record,
            Err(JobStoreError::InvalidTransition { from, to }) => {
                debug!(job_id, %from, %to, "terminal transition already taken");
                return None;
            }
            Err(JobStoreError::NotFound(_)) => return None,
            Err(error) => {
                warn!(job_id, %error, "failed to record terminal status");
                return None;
            }
        };

        info!(
            job_id,
            status = %record.status,
            reason,
            cracked = record.cracked_count,
            total = record.total_count,
            "job finished"
        );
        inner
            .events
            .append(&record, record.status.as_str(), error.unwrap_or(reason));
        if let Some(handle) = record.session.as_ref() {
            if status == JobStatus::Error {
                inner.launcher.terminate(handle).await;
            } else {
                inner.launcher.release_artifacts(handle).await;
            }
        }
        Some(self.consume_input(record).await)
    }

    /// Deletes the hash input of an auto-delete job after its terminal transition.
    async fn consume_input(&self, record: JobRecord) -> JobRecord {
        if !record.auto_delete_input || record.input_deleted {
            return record;
        }
        let inner = &self.inner;
        let removed = match remove_file_if_exists(&record.hash_input_path) {
            Ok(removed) => removed,
            Err(error) => {
                warn!(job_id = %record.id, error = %format!("{error:#}"), "failed to delete hash input");
                return record;
            }
        };
        let marked = inner
            .store
            .update(
                &record.id,
                Box::new(|record| {
                    record.input_deleted = true;
                    Ok(())
                }),
            )
            .await;
        let record = match marked {
            Ok(marked) => marked,
            Err(error) => {
                warn!(job_id = %record.id, %error, "failed to record hash input deletion");
                record
            }
        };
        info!(job_id = %record.id, removed, "hash input consumed");
        inner.events.append(
            &record,
            "auto_deleted_input",
            &format!("{} removed={removed}", record.hash_input_path.display()),
        );
        record
    }

    /// Promotes the oldest queued jobs while admission slots are free.
    async fn promote_queued(&self) {
        let inner = &self.inner;
        let limit = inner.config.admission_slots.max(1);
        loop {
            let now = Utc::now();
            let promoted = inner
                .store
                .transact(Box::new(move |records| {
                    if count_active(records) >= limit {
                        return Ok(Vec::new());
                    }
                    let Some(next) = records
                        .iter()
                        .filter(|record| record.status == JobStatus::Queued)
                        .min_by(|left, right| {
                            left.queued_at
                                .cmp(&right.queued_at)
                                .then_with(|| left.created_at.cmp(&right.created_at))
                                .then_with(|| left.id.cmp(&right.id))
                        })
                    else {
                        return Ok(Vec::new());
                    };
                    let mut next = next.clone();
                    next.transition(JobStatus::Starting, now)?;
                    next.launch_claimed_at = Some(now);
                    Ok(vec![next])
                }))
                .await;
            match promoted {
                Ok(records) => {
                    let Some(record) = records.into_iter().next() else {
                        return;
                    };
                    info!(job_id = %record.id, "queued job promoted");
                    inner.events.append(&record, "starting", "promoted from queue");
                    self.spawn_launch(&record.id, now);
                }
                Err(error) => {
                    warn!(%error, "failed to promote queued job");
                    return;
                }
            }
        }
    }
}

/// Counts a launch task from spawn until its future completes or is dropped.
struct LaunchInFlight {
    engine: JobEngine,
}

impl LaunchInFlight {
    fn new(engine: JobEngine) -> Self {
        engine
            .inner
            .launches_in_flight
            .send_modify(|count| *count += 1);
        Self { engine }
    }
}

impl Drop for LaunchInFlight {
    fn drop(&mut self) {
        self.engine
            .inner
            .launches_in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn count_active(records: &[JobRecord]) -> usize {
    records
        .iter()
        .filter(|record| record.status.occupies_slot())
        .count()
}

fn ensure_layout(config: &EngineConfig) -> std::io::Result<()> {
    std::fs::create_dir_all(config.state_dir.join("jobs"))?;
    std::fs::create_dir_all(&config.output_dir)?;
    if let Some(parent) = config
        .launcher
        .potfile_path
        .as_ref()
        .and_then(|path| path.parent())
    {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn render_placeholder(record: &JobRecord) -> String {
    let stamp = |value: Option<chrono::DateTime<Utc>>| {
        value
            .map(|value| value.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    };
    format!(
        "Job ID: {}\nStatus: {}\nCreated: {}\nStarted: {}\nCompleted: {}\n\n{NO_OUTPUT_PLACEHOLDER}\n",
        record.id,
        record.status,
        record.created_at.to_rfc3339(),
        stamp(record.started_at),
        stamp(record.completed_at),
    )
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hashq_runtime::{EngineConfig, JobEngine};
use hashq_session::{HostCapabilities, LauncherConfig, SessionKind};
use hashq_types::{JobRecord, JobRequest, JobStatus};
use tempfile::tempdir;

const FAKE_TOOL: &str = r#"#!/bin/sh
echo "Session..........: hashcat"
echo "Status...........: Running"
echo "Progress.........: 50/100 (50.00%)"
echo "Recovered........: 1/2 (50.00%) Digests"
sleep 1
echo "Progress.........: 100/100 (100.00%)"
echo "Recovered........: 2/2 (100.00%) Digests"
echo "Status...........: Cracked"
"#;

fn write_fake_tool(dir: &Path) -> PathBuf {
    let path = dir.join("fake-hashcat");
    std::fs::write(&path, FAKE_TOOL).expect("write fake tool");
    let mut permissions = std::fs::metadata(&path).expect("metadata").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod");
    path
}

fn engine_config(root: &Path, backend: SessionKind) -> EngineConfig {
    EngineConfig {
        state_dir: root.join("state"),
        output_dir: root.join("outputs"),
        poll_interval_ms: 100,
        liveness_confirm_delay_ms: 50,
        idle_timeout_ms: 5_000,
        launcher: LauncherConfig {
            tool_binary: write_fake_tool(root).display().to_string(),
            preferred_backend: Some(backend),
            ..LauncherConfig::default()
        },
        ..EngineConfig::default()
    }
    .resolved()
    .expect("resolve config")
}

fn job_request(root: &Path, auto_delete_input: bool) -> JobRequest {
    let hashes = root.join("hashes.txt");
    let wordlist = root.join("words.txt");
    std::fs::write(&hashes, "5f4dcc3b5aa765d61d8327deb882cf99\n").expect("hashes");
    std::fs::write(&wordlist, "password\n").expect("wordlist");
    JobRequest {
        hash_mode: "0".to_string(),
        attack_mode: "0".to_string(),
        hash_input_path: hashes,
        wordlist_path: wordlist,
        auto_delete_input,
        ..JobRequest::default()
    }
}

async fn wait_for_terminal_status(engine: &JobEngine, job_id: &str) -> JobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let record = engine.get_job(job_id).await.expect("job exists");
        if record.status.is_terminal() {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} did not finish; last status {}",
            record.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn integration_disowned_fake_tool_runs_to_cracked() {
    if !HostCapabilities::detect().disowned {
        eprintln!("skipping: nohup is not available");
        return;
    }
    let temp = tempdir().expect("tempdir");
    let engine = JobEngine::open(engine_config(temp.path(), SessionKind::Disowned))
        .await
        .expect("open engine");

    let request = job_request(temp.path(), true);
    let hashes = request.hash_input_path.clone();
    let ticket = engine.start_job(request).await.expect("start");
    assert_eq!(ticket.status, JobStatus::Starting);

    let record = wait_for_terminal_status(&engine, &ticket.job_id).await;
    assert_eq!(record.status, JobStatus::CompletedSuccess, "{record:?}");
    assert_eq!((record.cracked_count, record.total_count), (2, 2));
    assert!(record.completed_at.is_some());
    assert!(record.input_deleted);
    assert!(!hashes.exists());
    let handle = record.session.as_ref().expect("session handle");
    assert_eq!(handle.kind, SessionKind::Disowned);

    let output = String::from_utf8(engine.job_output(&ticket.job_id).await.expect("output"))
        .expect("utf8");
    assert!(output.starts_with("COMMAND:\n"));
    assert!(output.contains("Status...........: Cracked"));
}

#[tokio::test]
async fn integration_synchronous_fake_tool_persists_across_reopen() {
    let temp = tempdir().expect("tempdir");
    let config = engine_config(temp.path(), SessionKind::Synchronous);
    let engine = JobEngine::open(config.clone()).await.expect("open engine");

    let ticket = engine
        .start_job(job_request(temp.path(), false))
        .await
        .expect("start");
    let record = wait_for_terminal_status(&engine, &ticket.job_id).await;
    assert_eq!(record.status, JobStatus::CompletedSuccess);
    assert_eq!(record.session.as_ref().and_then(|handle| handle.exit_code), Some(0));

    let manifest = config
        .state_dir
        .join("jobs")
        .join(format!("{}.json", ticket.job_id));
    let persisted: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&manifest).expect("manifest"))
            .expect("manifest json");
    assert_eq!(persisted["status"], "completed_success");

    let reopened = JobEngine::open(config.clone()).await.expect("reopen");
    let listed = reopened.list_jobs().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0], record);
    let queue = reopened.queue_status().await.expect("queue");
    assert!(!queue.has_running);
    assert_eq!(queue.total_count, 1);

    let events = std::fs::read_to_string(config.events_path()).expect("events");
    let kinds = events
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|event| event["event"].as_str().map(str::to_string))
        .collect::<Vec<_>>();
    for expected in ["created", "starting", "running", "completed_success"] {
        assert!(kinds.iter().any(|kind| kind == expected), "missing {expected} in {kinds:?}");
    }

    assert!(reopened.delete_job(&ticket.job_id).await.expect("delete"));
    assert!(!manifest.exists());
    assert!(!record.output_path.exists());
}

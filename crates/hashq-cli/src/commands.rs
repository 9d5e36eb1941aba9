use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use hashq_runtime::{EngineConfig, JobEngine};
use hashq_types::JobStatus;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::cli_args::{CliCommand, StartArgs};

pub(crate) async fn execute_command(command: CliCommand, config: EngineConfig) -> Result<()> {
    match command {
        CliCommand::Supervise { sweep_interval_ms } => {
            supervise(config, Duration::from_millis(sweep_interval_ms)).await
        }
        CliCommand::Start(args) => start(config, args).await,
        CliCommand::List => {
            let engine = JobEngine::connect(config)?;
            print_json(&engine.list_jobs().await?)
        }
        CliCommand::Show { job_id } => {
            let engine = JobEngine::connect(config)?;
            print_json(&engine.get_job(&job_id).await?)
        }
        CliCommand::Queue => {
            let engine = JobEngine::connect(config)?;
            print_json(&engine.queue_status().await?)
        }
        CliCommand::Refresh { job_id } => {
            let engine = JobEngine::connect(config)?;
            let record = engine.refresh_job(&job_id).await?;
            engine.wait_for_launches().await;
            report_persistence(&engine);
            print_json(&record)
        }
        CliCommand::Output { job_id } => {
            let engine = JobEngine::connect(config)?;
            let bytes = engine.job_output(&job_id).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes).context("failed to write job output")?;
            stdout.flush().context("failed to flush stdout")
        }
        CliCommand::Delete { job_id } => {
            let engine = JobEngine::connect(config)?;
            let deleted = engine.delete_job(&job_id).await?;
            engine.wait_for_launches().await;
            print_json(&json!({ "job_id": job_id, "deleted": deleted }))
        }
    }
}

async fn supervise(config: EngineConfig, sweep_interval: Duration) -> Result<()> {
    let engine = JobEngine::open(config).await?;
    info!(state_dir = %engine.config().state_dir.display(), "supervisor started");
    report_persistence(&engine);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("supervisor stopping");
                return Ok(());
            }
            _ = tokio::time::sleep(sweep_interval) => {
                if let Err(error) = engine.supervise_tick().await {
                    warn!(%error, "supervisor sweep failed");
                }
                report_persistence(&engine);
            }
        }
    }
}

/// Creates a job and stays alive until its launch has been recorded.
///
/// With `--wait` this process also supervises until the job is terminal.
async fn start(config: EngineConfig, args: StartArgs) -> Result<()> {
    let engine = JobEngine::connect(config)?;
    let ticket = engine.start_job(args.to_request()).await?;
    let poll = Duration::from_millis(args.wait_poll_ms);

    let record = loop {
        let record = engine.get_job(&ticket.job_id).await?;
        let settled = if args.wait {
            record.status.is_terminal()
        } else {
            record.status != JobStatus::Starting
        };
        if settled {
            break record;
        }
        if args.wait {
            engine.supervise_tick().await?;
        }
        tokio::time::sleep(if args.wait { poll } else { Duration::from_millis(50) }).await;
    };
    report_persistence(&engine);
    print_json(&record)
}

fn report_persistence(engine: &JobEngine) {
    if let Some(warning) = engine.persistence_warning() {
        warn!(%warning, "job store is degraded");
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render JSON")?;
    println!("{rendered}");
    Ok(())
}

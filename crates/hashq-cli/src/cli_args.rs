use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use hashq_session::SessionKind;
use hashq_types::JobRequest;

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_session_kind(value: &str) -> Result<SessionKind, String> {
    SessionKind::parse(value).ok_or_else(|| {
        format!("unknown backend '{value}' (expected tmux, screen, disowned or synchronous)")
    })
}

#[derive(Debug, Parser)]
#[command(
    name = "hashq",
    about = "Queue, launch and supervise long-running hashcat jobs",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "HASHQ_CONFIG",
        default_value = "hashq.toml",
        global = true,
        help = "Engine config file (TOML); missing file means defaults"
    )]
    pub(crate) config: PathBuf,

    #[arg(long, env = "HASHQ_STATE_DIR", global = true)]
    pub(crate) state_dir: Option<PathBuf>,

    #[arg(long, env = "HASHQ_OUTPUT_DIR", global = true)]
    pub(crate) output_dir: Option<PathBuf>,

    #[arg(long, env = "HASHQ_TOOL_BINARY", global = true)]
    pub(crate) tool_binary: Option<String>,

    #[arg(
        long,
        env = "HASHQ_ADMISSION_SLOTS",
        value_parser = parse_positive_usize,
        global = true
    )]
    pub(crate) admission_slots: Option<usize>,

    #[arg(
        long,
        env = "HASHQ_BACKEND",
        value_parser = parse_session_kind,
        global = true,
        help = "Force one session backend instead of auto-selection"
    )]
    pub(crate) backend: Option<SessionKind>,

    #[arg(short, long, global = true, help = "Log lifecycle events at info level")]
    pub(crate) verbose: bool,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Reconcile state, then monitor jobs and promote the queue until Ctrl-C.
    Supervise {
        #[arg(long, default_value_t = 5_000, value_parser = parse_positive_u64)]
        sweep_interval_ms: u64,
    },
    /// Create a job.
    Start(StartArgs),
    /// List every job, newest first.
    List,
    /// Show one job record.
    Show { job_id: String },
    /// Show admission and queue counters.
    Queue,
    /// Run one monitoring pass for a job and show the result.
    Refresh { job_id: String },
    /// Print a job's captured output.
    Output { job_id: String },
    /// Delete a job, stopping its session.
    Delete { job_id: String },
}

#[derive(Debug, Args)]
pub(crate) struct StartArgs {
    #[arg(short = 'm', long)]
    pub(crate) hash_mode: String,

    #[arg(short = 'a', long, default_value = "0")]
    pub(crate) attack_mode: String,

    pub(crate) hash_file: PathBuf,

    pub(crate) wordlist: PathBuf,

    #[arg(
        long,
        default_value = "",
        allow_hyphen_values = true,
        help = "Additional tool options, shell-quoted"
    )]
    pub(crate) extra_options: String,

    #[arg(long, help = "Delete the hash file once the job is finished")]
    pub(crate) auto_delete_input: bool,

    #[arg(long, help = "Queue the job instead of starting it when busy")]
    pub(crate) queue: bool,

    #[arg(long, help = "Block until the job reaches a terminal state")]
    pub(crate) wait: bool,

    #[arg(long, default_value_t = 2_000, value_parser = parse_positive_u64)]
    pub(crate) wait_poll_ms: u64,
}

impl StartArgs {
    pub(crate) fn to_request(&self) -> JobRequest {
        JobRequest {
            hash_mode: self.hash_mode.clone(),
            attack_mode: self.attack_mode.clone(),
            hash_input_path: self.hash_file.clone(),
            wordlist_path: self.wordlist.clone(),
            extra_options: self.extra_options.clone(),
            auto_delete_input: self.auto_delete_input,
            admit_when_busy: self.queue,
        }
    }
}

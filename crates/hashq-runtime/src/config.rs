//! Engine configuration, loadable from TOML.
//!
//! ```toml
//! state_dir = "/var/lib/hashq"
//! output_dir = "/var/lib/hashq/outputs"
//! admission_slots = 1
//! busy_policy = "soft_allow"      # or "reject"
//! poll_interval_ms = 5000
//!
//! [launcher]
//! tool_binary = "hashcat"
//! preferred_backend = "tmux"      # tmux, screen, disowned, synchronous
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hashq_session::LauncherConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_STATE_DIR: &str = ".hashq";
const DEFAULT_OUTPUT_DIR: &str = ".hashq/outputs";
const DEFAULT_POTFILE_NAME: &str = "hashcat.potfile";

/// What `start_job` does when every admission slot is taken and the caller
/// did not ask to be queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Start anyway, exceeding the slot limit.
    #[default]
    SoftAllow,
    /// Refuse with an admission error and create nothing.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub state_dir: PathBuf,
    pub output_dir: PathBuf,
    pub admission_slots: usize,
    pub busy_policy: BusyPolicy,
    pub poll_interval_ms: u64,
    pub liveness_confirm_delay_ms: u64,
    pub idle_timeout_ms: u64,
    pub near_completion_percent: f64,
    pub near_completion_grace_ms: u64,
    pub max_probe_failures: u32,
    /// How long a launch claim on a `starting` job stays valid without renewal.
    pub launch_lease_ms: u64,
    pub launcher: LauncherConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            admission_slots: 1,
            busy_policy: BusyPolicy::SoftAllow,
            poll_interval_ms: 5_000,
            liveness_confirm_delay_ms: 1_500,
            idle_timeout_ms: 90_000,
            near_completion_percent: 99.9,
            near_completion_grace_ms: 10_000,
            max_probe_failures: 3,
            launch_lease_ms: 60_000,
            launcher: LauncherConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse engine config")
    }

    /// Loads `path`, or returns defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Makes directories absolute and fills the default potfile location.
    pub fn resolved(mut self) -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to resolve working directory")?;
        self.state_dir = absolutize(&cwd, &self.state_dir);
        self.output_dir = absolutize(&cwd, &self.output_dir);
        self.admission_slots = self.admission_slots.max(1);
        self.launcher.potfile_path = Some(match self.launcher.potfile_path.take() {
            Some(path) => absolutize(&cwd, &path),
            None => self.state_dir.join(DEFAULT_POTFILE_NAME),
        });
        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn liveness_confirm_delay(&self) -> Duration {
        Duration::from_millis(self.liveness_confirm_delay_ms)
    }

    pub fn launch_lease(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.launch_lease_ms.max(1)).unwrap_or(i64::MAX))
    }

    /// Renewal period for a held launch claim.
    pub fn launch_lease_renewal(&self) -> Duration {
        Duration::from_millis((self.launch_lease_ms / 3).max(1))
    }

    pub fn events_path(&self) -> PathBuf {
        self.state_dir.join("events.jsonl")
    }
}

/// Joins relative paths onto `base`.
pub fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::{BusyPolicy, EngineConfig};
    use hashq_types::SessionKind;

    #[test]
    fn unit_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            admission_slots = 2
            busy_policy = "reject"

            [launcher]
            tool_binary = "/opt/hashcat/hashcat.bin"
            preferred_backend = "screen"
            "#,
        )
        .expect("parse");
        assert_eq!(config.admission_slots, 2);
        assert_eq!(config.busy_policy, BusyPolicy::Reject);
        assert_eq!(config.poll_interval_ms, 5_000);
        assert_eq!(config.idle_timeout_ms, 90_000);
        assert_eq!(config.launch_lease_ms, 60_000);
        assert_eq!(config.launcher.tool_binary, "/opt/hashcat/hashcat.bin");
        assert_eq!(config.launcher.preferred_backend, Some(SessionKind::Screen));
        assert_eq!(config.launcher.status_timer_secs, 1);
    }

    #[test]
    fn unit_unknown_busy_policy_is_rejected() {
        let error = EngineConfig::from_toml_str("busy_policy = \"maybe\"").expect_err("invalid");
        assert!(format!("{error:#}").contains("busy_policy") || format!("{error:#}").contains("variant"));
    }

    #[test]
    fn unit_resolved_paths_are_absolute_with_default_potfile() {
        let config = EngineConfig {
            admission_slots: 0,
            ..EngineConfig::default()
        }
        .resolved()
        .expect("resolve");
        assert!(config.state_dir.is_absolute());
        assert!(config.output_dir.is_absolute());
        assert_eq!(config.admission_slots, 1);
        assert_eq!(
            config.launcher.potfile_path,
            Some(config.state_dir.join("hashcat.potfile"))
        );
    }

    #[test]
    fn unit_missing_config_file_yields_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::load(&temp.path().join("hashq.toml")).expect("load");
        assert_eq!(config, EngineConfig::default());
    }
}

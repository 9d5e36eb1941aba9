use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_MAX_FILES: usize = 5;
const MAX_BYTES_ENV: &str = "HASHQ_LOG_ROTATION_MAX_BYTES";
const MAX_FILES_ENV: &str = "HASHQ_LOG_ROTATION_MAX_FILES";

/// Size-based rotation settings for append-only JSONL logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

impl LogRotationPolicy {
    /// Reads `HASHQ_LOG_ROTATION_MAX_BYTES` / `HASHQ_LOG_ROTATION_MAX_FILES`,
    /// falling back to defaults for missing, zero or unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_bytes: positive_env(MAX_BYTES_ENV).unwrap_or(defaults.max_bytes),
            max_files: positive_env(MAX_FILES_ENV)
                .and_then(|value| usize::try_from(value).ok())
                .unwrap_or(defaults.max_files),
        }
    }

    pub fn is_enabled(self) -> bool {
        self.max_bytes > 0 && self.max_files > 0
    }
}

fn positive_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}

/// Appends one line to `path`, rotating first when it would exceed the cap.
///
/// Backups are named `<path>.1` (newest) through `<path>.<max_files - 1>`.
pub fn append_line_with_rotation(path: &Path, line: &str, policy: LogRotationPolicy) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    if policy.is_enabled() {
        if let Ok(metadata) = std::fs::metadata(path) {
            let incoming = u64::try_from(line.len().saturating_add(1)).unwrap_or(u64::MAX);
            if metadata.len().saturating_add(incoming) > policy.max_bytes {
                rotate(path, policy)?;
            }
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}.{index}", path.display()))
}

fn rotate(path: &Path, policy: LogRotationPolicy) -> Result<()> {
    if policy.max_files <= 1 {
        return std::fs::remove_file(path)
            .with_context(|| format!("failed to truncate {}", path.display()));
    }

    let oldest = policy.max_files - 1;
    let oldest_path = backup_path(path, oldest);
    if oldest_path.exists() {
        std::fs::remove_file(&oldest_path)
            .with_context(|| format!("failed to drop {}", oldest_path.display()))?;
    }
    for index in (1..oldest).rev() {
        let source = backup_path(path, index);
        if source.exists() {
            let destination = backup_path(path, index + 1);
            std::fs::rename(&source, &destination).with_context(|| {
                format!("failed to shift {} to {}", source.display(), destination.display())
            })?;
        }
    }
    let first = backup_path(path, 1);
    std::fs::rename(path, &first)
        .with_context(|| format!("failed to rotate {} to {}", path.display(), first.display()))
}

#[cfg(test)]
mod tests {
    use super::{append_line_with_rotation, backup_path, LogRotationPolicy};

    fn read(path: &std::path::Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn unit_rotation_moves_full_log_to_first_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        let policy = LogRotationPolicy {
            max_bytes: 24,
            max_files: 3,
        };

        append_line_with_rotation(&path, r#"{"job":"a","event":"created"}"#, policy)
            .expect("append first");
        append_line_with_rotation(&path, r#"{"job":"a","event":"running"}"#, policy)
            .expect("append second");

        assert!(read(&backup_path(&path, 1)).contains("created"));
        assert!(read(&path).contains("running"));
    }

    #[test]
    fn unit_rotation_keeps_at_most_max_files_minus_one_backups() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        let policy = LogRotationPolicy {
            max_bytes: 16,
            max_files: 2,
        };
        for seq in 1..=6 {
            append_line_with_rotation(&path, &format!(r#"{{"seq":{seq}}}"#), policy)
                .expect("append");
        }

        assert!(backup_path(&path, 1).exists());
        assert!(!backup_path(&path, 2).exists());
        assert!(read(&path).contains("\"seq\":6"));
    }

    #[test]
    fn unit_policy_from_env_ignores_invalid_values() {
        std::env::set_var("HASHQ_LOG_ROTATION_MAX_BYTES", "2048");
        std::env::set_var("HASHQ_LOG_ROTATION_MAX_FILES", "0");
        let parsed = LogRotationPolicy::from_env();
        assert_eq!(parsed.max_bytes, 2048);
        assert_eq!(parsed.max_files, LogRotationPolicy::default().max_files);
        std::env::remove_var("HASHQ_LOG_ROTATION_MAX_BYTES");
        std::env::remove_var("HASHQ_LOG_ROTATION_MAX_FILES");
    }
}

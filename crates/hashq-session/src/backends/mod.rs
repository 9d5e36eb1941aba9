mod disowned;
mod screen;
mod synchronous;
mod tmux;

pub use disowned::DisownedBackend;
pub use screen::ScreenBackend;
pub use synchronous::SynchronousBackend;
pub use tmux::TmuxBackend;

use std::path::{Path, PathBuf};

use hashq_types::{SessionHandle, SessionKind};

use crate::probe::tail_lines;
use crate::ProbeError;

/// Files a backend writes beside the output artifact for one session.
pub(crate) fn side_files(handle: &SessionHandle) -> Vec<PathBuf> {
    let Some(log_path) = handle.log_path.as_ref() else {
        return Vec::new();
    };
    let mut files = vec![log_path.clone()];
    if handle.kind == SessionKind::Screen {
        files.extend(screen::hardcopy_path(handle));
    }
    files
}

/// Reads the tail of a backend log, `None` when it does not exist yet.
async fn read_log_tail(path: &Path, max_lines: usize) -> Result<Option<String>, ProbeError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            Ok(Some(tail_lines(&text, max_lines)))
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}

fn parse_first_pid(raw: &str) -> Option<u32> {
    raw.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
    use super::parse_first_pid;

    #[test]
    fn unit_parse_first_pid_skips_blank_lines() {
        assert_eq!(parse_first_pid("\n  4242\n17\n"), Some(4242));
        assert_eq!(parse_first_pid("not-a-pid"), None);
        assert_eq!(parse_first_pid(""), None);
    }
}

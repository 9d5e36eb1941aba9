//! Executable discovery and host backend capabilities.

use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use hashq_types::SessionKind;

fn is_executable_file(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Returns true when `executable` is an executable path or found on `PATH`.
pub fn is_executable_available(executable: &str) -> bool {
    let trimmed = executable.trim();
    if trimmed.is_empty() {
        return false;
    }

    let candidate = Path::new(trimmed);
    if candidate.is_absolute() || trimmed.contains(std::path::MAIN_SEPARATOR) {
        return is_executable_file(candidate);
    }

    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    for mut path in std::env::split_paths(&path_var) {
        path.push(trimmed);
        if is_executable_file(&path) {
            return true;
        }
    }
    false
}

/// Detached backends usable on this host, probed once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostCapabilities {
    pub tmux: bool,
    pub screen: bool,
    pub disowned: bool,
}

impl HostCapabilities {
    pub fn detect() -> Self {
        let unix_shell = cfg!(unix) && is_executable_available("sh");
        Self {
            tmux: unix_shell && is_executable_available("tmux"),
            screen: unix_shell && is_executable_available("screen"),
            disowned: unix_shell && is_executable_available("nohup"),
        }
    }

    pub fn supports(self, kind: SessionKind) -> bool {
        match kind {
            SessionKind::Tmux => self.tmux,
            SessionKind::Screen => self.screen,
            SessionKind::Disowned => self.disowned,
            SessionKind::Synchronous => true,
        }
    }

    /// First supported detached backend in preference order.
    pub fn preferred_detached(self) -> Option<SessionKind> {
        SessionKind::DETACHED_PREFERENCE
            .into_iter()
            .find(|kind| self.supports(*kind))
    }
}

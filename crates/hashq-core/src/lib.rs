//! Low-level filesystem and clock helpers shared by the hashq crates.
//!
//! Job manifests and captured tool output are written through
//! [`write_text_atomic`], the audit trail goes through
//! [`append_line_with_rotation`], and cross-process writers coordinate with
//! [`acquire_lock`].

pub mod atomic_io;
pub mod file_lock;
pub mod log_rotation;
pub mod time_utils;

pub use atomic_io::{remove_file_if_exists, write_text_atomic};
pub use file_lock::{acquire_lock, try_acquire_lock, FileLockGuard};
pub use log_rotation::{append_line_with_rotation, LogRotationPolicy};
pub use time_utils::{current_unix_timestamp_ms, elapsed_ms_since};

//! Job engine for long-running hashcat sessions.
//!
//! [`JobEngine`] admits jobs against a slot limit, launches them through a
//! [`hashq_session::SessionLauncher`], polls each running session for
//! progress and decides when it is finished. State lives in a
//! [`hashq_store::JobStore`] so a restarted engine can pick up where the
//! previous one stopped.

pub mod config;
pub mod detector;
pub mod engine;
pub mod events;
pub mod heuristic;
pub mod output;

pub use config::{absolutize, BusyPolicy, EngineConfig};
pub use detector::{CompletionDetector, Observation, Verdict};
pub use engine::{EngineError, EngineParts, EngineResult, JobEngine};
pub use events::{EventLog, JobEventRecord};
pub use heuristic::{CompletionHeuristic, ExplicitStatus, HashcatHeuristic, OutputSignals};
pub use output::{normalize_capture, refresh_output, split_header, OutputSnapshot};

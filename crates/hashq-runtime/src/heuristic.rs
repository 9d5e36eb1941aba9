//! Progress and completion signals extracted from unstructured tool output.

use std::sync::OnceLock;

use regex::Regex;

/// Terminal state the tool announced itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplicitStatus {
    Cracked,
    Exhausted,
    Aborted,
    Quit,
}

/// Everything one scan of the output body found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputSignals {
    /// Last `(cracked, total)` pair reported.
    pub counts: Option<(u64, u64)>,
    /// The line the last counts came from.
    pub recovered_line: Option<String>,
    /// Highest progress percentage in the body.
    pub progress_percent: Option<f64>,
    pub explicit_status: Option<ExplicitStatus>,
    pub exhaustion_keyword: bool,
    pub error_marker: bool,
}

/// Tool-specific reading of captured output.
pub trait CompletionHeuristic: Send + Sync {
    fn name(&self) -> &'static str;

    fn scan(&self, body: &str) -> OutputSignals;

    /// Whether a process exit code by itself means the keyspace ran out.
    fn exit_code_means_exhausted(&self, _exit_code: i32) -> bool {
        false
    }
}

const EXHAUSTION_KEYWORDS: [&str; 2] = ["Exhausted", "Approaching final keyspace"];
const ERROR_MARKERS: [&str; 3] = ["ERROR", "No hashes loaded", "failed"];
const HASHCAT_EXIT_EXHAUSTED: i32 = 1;

/// Reads hashcat's `--status` screens.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashcatHeuristic;

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn recovered_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&PATTERN, r"Recovered\.*:\s*(\d+)/(\d+)")
}

fn progress_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&PATTERN, r"Progress\.*:.*\((\d+(?:\.\d+)?)%\)")
}

fn status_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&PATTERN, r"Status\.*:\s*([A-Za-z]+)")
}

fn parse_explicit_status(word: &str) -> Option<ExplicitStatus> {
    match word {
        "Cracked" => Some(ExplicitStatus::Cracked),
        "Exhausted" => Some(ExplicitStatus::Exhausted),
        "Aborted" => Some(ExplicitStatus::Aborted),
        "Quit" => Some(ExplicitStatus::Quit),
        _ => None,
    }
}

impl CompletionHeuristic for HashcatHeuristic {
    fn name(&self) -> &'static str {
        "hashcat"
    }

    fn scan(&self, body: &str) -> OutputSignals {
        let mut signals = OutputSignals::default();
        for line in body.lines() {
            if let Some(captures) = recovered_pattern().and_then(|pattern| pattern.captures(line)) {
                let cracked = captures.get(1).and_then(|m| m.as_str().parse::<u64>().ok());
                let total = captures.get(2).and_then(|m| m.as_str().parse::<u64>().ok());
                if let (Some(cracked), Some(total)) = (cracked, total) {
                    signals.counts = Some((cracked, total));
                    signals.recovered_line = Some(line.trim().to_string());
                }
            }
            if let Some(percent) = progress_pattern()
                .and_then(|pattern| pattern.captures(line))
                .and_then(|captures| captures.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok())
            {
                signals.progress_percent = Some(match signals.progress_percent {
                    Some(previous) => previous.max(percent),
                    None => percent,
                });
            }
            if let Some(status) = status_pattern()
                .and_then(|pattern| pattern.captures(line))
                .and_then(|captures| captures.get(1))
                .and_then(|m| parse_explicit_status(m.as_str()))
            {
                signals.explicit_status = Some(status);
            }
        }
        signals.exhaustion_keyword = EXHAUSTION_KEYWORDS
            .iter()
            .any(|keyword| body.contains(keyword));
        signals.error_marker = ERROR_MARKERS.iter().any(|marker| body.contains(marker));
        signals
    }

    fn exit_code_means_exhausted(&self, exit_code: i32) -> bool {
        exit_code == HASHCAT_EXIT_EXHAUSTED
    }
}

#[cfg(test)]
mod tests {
    use super::{CompletionHeuristic, ExplicitStatus, HashcatHeuristic};

    #[test]
    fn unit_scan_reads_last_recovered_counts_and_highest_progress() {
        let body = "\
Status...........: Running
Progress.........: 5000/14344384 (40.25%)
Recovered........: 1/10 (10.00%) Digests
Progress.........: 4000/14344384 (12.00%)
Recovered........: 3/10 (30.00%) Digests, 0/1 (0.00%) Salts
";
        let signals = HashcatHeuristic.scan(body);
        assert_eq!(signals.counts, Some((3, 10)));
        assert_eq!(
            signals.recovered_line.as_deref(),
            Some("Recovered........: 3/10 (30.00%) Digests, 0/1 (0.00%) Salts")
        );
        assert_eq!(signals.progress_percent, Some(40.25));
        assert_eq!(signals.explicit_status, None);
        assert!(!signals.exhaustion_keyword);
        assert!(!signals.error_marker);
    }

    #[test]
    fn unit_scan_keeps_last_terminal_status() {
        let signals = HashcatHeuristic.scan(
            "Status...........: Running\nStatus...........: Aborted (Runtime)\nStatus...........: Cracked\n",
        );
        assert_eq!(signals.explicit_status, Some(ExplicitStatus::Cracked));

        let signals = HashcatHeuristic.scan("Status...........: Exhausted\n");
        assert_eq!(signals.explicit_status, Some(ExplicitStatus::Exhausted));
        assert!(signals.exhaustion_keyword);
    }

    #[test]
    fn unit_scan_detects_keywords_and_error_markers() {
        let signals = HashcatHeuristic.scan("Approaching final keyspace - workload adjusted.\n");
        assert!(signals.exhaustion_keyword);
        let signals = HashcatHeuristic.scan("No hashes loaded.\n");
        assert!(signals.error_marker);
        assert!(HashcatHeuristic.exit_code_means_exhausted(1));
        assert!(!HashcatHeuristic.exit_code_means_exhausted(255));
    }
}

//! Captured-output artifact maintenance.
//!
//! The artifact starts with a header block (everything up to and including
//! the first blank line) written at launch. Each refresh keeps that header
//! and replaces the body with the latest normalized capture.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use hashq_core::write_text_atomic;
use regex::Regex;

/// Result of one refresh of the output artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSnapshot {
    /// Body after the refresh; what progress extraction reads.
    pub body: String,
    /// True when this refresh rewrote the artifact with a different body.
    pub changed: bool,
}

fn control_sequence_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").ok()
        })
        .as_ref()
}

/// Strips terminal control sequences and turns carriage returns into newlines.
pub fn normalize_capture(raw: &str) -> String {
    let stripped = match control_sequence_pattern() {
        Some(pattern) => pattern.replace_all(raw, ""),
        None => raw.into(),
    };
    let unified = stripped.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed = unified.trim_end();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut normalized = trimmed.to_string();
    normalized.push('\n');
    normalized
}

/// Splits a document into its header block and body.
///
/// Without a blank line there is no header and the whole text is body.
pub fn split_header(document: &str) -> (&str, &str) {
    let mut offset = 0;
    for line in document.split_inclusive('\n') {
        offset += line.len();
        if line.trim().is_empty() {
            return document.split_at(offset);
        }
    }
    ("", document)
}

/// Merges `captured` into the artifact at `path`.
///
/// An empty or missing capture keeps the previous body; an unchanged body is
/// not rewritten.
pub fn refresh_output(path: &Path, captured: Option<&str>) -> Result<OutputSnapshot> {
    let existing = match std::fs::read_to_string(path) {
        Ok(existing) => existing,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    let (header, body) = split_header(&existing);

    let fresh = captured.map(normalize_capture).unwrap_or_default();
    if fresh.is_empty() || fresh == body {
        return Ok(OutputSnapshot {
            body: body.to_string(),
            changed: false,
        });
    }

    let mut document = String::with_capacity(header.len() + fresh.len());
    document.push_str(header);
    document.push_str(&fresh);
    write_text_atomic(path, &document)?;
    Ok(OutputSnapshot {
        body: fresh,
        changed: true,
    })
}

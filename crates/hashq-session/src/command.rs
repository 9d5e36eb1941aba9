use hashq_types::JobRecord;

use crate::{LaunchError, LauncherConfig};

/// Fully rendered tool invocation for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    argv: Vec<String>,
}

impl ToolCommand {
    /// Builds `<tool> -m <mode> -a <attack> --status … -o <cracked> <extra…>`.
    pub fn for_job(config: &LauncherConfig, record: &JobRecord) -> Result<Self, LaunchError> {
        let tool = config.tool_binary.trim();
        if tool.is_empty() {
            return Err(LaunchError::ToolNotFound(String::new()));
        }
        let hash_mode = validate_mode("hash_mode", &record.hash_mode)?;
        let attack_mode = validate_mode("attack_mode", &record.attack_mode)?;
        let extra = shell_words::split(record.extra_options.trim())
            .map_err(|error| LaunchError::InvalidOptions(error.to_string()))?;

        let mut argv = vec![
            tool.to_string(),
            "-m".to_string(),
            hash_mode.to_string(),
            "-a".to_string(),
            attack_mode.to_string(),
            "--status".to_string(),
            format!("--status-timer={}", config.status_timer_secs.max(1)),
        ];
        if let Some(potfile) = config.potfile_path.as_ref() {
            argv.push(format!("--potfile-path={}", potfile.display()));
        }
        argv.push(record.hash_input_path.display().to_string());
        argv.push(record.wordlist_path.display().to_string());
        argv.push("-o".to_string());
        argv.push(record.cracked_output_path.display().to_string());
        argv.extend(extra);
        Ok(Self { argv })
    }

    /// Wraps an explicit argv; the first element is the program.
    pub fn from_argv(argv: Vec<String>) -> Result<Self, LaunchError> {
        if argv.first().map(|program| program.trim().is_empty()).unwrap_or(true) {
            return Err(LaunchError::InvalidParameters(
                "command must name a program".to_string(),
            ));
        }
        Ok(Self { argv })
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Shell-quoted single-line form, safe to hand to `sh -c`.
    pub fn render(&self) -> String {
        shell_words::join(&self.argv)
    }
}

fn validate_mode<'a>(field: &str, raw: &'a str) -> Result<&'a str, LaunchError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LaunchError::InvalidParameters(format!(
            "{field} must be non-empty"
        )));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(LaunchError::InvalidParameters(format!(
            "{field} must be a single token, got '{trimmed}'"
        )));
    }
    Ok(trimmed)
}

/// Header block written at the top of every output artifact.
///
/// The block ends at its first blank line; everything after it is body.
pub fn render_header(command: &ToolCommand) -> String {
    format!("COMMAND:\n{}\n\n", command.render())
}

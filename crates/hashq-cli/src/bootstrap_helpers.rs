use anyhow::{Context, Result};
use hashq_runtime::EngineConfig;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli_args::Cli;

pub(crate) fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Config file first, then command-line and environment overrides.
pub(crate) fn load_engine_config(cli: &Cli) -> Result<EngineConfig> {
    let config = EngineConfig::load(&cli.config)?;
    apply_overrides(config, cli)
        .resolved()
        .context("failed to resolve engine config")
}

pub(crate) fn apply_overrides(mut config: EngineConfig, cli: &Cli) -> EngineConfig {
    if let Some(state_dir) = cli.state_dir.as_ref() {
        config.state_dir = state_dir.clone();
    }
    if let Some(output_dir) = cli.output_dir.as_ref() {
        config.output_dir = output_dir.clone();
    }
    if let Some(tool_binary) = cli.tool_binary.as_ref() {
        config.launcher.tool_binary = tool_binary.clone();
    }
    if let Some(slots) = cli.admission_slots {
        config.admission_slots = slots;
    }
    if let Some(kind) = cli.backend {
        config.launcher.preferred_backend = Some(kind);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::{apply_overrides, load_engine_config};
    use crate::cli_args::Cli;
    use clap::Parser;
    use hashq_runtime::{BusyPolicy, EngineConfig};
    use hashq_session::SessionKind;
    use tempfile::tempdir;

    #[test]
    fn unit_cli_overrides_win_over_file_values() {
        let config = EngineConfig::from_toml_str(
            "admission_slots = 4\nbusy_policy = \"reject\"\n[launcher]\ntool_binary = \"/opt/hashcat/hashcat.bin\"\n",
        )
        .expect("config");
        let cli = Cli::try_parse_from([
            "hashq",
            "queue",
            "--admission-slots",
            "2",
            "--tool-binary",
            "hashcat",
            "--backend",
            "screen",
        ])
        .expect("parse");

        let config = apply_overrides(config, &cli);
        assert_eq!(config.admission_slots, 2);
        assert_eq!(config.busy_policy, BusyPolicy::Reject);
        assert_eq!(config.launcher.tool_binary, "hashcat");
        assert_eq!(config.launcher.preferred_backend, Some(SessionKind::Screen));
    }

    #[test]
    fn functional_load_reads_file_and_resolves_paths() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("hashq.toml");
        std::fs::write(
            &config_path,
            format!(
                "state_dir = \"{}\"\npoll_interval_ms = 250\n",
                temp.path().join("state").display()
            ),
        )
        .expect("write config");
        let cli = Cli::try_parse_from([
            "hashq",
            "list",
            "--config",
            config_path.to_str().expect("utf8 path"),
            "--output-dir",
            temp.path().join("out").to_str().expect("utf8 path"),
        ])
        .expect("parse");

        let config = load_engine_config(&cli).expect("load");
        assert_eq!(config.state_dir, temp.path().join("state"));
        assert_eq!(config.output_dir, temp.path().join("out"));
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(
            config.launcher.potfile_path,
            Some(temp.path().join("state").join("hashcat.potfile"))
        );
        assert!(config.state_dir.is_absolute());
    }
}

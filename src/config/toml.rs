//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Load the configuration file named by `-c`, if any, and overlay the CLI
pub fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => Config::default(),
    };
    merge_cli_with_config(cli, config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    // Directories on the command line replace the file's list
    if !cli.directories.is_empty() {
        config.directories = cli.directories.clone();
    }

    // Search
    if let Some(mutator) = &cli.mutator {
        config.search.mutator = Some(mutator.clone());
    }
    if let Some(keep_prob) = cli.keep_prob {
        config.search.keep_prob = keep_prob;
    }
    if let Some(seed) = &cli.force_seed {
        config.search.force_seed = Some(seed.clone());
    }
    config.search.stop_on_zero |= cli.stop_on_zero;
    config.search.print_diffs |= cli.print_diffs;
    config.search.stack_differences |= cli.stack_differences;

    // Workers
    if cli.threads.is_some() {
        config.workers.threads = cli.threads;
    }

    // Network
    config.network.enabled |= cli.use_network;
    if let Some(priority) = cli.priority {
        config.network.priority = priority;
    }
    let servers = cli.servers();
    if !servers.is_empty() {
        config.network.servers = servers;
    }

    // Output
    config.output.show_errors |= cli.show_errors;
    config.output.show_timings |= cli.show_timings;
    config.output.abort_exceptions |= cli.abort_exceptions;
    if let Some(path) = &cli.json_output {
        config.output.json_output = Some(path.clone());
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_minimal() {
        let config = parse_toml_string(r#"directories = ["nonmatchings/f"]"#).unwrap();
        assert_eq!(config.directories, vec![PathBuf::from("nonmatchings/f")]);
        assert_eq!(config.search.keep_prob, DEFAULT_RAND_KEEP_PROB);
        assert_eq!(config.workers.threads, None);
        assert!(!config.network.enabled);
    }

    #[test]
    fn test_parse_sections() {
        let toml = r#"
directories = ["a", "b"]

[search]
mutator = "python3 mutate.py"
keep_prob = 0.25
stop_on_zero = true

[workers]
threads = 8
channel_slack = 2

[network]
enabled = true
servers = ["10.0.1.10:9999"]
priority = 0.5

[runtime]
stuck_grace_secs = 2.5
"#;
        let config = parse_toml_string(toml).unwrap();
        assert_eq!(config.directories.len(), 2);
        assert_eq!(config.search.mutator.as_deref(), Some("python3 mutate.py"));
        assert_eq!(config.search.keep_prob, 0.25);
        assert!(config.search.stop_on_zero);
        assert_eq!(config.workers.threads, Some(8));
        assert_eq!(config.workers.channel_slack, 2);
        assert!(config.network.enabled);
        assert_eq!(config.network.servers, vec!["10.0.1.10:9999".to_string()]);
        assert_eq!(config.network.priority, 0.5);
        assert_eq!(config.runtime.stuck_grace_secs, 2.5);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_toml_string("directories = 3").is_err());
    }

    #[test]
    fn test_parse_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "directories = [\"x\"]\n[workers]\nthreads = 3").unwrap();

        let config = parse_toml_file(file.path()).unwrap();
        assert_eq!(config.threads(), 3);

        assert!(parse_toml_file(Path::new("/nonexistent/run.toml")).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = parse_toml_string(
            r#"
directories = ["from_file"]
[search]
keep_prob = 0.1
[workers]
threads = 8
[network]
servers = ["file:1"]
"#,
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "permuter",
            "from_cli",
            "-j",
            "2",
            "--keep-prob",
            "0.9",
            "--show-errors",
            "-J",
            "--host-list",
            "cli:1,cli:2",
        ])
        .unwrap();

        let config = merge_cli_with_config(&cli, file).unwrap();
        assert_eq!(config.directories, vec![PathBuf::from("from_cli")]);
        assert_eq!(config.search.keep_prob, 0.9);
        assert_eq!(config.threads(), 2);
        assert!(config.output.show_errors);
        assert!(config.network.enabled);
        assert_eq!(config.network.servers, vec!["cli:1".to_string(), "cli:2".to_string()]);
    }

    #[test]
    fn test_file_values_kept_when_cli_silent() {
        let file = parse_toml_string(
            r#"
directories = ["from_file"]
[search]
stop_on_zero = true
[workers]
threads = 6
"#,
        )
        .unwrap();
        let cli = Cli::try_parse_from(["permuter"]).unwrap();

        let config = merge_cli_with_config(&cli, file).unwrap();
        assert_eq!(config.directories, vec![PathBuf::from("from_file")]);
        assert!(config.search.stop_on_zero);
        assert_eq!(config.threads(), 6);
    }

    #[test]
    fn test_network_thread_default() {
        let cli = Cli::try_parse_from(["permuter", "d", "-J", "--host-list", "h:1"]).unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.threads(), 0);

        let cli = Cli::try_parse_from(["permuter", "d", "-j", "0"]).unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.threads(), 1);
    }
}

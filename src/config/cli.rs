//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Search target directories (default)
    Search,
    /// Serve evaluation requests from searching clients
    Service,
}

/// Randomly permute C files to better match a target binary
#[derive(Parser, Debug)]
#[command(name = "permuter")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode: search or service
    #[arg(long, value_enum, default_value = "search")]
    pub mode: ExecutionMode,

    /// Directories containing base.c, target.o and compile.sh
    ///
    /// With --vouch, the single argument is the client id to vouch for.
    #[arg(value_name = "DIRECTORY")]
    pub directories: Vec<PathBuf>,

    /// TOML configuration file; command-line flags take precedence
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Display compiler error/warning messages
    #[arg(long)]
    pub show_errors: bool,

    /// Display the time taken by permuting vs. compiling vs. scoring
    #[arg(long)]
    pub show_timings: bool,

    /// Instead of compiling generated sources, display diffs against the base
    #[arg(long)]
    pub print_diffs: bool,

    /// Stop execution when an evaluation fails internally
    #[arg(long)]
    pub abort_exceptions: bool,

    /// Stop after producing an output with score 0
    #[arg(long)]
    pub stop_on_zero: bool,

    /// Take stack differences into account when computing the score
    #[arg(long = "stack-diffs")]
    pub stack_differences: bool,

    /// Continue randomizing the previous output with this probability (0..1)
    #[arg(long, value_name = "PROB", value_parser = parse_keep_prob)]
    pub keep_prob: Option<f64>,

    /// Replay one candidate: SEED or RNG_SEED,SEED
    #[arg(long = "seed", hide = true)]
    pub force_seed: Option<String>,

    /// Number of local worker threads (default: 1 without -J, 0 with -J)
    #[arg(short = 'j', long = "threads")]
    pub threads: Option<usize>,

    /// Farm work out to permuter servers
    #[arg(short = 'J', long = "network")]
    pub use_network: bool,

    /// Share of server resources to request when several clients use -J (0.01..2.0)
    #[arg(long, value_name = "PRIORITY", value_parser = parse_priority)]
    pub priority: Option<f64>,

    /// Comma-separated list of servers (e.g., "10.0.1.10:9999,10.0.1.11:9999")
    #[arg(long)]
    pub host_list: Option<String>,

    /// Give a client access to the first configured server, then exit
    #[arg(long)]
    pub vouch: bool,

    /// Mutator command: `CMD seed-space FILE` and `CMD generate FILE RNG SEED`
    #[arg(long)]
    pub mutator: Option<String>,

    /// Write a JSON run summary to this file
    #[arg(long)]
    pub json_output: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    // === Service Options ===
    /// Port for the service to listen on (service mode only)
    #[arg(long, default_value = "9999")]
    pub listen_port: u16,

    /// Lowest client priority the service accepts (service mode only)
    #[arg(long, default_value = "0.1")]
    pub min_priority: f64,

    /// Only serve client ids listed in this file; without it every client
    /// is refused (service mode only)
    #[arg(long)]
    pub allow_list: Option<PathBuf>,

    /// Compile wrapper run for every client: `COMPILER <input.c> -o <output.o>`
    /// (service mode only)
    #[arg(long)]
    pub compiler: Option<PathBuf>,
}

fn restricted_float(s: &str, min: f64, max: f64) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("{} is not a floating-point number", s))?;
    if !(min..=max).contains(&value) {
        return Err(format!("{} not in range [{}, {}]", value, min, max));
    }
    Ok(value)
}

fn parse_keep_prob(s: &str) -> Result<f64, String> {
    restricted_float(s, 0.0, 1.0)
}

fn parse_priority(s: &str) -> Result<f64, String> {
    restricted_float(s, 0.01, 2.0)
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Servers named by `--host-list`
    pub fn servers(&self) -> Vec<String> {
        self.host_list
            .as_deref()
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mode == ExecutionMode::Service {
            if self.threads == Some(0) {
                anyhow::bail!("service mode needs at least one thread");
            }
            if self.mutator.is_none() || self.compiler.is_none() {
                anyhow::bail!("service mode needs --mutator and --compiler");
            }
            return Ok(());
        }

        if self.vouch {
            if self.directories.len() != 1 {
                anyhow::bail!("--vouch takes exactly one argument: the client id to vouch for");
            }
            return Ok(());
        }

        if self.directories.is_empty() && self.config.is_none() {
            anyhow::bail!("at least one target directory is required");
        }

        Ok(())
    }
}

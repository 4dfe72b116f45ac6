//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//!
//! A run is described by a [`Config`]. It can be loaded from a TOML file
//! (`-c run.toml`) and is always overlaid with the command line, which takes
//! precedence:
//!
//! ```toml
//! directories = ["nonmatchings/func_80012345"]
//!
//! [search]
//! mutator = "python3 mutate.py"
//! keep_prob = 0.6
//! stop_on_zero = true
//!
//! [workers]
//! threads = 8
//!
//! [network]
//! enabled = true
//! servers = ["10.0.1.10:9999"]
//! priority = 1.0
//! ```

pub mod cli;
pub mod toml;
pub mod validator;

use crate::coordinator::aggregator::AggregatorSettings;
use crate::eval::EvalSettings;
use crate::seed::Seed;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default probability of mutating the previous candidate in a random search
pub const DEFAULT_RAND_KEEP_PROB: f64 = 0.6;

/// Default heartbeat gap after which an interrupted run counts as stuck
pub const DEFAULT_STUCK_GRACE_SECS: f64 = 5.0;

/// Default task/feedback queue capacity per execution slot
pub const DEFAULT_CHANNEL_SLACK: usize = 4;

/// Default network priority
pub const DEFAULT_NETWORK_PRIORITY: f64 = 1.0;

/// Complete run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Target directories to search, in order
    #[serde(default)]
    pub directories: Vec<PathBuf>,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// How candidates are generated and scored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Mutator command line
    #[serde(default)]
    pub mutator: Option<String>,
    /// Probability of mutating the previous candidate instead of the base
    #[serde(default = "default_keep_prob")]
    pub keep_prob: f64,
    /// Replay a single seed: `SEED` or `RNG_SEED,SEED`
    #[serde(default)]
    pub force_seed: Option<String>,
    /// Stop as soon as any target reaches score zero
    #[serde(default)]
    pub stop_on_zero: bool,
    /// Show each candidate's diff and wait for enter, without compiling
    #[serde(default)]
    pub print_diffs: bool,
    /// Score stack offset differences
    #[serde(default)]
    pub stack_differences: bool,
}

fn default_keep_prob() -> f64 {
    DEFAULT_RAND_KEEP_PROB
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            mutator: None,
            keep_prob: DEFAULT_RAND_KEEP_PROB,
            force_seed: None,
            stop_on_zero: false,
            print_diffs: false,
            stack_differences: false,
        }
    }
}

/// Local execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Local worker threads; see [`Config::threads`]
    #[serde(default)]
    pub threads: Option<usize>,
    /// Queue capacity per execution slot
    #[serde(default = "default_channel_slack")]
    pub channel_slack: usize,
}

fn default_channel_slack() -> usize {
    DEFAULT_CHANNEL_SLACK
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: None,
            channel_slack: DEFAULT_CHANNEL_SLACK,
        }
    }
}

/// Remote execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Farm work out to permuter servers
    #[serde(default)]
    pub enabled: bool,
    /// Share of a server's capacity requested, relative to other clients
    #[serde(default = "default_priority")]
    pub priority: f64,
    /// Server addresses (`host:port`)
    #[serde(default)]
    pub servers: Vec<String>,
}

fn default_priority() -> f64 {
    DEFAULT_NETWORK_PRIORITY
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            priority: DEFAULT_NETWORK_PRIORITY,
            servers: Vec::new(),
        }
    }
}

/// Console and file output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Echo compiler errors
    #[serde(default)]
    pub show_errors: bool,
    /// Show accumulated stage timings on the progress line
    #[serde(default)]
    pub show_timings: bool,
    /// Treat evaluation errors as fatal
    #[serde(default)]
    pub abort_exceptions: bool,
    /// Write a JSON run summary here
    #[serde(default)]
    pub json_output: Option<PathBuf>,
}

/// Process behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Heartbeat gap, in seconds, after which Ctrl-C aborts instead of
    /// shutting down cleanly
    #[serde(default = "default_stuck_grace")]
    pub stuck_grace_secs: f64,
}

fn default_stuck_grace() -> f64 {
    DEFAULT_STUCK_GRACE_SECS
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stuck_grace_secs: DEFAULT_STUCK_GRACE_SECS,
        }
    }
}

impl Config {
    /// Parsed `force_seed`, if any
    pub fn forced_seed(&self) -> anyhow::Result<Option<Seed>> {
        self.search
            .force_seed
            .as_deref()
            .map(str::parse)
            .transpose()
    }

    pub fn stuck_grace(&self) -> Duration {
        Duration::from_secs_f64(self.runtime.stuck_grace_secs.max(0.0))
    }

    /// Local worker threads
    ///
    /// Defaults to 1, or to 0 with networking so that remote servers do all
    /// the work. Without networking at least one thread always runs.
    pub fn threads(&self) -> usize {
        let threads = self.workers.threads.unwrap_or(if self.network.enabled { 0 } else { 1 });
        if threads == 0 && !self.network.enabled {
            1
        } else {
            threads
        }
    }

    /// Run inline on the coordinator thread
    pub fn is_inline(&self) -> bool {
        self.threads() == 1 && !self.network.enabled
    }

    pub fn eval_settings(&self) -> EvalSettings {
        EvalSettings {
            mutator: self.search.mutator.clone(),
            keep_prob: self.search.keep_prob,
            stack_differences: self.search.stack_differences,
            show_errors: self.output.show_errors,
            need_all_sources: self.search.print_diffs,
        }
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            abort_exceptions: self.output.abort_exceptions,
            print_diffs: self.search.print_diffs,
            show_timings: self.output.show_timings,
        }
    }
}

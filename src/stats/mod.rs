//! Timing statistics
//!
//! Every candidate carries a [`Profiler`] recording how long each stage of its
//! evaluation took. The aggregator merges them into a run-wide profiler that
//! is shown on the progress line when timings are enabled.

pub mod live;

use crate::util::time::format_seconds;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Evaluation stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatType {
    /// Producing the mutated source
    Perm,
    /// Running the compile script
    Compile,
    /// Disassembling and diffing against the target
    Score,
}

impl StatType {
    pub const ALL: [StatType; 3] = [StatType::Perm, StatType::Compile, StatType::Score];

    pub fn label(self) -> &'static str {
        match self {
            StatType::Perm => "perm",
            StatType::Compile => "compile",
            StatType::Score => "score",
        }
    }
}

/// Accumulated seconds per stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profiler {
    time_stats: BTreeMap<StatType, f64>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stat(&mut self, stat: StatType, elapsed: Duration) {
        *self.time_stats.entry(stat).or_insert(0.0) += elapsed.as_secs_f64();
    }

    /// Fold another profiler's totals into this one
    pub fn merge(&mut self, other: &Profiler) {
        for (stat, secs) in &other.time_stats {
            *self.time_stats.entry(*stat).or_insert(0.0) += secs;
        }
    }

    pub fn seconds(&self, stat: StatType) -> f64 {
        self.time_stats.get(&stat).copied().unwrap_or(0.0)
    }

    pub fn total_seconds(&self) -> f64 {
        self.time_stats.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.time_stats.is_empty()
    }
}

impl fmt::Display for Profiler {
    /// `perm: 0.12s | compile: 3.40s | score: 0.80s`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = StatType::ALL
            .iter()
            .map(|stat| format!("{}: {}", stat.label(), format_seconds(self.seconds(*stat))))
            .collect();
        write!(f, "{}", parts.join(" | "))
    }
}

//! Search targets
//!
//! A [`SearchTarget`] is the coordinator's record of one function being
//! matched: its prepared [`TargetSpec`], the best score seen so far and the
//! set of output hashes already recorded.
//!
//! # Recording rule
//!
//! A scored candidate is recorded when its score is no worse than the base
//! score and its output is new (or it is a perfect match, which is always
//! recorded). Recording updates the best score and, for non-zero scores,
//! remembers the hash so the same output is never written twice.

pub mod layout;
pub mod output;

use crate::eval::TargetSpec;
use crate::util::diff::unified_diff;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// How a recorded candidate compares with what came before
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Improvement {
    /// Strictly below the previous best
    NewBest,
    /// Equal to the previous best with new output
    TiedBest,
    /// Worse than the best but better than the base
    BetterThanBase,
    /// Same score as the base with new output
    SameScoreNewAsm,
}

impl fmt::Display for Improvement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Improvement::NewBest => "found new best score!",
            Improvement::TiedBest => "tied best score!",
            Improvement::BetterThanBase => "found a better score!",
            Improvement::SameScoreNewAsm => "found different asm with same score",
        };
        f.write_str(label)
    }
}

/// Per-target search state owned by the coordinator
#[derive(Debug)]
pub struct SearchTarget {
    pub spec: TargetSpec,
    /// Name used in output; unique within a run
    pub unique_name: String,
    best_score: u64,
    hashes: HashSet<String>,
}

impl SearchTarget {
    pub fn new(spec: TargetSpec) -> Self {
        Self {
            unique_name: spec.name.clone(),
            best_score: spec.base_score,
            hashes: HashSet::new(),
            spec,
        }
    }

    pub fn base_score(&self) -> u64 {
        self.spec.base_score
    }

    pub fn best_score(&self) -> u64 {
        self.best_score
    }

    pub fn dir(&self) -> &Path {
        &self.spec.dir
    }

    /// Number of distinct non-perfect outputs recorded
    pub fn distinct_outputs(&self) -> usize {
        self.hashes.len()
    }

    /// Whether a candidate with this score and output should be recorded
    pub fn qualifies(&self, score: u64, hash: &str) -> bool {
        score <= self.spec.base_score && (score == 0 || !self.hashes.contains(hash))
    }

    /// Record a qualifying candidate and classify it against the previous best
    pub fn record(&mut self, score: u64, hash: &str) -> Improvement {
        if score != 0 {
            self.hashes.insert(hash.to_string());
        }

        let improvement = if score < self.best_score {
            Improvement::NewBest
        } else if score == self.best_score {
            Improvement::TiedBest
        } else if score < self.spec.base_score {
            Improvement::BetterThanBase
        } else {
            Improvement::SameScoreNewAsm
        };

        self.best_score = self.best_score.min(score);
        improvement
    }

    /// Unified diff from the base source to `source`
    pub fn diff(&self, source: &str) -> String {
        unified_diff(&self.spec.base_source, source, "base.c", "source.c")
    }
}

/// Give every target a distinct display name
///
/// Targets sharing a name are suffixed with their directory, so `f` loaded
/// from `a/` and `b/` become `f (a)` and `f (b)`.
pub fn assign_unique_names(targets: &mut [SearchTarget]) {
    let mut counts = std::collections::HashMap::new();
    for target in targets.iter() {
        *counts.entry(target.spec.name.clone()).or_insert(0usize) += 1;
    }
    for target in targets.iter_mut() {
        if counts[&target.spec.name] > 1 {
            target.unique_name = format!("{} ({})", target.spec.name, target.spec.dir.display());
        }
    }
}

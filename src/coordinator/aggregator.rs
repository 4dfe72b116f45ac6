//! Result aggregation
//!
//! [`RunState`] folds every feedback item into the run: it counts iterations
//! and errors, decides which candidates are worth keeping, prints what was
//! found and writes kept candidates to disk. It runs on the coordinator
//! thread only, so no state here is shared.

use crate::error::RunError;
use crate::eval::Candidate;
use crate::output::text;
use crate::seed::Seed;
use crate::stats::live::{ProgressLine, ProgressStatus};
use crate::stats::Profiler;
use crate::target::output::{write_candidate, CandidateFiles};
use crate::target::{Improvement, SearchTarget};
use crate::Result;
use anyhow::Context;
use std::io::BufRead;
use tracing::warn;

/// Aggregation switches
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregatorSettings {
    pub abort_exceptions: bool,
    pub print_diffs: bool,
    pub show_timings: bool,
}

/// What happened to one scored candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processed {
    /// The candidate scored zero
    pub perfect: bool,
    /// Set when the candidate was recorded
    pub recorded: Option<Improvement>,
}

/// Mutable state of a search run
pub struct RunState {
    pub targets: Vec<SearchTarget>,
    pub iteration: u64,
    pub errors: u64,
    pub overall_profiler: Profiler,
    settings: AggregatorSettings,
    progress: ProgressLine,
    /// Cleared once stdin reaches end of file
    pause_for_diffs: bool,
}

/// Block until a line is entered; false at end of input
fn wait_for_enter(input: &mut impl BufRead) -> Result<bool> {
    let mut line = String::new();
    let read = input.read_line(&mut line).context("Failed to read from stdin")?;
    Ok(read > 0)
}

impl RunState {
    pub fn new(targets: Vec<SearchTarget>, settings: AggregatorSettings) -> Self {
        Self {
            targets,
            iteration: 0,
            errors: 0,
            overall_profiler: Profiler::new(),
            settings,
            progress: ProgressLine::new(),
            pause_for_diffs: settings.print_diffs,
        }
    }

    fn target_name(&self, target: Option<usize>) -> String {
        target
            .and_then(|i| self.targets.get(i))
            .map(|t| t.unique_name.clone())
            .unwrap_or_else(|| "?".to_string())
    }

    /// Count and report a failed evaluation
    ///
    /// Fails the run when errors are configured to abort it.
    pub fn process_error(&mut self, target: Option<usize>, seed: Option<Seed>, message: &str) -> Result<()> {
        self.errors += 1;
        let name = self.target_name(target);

        self.progress.clear();
        text::print_eval_error(&name, seed, message);
        if self.settings.abort_exceptions {
            return Err(RunError::FatalEvaluation {
                target: name,
                message: message.to_string(),
            }
            .into());
        }

        self.render_progress(None);
        Ok(())
    }

    /// Fold a scored candidate into the run
    pub fn process_scored(&mut self, target: usize, candidate: Candidate) -> Result<Processed> {
        if target >= self.targets.len() {
            warn!(index = target, "feedback for unknown target");
            self.process_error(None, None, &format!("feedback for unknown target index {}", target))?;
            return Ok(Processed { perfect: false, recorded: None });
        }

        let shown = match (&candidate.source, self.settings.print_diffs) {
            (Some(source), true) => {
                self.show_diff(target, source)?;
                true
            }
            _ => false,
        };

        self.iteration += 1;
        // Diffs shown without compiling carry no score but are not failures
        if candidate.score.is_none() && !shown {
            self.errors += 1;
        }
        if self.settings.show_timings {
            self.overall_profiler.merge(&candidate.profiler);
        }

        let mut recorded = None;
        if let (Some(score), Some(hash)) = (candidate.score, candidate.hash.as_deref()) {
            if self.targets[target].qualifies(score, hash) {
                recorded = Some(self.record(target, score, hash, candidate.source.as_deref())?);
            }
        }

        self.render_progress(candidate.score);
        Ok(Processed {
            perfect: candidate.score == Some(0),
            recorded,
        })
    }

    fn record(&mut self, index: usize, score: u64, hash: &str, source: Option<&str>) -> Result<Improvement> {
        self.progress.clear();
        let target = &mut self.targets[index];
        let improvement = target.record(score, hash);
        text::print_improvement(&target.unique_name, improvement, score, target.base_score());

        match source {
            Some(source) => {
                let diff = target.diff(source);
                let dir = write_candidate(
                    target.dir(),
                    &CandidateFiles {
                        score,
                        source,
                        base_source: &target.spec.base_source,
                        diff: &diff,
                    },
                )?;
                text::print_written(&dir);
            }
            None => warn!(name = %target.unique_name, score, "recorded candidate arrived without source"),
        }
        Ok(improvement)
    }

    fn show_diff(&mut self, index: usize, source: &str) -> Result<()> {
        self.progress.clear();
        println!();
        println!("{}", self.targets[index].diff(source));
        if self.pause_for_diffs {
            println!("Press enter to continue...");
            if !wait_for_enter(&mut std::io::stdin().lock())? {
                warn!("stdin closed; no longer pausing between diffs");
                self.pause_for_diffs = false;
            }
        }
        Ok(())
    }

    fn render_progress(&mut self, score: Option<u64>) {
        let timings = self.settings.show_timings.then_some(&self.overall_profiler);
        let status = ProgressStatus {
            iteration: self.iteration,
            errors: self.errors,
            score,
            timings,
        };
        self.progress.render(&status);
    }

    /// Leave the progress line on screen before final messages
    pub fn finish_progress(&mut self) {
        self.progress.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::mock::{MockFactory, MockTarget};
    use crate::seed::SeedSpace;
    use std::fs;
    use std::path::Path;

    fn state_in(dir: &Path, base: u64, settings: AggregatorSettings) -> RunState {
        let factory = MockFactory::new().with_target("f", MockTarget::new(base, SeedSpace::Random));
        let mut spec = factory.spec_for("f");
        spec.dir = dir.to_path_buf();
        RunState::new(vec![SearchTarget::new(spec)], settings)
    }

    fn scored(score: u64, hash: &str) -> Candidate {
        Candidate {
            score: Some(score),
            hash: Some(hash.to_string()),
            source: Some(format!("/* {} */\n", hash)),
            profiler: Profiler::new(),
        }
    }

    fn outputs(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("output-"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_duplicate_output_is_written_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut state = state_in(tmp.path(), 100, AggregatorSettings::default());

        let first = state.process_scored(0, scored(60, "h")).unwrap();
        let second = state.process_scored(0, scored(60, "h")).unwrap();
        assert_eq!(first.recorded, Some(Improvement::NewBest));
        assert_eq!(second.recorded, None);
        assert_eq!(outputs(tmp.path()), vec!["output-60-1"]);
        assert_eq!(state.iteration, 2);
    }

    #[test]
    fn test_perfect_scores_always_written() {
        let tmp = tempfile::tempdir().unwrap();
        let mut state = state_in(tmp.path(), 100, AggregatorSettings::default());

        assert!(state.process_scored(0, scored(0, "z")).unwrap().perfect);
        assert!(state.process_scored(0, scored(0, "z")).unwrap().perfect);
        assert_eq!(outputs(tmp.path()), vec!["output-0-1", "output-0-2"]);
        assert_eq!(state.targets[0].best_score(), 0);
    }

    #[test]
    fn test_worse_than_base_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let mut state = state_in(tmp.path(), 100, AggregatorSettings::default());

        let processed = state.process_scored(0, scored(101, "a")).unwrap();
        assert_eq!(processed, Processed { perfect: false, recorded: None });
        assert!(outputs(tmp.path()).is_empty());
        assert_eq!(state.targets[0].best_score(), 100);
    }

    #[test]
    fn test_unscored_candidate_counts_as_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut state = state_in(tmp.path(), 100, AggregatorSettings::default());

        let candidate = Candidate { score: None, ..Candidate::default() };
        state.process_scored(0, candidate).unwrap();
        assert_eq!(state.iteration, 1);
        assert_eq!(state.errors, 1);
    }

    #[test]
    fn test_shown_diff_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = AggregatorSettings { print_diffs: true, ..AggregatorSettings::default() };
        let mut state = state_in(tmp.path(), 100, settings);
        // Tests never wait on the terminal
        state.pause_for_diffs = false;

        let candidate = Candidate {
            score: None,
            source: Some("int g;\n".to_string()),
            ..Candidate::default()
        };
        state.process_scored(0, candidate).unwrap();
        assert_eq!(state.iteration, 1);
        assert_eq!(state.errors, 0);
        assert!(outputs(tmp.path()).is_empty());
    }

    #[test]
    fn test_wait_for_enter_detects_end_of_input() {
        let mut input = std::io::Cursor::new(b"\n".to_vec());
        assert!(wait_for_enter(&mut input).unwrap());
        assert!(!wait_for_enter(&mut input).unwrap());

        let mut empty: &[u8] = b"";
        assert!(!wait_for_enter(&mut empty).unwrap());
    }

    #[test]
    fn test_errors_abort_when_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = AggregatorSettings { abort_exceptions: true, ..AggregatorSettings::default() };
        let mut state = state_in(tmp.path(), 100, settings);

        let err = state.process_error(Some(0), Some(Seed::from_value(3)), "boom").unwrap_err();
        assert!(matches!(err.downcast_ref::<RunError>(), Some(RunError::FatalEvaluation { .. })));
        assert_eq!(state.errors, 1);
    }

    #[test]
    fn test_errors_are_counted_and_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let mut state = state_in(tmp.path(), 100, AggregatorSettings::default());

        state.process_error(Some(0), None, "boom").unwrap();
        state.process_error(None, None, "worker failed").unwrap();
        assert_eq!(state.errors, 2);
        assert_eq!(state.iteration, 0);
    }

    #[test]
    fn test_timings_accumulate_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = AggregatorSettings { show_timings: true, ..AggregatorSettings::default() };
        let mut state = state_in(tmp.path(), 100, settings);

        let mut candidate = scored(200, "x");
        candidate
            .profiler
            .add_stat(crate::stats::StatType::Compile, std::time::Duration::from_secs(2));
        state.process_scored(0, candidate.clone()).unwrap();
        state.process_scored(0, candidate).unwrap();
        assert!((state.overall_profiler.seconds(crate::stats::StatType::Compile) - 4.0).abs() < 1e-9);
    }
}

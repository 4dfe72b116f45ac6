//! Candidate evaluation
//!
//! An [`Evaluator`] turns a seed into a scored candidate for one target: it
//! mutates the base source, compiles it, and compares the result with the
//! target object. The coordinator never looks inside; it only needs the
//! [`Candidate`] that comes back.
//!
//! # Construction
//!
//! Evaluators are built in two steps through an [`EvaluatorFactory`]:
//!
//! 1. [`prepare`] runs once per target directory on the coordinator and
//!    produces a serializable [`TargetSpec`] (base source, base score, seed
//!    space, compile script and target object contents).
//! 2. [`build`] runs once per executor, locally or on a remote server, and
//!    creates a private evaluator from the [`TargetSpec`].
//!
//! Because a [`TargetSpec`] carries everything needed, a remote server never needs
//! access to the client's filesystem.
//!
//! [`prepare`]: EvaluatorFactory::prepare
//! [`build`]: EvaluatorFactory::build

pub mod compiler;
pub mod mock;
pub mod mutator;
pub mod scorer;
pub mod script;

use crate::seed::{Seed, SeedSpace, WorkItem};
use crate::stats::Profiler;
use crate::target::layout::TargetLayout;
use crate::worker::channel::Feedback;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use scorer::PENALTY_INF;

/// Evaluation switches shared by every target of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSettings {
    /// Mutator command line
    pub mutator: Option<String>,
    /// Probability of mutating the previous candidate instead of the base
    pub keep_prob: f64,
    /// Score stack-offset differences instead of normalizing them away
    pub stack_differences: bool,
    /// Echo compiler errors
    pub show_errors: bool,
    /// Return every candidate's source without compiling it
    pub need_all_sources: bool,
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self {
            mutator: None,
            keep_prob: crate::config::DEFAULT_RAND_KEEP_PROB,
            stack_differences: false,
            show_errors: false,
            need_all_sources: false,
        }
    }
}

/// Everything an executor needs to build an evaluator for one target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Display name, usually the function name
    pub name: String,
    /// Directory the target was loaded from (on the coordinator's machine)
    pub dir: PathBuf,
    pub base_source: String,
    pub base_score: u64,
    pub seed_space: SeedSpace,
    /// Contents of `compile.sh`
    pub compile_script: String,
    /// Contents of `target.o`
    pub target_object: Vec<u8>,
    pub settings: EvalSettings,
}

impl TargetSpec {
    /// Copy safe to hand to a remote server: no commands, only source,
    /// object and scoring settings
    pub fn without_commands(&self) -> TargetSpec {
        TargetSpec {
            compile_script: String::new(),
            settings: EvalSettings {
                mutator: None,
                ..self.settings.clone()
            },
            ..self.clone()
        }
    }
}

/// Result of evaluating one seed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Candidate {
    /// `None` when no score could be produced
    pub score: Option<u64>,
    /// Identity of the compiled output; equal hashes mean equal output
    pub hash: Option<String>,
    /// Mutated source; may be omitted when it cannot improve on the base
    pub source: Option<String>,
    pub profiler: Profiler,
}

/// Per-target candidate generator owned by a single executor
pub trait Evaluator: Send {
    /// Mutate, compile and score the candidate selected by `seed`
    fn evaluate(&mut self, seed: Seed) -> Result<Candidate>;

    /// Restart the evaluator's random stream
    fn reseed(&mut self, rng_seed: u64);
}

/// Creates evaluators; shared by every executor of a run
pub trait EvaluatorFactory: Send + Sync {
    /// Load a validated target directory into a spec
    fn prepare(&self, layout: &TargetLayout, settings: &EvalSettings) -> Result<TargetSpec>;

    /// Build a fresh evaluator for `spec`
    fn build(&self, spec: &TargetSpec) -> Result<Box<dyn Evaluator>>;
}

/// Build one evaluator per target, reseeded for executor `salt`
pub fn build_evaluators(
    factory: &dyn EvaluatorFactory,
    specs: &[TargetSpec],
    salt: u64,
) -> Result<Vec<Box<dyn Evaluator>>> {
    specs
        .iter()
        .map(|spec| {
            let mut evaluator = factory.build(spec)?;
            evaluator.reseed(entropy_seed(salt));
            Ok(evaluator)
        })
        .collect()
}

/// Fresh RNG seed mixed with an executor-specific salt so executors started
/// in the same instant do not share a stream
fn entropy_seed(salt: u64) -> u64 {
    use rand::Rng;
    let seed = rand::thread_rng().gen::<u64>() ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    // Zero means "no forced seed" downstream
    seed.max(1)
}

/// Evaluate one work item and wrap the outcome as feedback
pub fn evaluate_work(evaluators: &mut [Box<dyn Evaluator>], item: WorkItem) -> Feedback {
    let Some(evaluator) = evaluators.get_mut(item.target) else {
        return Feedback::EvalError {
            target: None,
            seed: Some(item.seed),
            message: format!("no evaluator for target index {}", item.target),
        };
    };

    match evaluator.evaluate(item.seed) {
        Ok(candidate) => Feedback::Scored { target: item.target, candidate },
        Err(e) => Feedback::EvalError {
            target: Some(item.target),
            seed: Some(item.seed),
            message: format!("{:#}", e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::mock::{MockFactory, MockTarget};

    #[test]
    fn test_evaluate_work_wraps_scores_and_errors() {
        let factory = MockFactory::new()
            .with_target("f", MockTarget::new(100, SeedSpace::Counted(10)).score(3, 40, "h3").fail(4));
        let spec = factory.spec_for("f");
        let mut evaluators = build_evaluators(&factory, &[spec], 0).unwrap();

        let fb = evaluate_work(&mut evaluators, WorkItem { target: 0, seed: Seed::from_value(3) });
        match fb {
            Feedback::Scored { target, candidate } => {
                assert_eq!(target, 0);
                assert_eq!(candidate.score, Some(40));
                assert_eq!(candidate.hash.as_deref(), Some("h3"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let fb = evaluate_work(&mut evaluators, WorkItem { target: 0, seed: Seed::from_value(4) });
        assert!(matches!(fb, Feedback::EvalError { target: Some(0), seed: Some(_), .. }));

        let fb = evaluate_work(&mut evaluators, WorkItem { target: 5, seed: Seed::from_value(1) });
        assert!(matches!(fb, Feedback::EvalError { target: None, .. }));
    }

    #[test]
    fn test_without_commands_strips_scripts() {
        let mut spec = MockFactory::new().with_target("f", MockTarget::new(10, SeedSpace::Random)).spec_for("f");
        spec.compile_script = "#!/bin/sh\nrm -rf ~\n".to_string();
        spec.settings.mutator = Some("sh -c evil".to_string());
        spec.settings.stack_differences = true;

        let remote = spec.without_commands();
        assert!(remote.compile_script.is_empty());
        assert_eq!(remote.settings.mutator, None);
        assert!(remote.settings.stack_differences);
        assert_eq!(remote.base_source, spec.base_source);
        assert_eq!(remote.target_object, spec.target_object);
    }

    #[test]
    fn test_entropy_seed_is_never_zero() {
        for salt in 0..64 {
            assert_ne!(entropy_seed(salt), 0);
        }
    }
}

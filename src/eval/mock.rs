//! Scripted evaluator for tests
//!
//! [`MockFactory`] stands in for the compiler toolchain. Each target gets a
//! [`MockTarget`] that fixes its base score, seed space and the outcome of
//! specific seeds; every other seed scores one point worse than the base and
//! is therefore never recorded.
//!
//! # Example
//!
//! ```
//! use permuter::eval::mock::{MockFactory, MockTarget};
//! use permuter::eval::{build_evaluators, evaluate_work};
//! use permuter::seed::{Seed, SeedSpace, WorkItem};
//!
//! let factory = MockFactory::new()
//!     .with_target("f", MockTarget::new(100, SeedSpace::Counted(4)).score(2, 0, "match"));
//! let spec = factory.spec_for("f");
//! let mut evaluators = build_evaluators(&factory, &[spec], 0).unwrap();
//! let feedback = evaluate_work(&mut evaluators, WorkItem { target: 0, seed: Seed::from_value(2) });
//! assert_eq!(factory.evaluations().len(), 1);
//! # let _ = feedback;
//! ```

use super::{Candidate, EvalSettings, Evaluator, EvaluatorFactory, TargetSpec};
use crate::seed::{Seed, SeedSpace};
use crate::stats::{Profiler, StatType};
use crate::target::layout::TargetLayout;
use crate::Result;
use anyhow::{bail, Context};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
enum MockOutcome {
    Score { score: u64, hash: String },
    Unscored,
    Fail,
}

/// Scripted behaviour for one target
#[derive(Debug, Clone)]
pub struct MockTarget {
    base_score: u64,
    seed_space: SeedSpace,
    outcomes: HashMap<u64, MockOutcome>,
    delay: Duration,
}

impl MockTarget {
    pub fn new(base_score: u64, seed_space: SeedSpace) -> Self {
        Self {
            base_score,
            seed_space,
            outcomes: HashMap::new(),
            delay: Duration::ZERO,
        }
    }

    /// Seed `value` scores `score` with output identity `hash`
    pub fn score(mut self, value: u64, score: u64, hash: &str) -> Self {
        self.outcomes.insert(value, MockOutcome::Score { score, hash: hash.to_string() });
        self
    }

    /// Seed `value` produces a candidate without a score
    pub fn unscored(mut self, value: u64) -> Self {
        self.outcomes.insert(value, MockOutcome::Unscored);
        self
    }

    /// Seed `value` fails with an evaluation error
    pub fn fail(mut self, value: u64) -> Self {
        self.outcomes.insert(value, MockOutcome::Fail);
        self
    }

    /// Sleep this long in every evaluation
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Factory for [`MockEvaluator`]s; records every evaluation it serves
#[derive(Default)]
pub struct MockFactory {
    targets: HashMap<String, MockTarget>,
    evaluations: Arc<Mutex<Vec<(String, Seed)>>>,
    built: Mutex<Vec<TargetSpec>>,
    fail_builds: bool,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, name: &str, target: MockTarget) -> Self {
        self.targets.insert(name.to_string(), target);
        self
    }

    /// Make every `build` fail
    pub fn failing_builds(mut self) -> Self {
        self.fail_builds = true;
        self
    }

    /// Spec for `name` without going through a target directory
    ///
    /// Panics if `name` was never registered; intended for tests.
    pub fn spec_for(&self, name: &str) -> TargetSpec {
        let target = &self.targets[name];
        TargetSpec {
            name: name.to_string(),
            dir: PathBuf::from(name),
            base_source: format!("/* {} */\n", name),
            base_score: target.base_score,
            seed_space: target.seed_space.clone(),
            compile_script: String::new(),
            target_object: Vec::new(),
            settings: EvalSettings::default(),
        }
    }

    /// Every `(target name, seed)` evaluated so far, in completion order
    pub fn evaluations(&self) -> Vec<(String, Seed)> {
        match self.evaluations.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn builds(&self) -> usize {
        self.built_specs().len()
    }

    /// Every spec an evaluator was built from, in build order
    pub fn built_specs(&self) -> Vec<TargetSpec> {
        match self.built.lock() {
            Ok(built) => built.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EvaluatorFactory for MockFactory {
    fn prepare(&self, layout: &TargetLayout, settings: &EvalSettings) -> Result<TargetSpec> {
        let name = layout.display_name();
        let Some(target) = self.targets.get(&name) else {
            bail!("no mock target registered for '{}'", name);
        };
        let base_source = fs::read_to_string(&layout.base_c)
            .with_context(|| format!("Failed to read {}", layout.base_c.display()))?;

        Ok(TargetSpec {
            name,
            dir: layout.dir.clone(),
            base_source,
            base_score: target.base_score,
            seed_space: target.seed_space.clone(),
            compile_script: String::new(),
            target_object: Vec::new(),
            settings: settings.clone(),
        })
    }

    fn build(&self, spec: &TargetSpec) -> Result<Box<dyn Evaluator>> {
        if self.fail_builds {
            bail!("mock build failure for '{}'", spec.name);
        }
        let Some(target) = self.targets.get(&spec.name) else {
            bail!("no mock target registered for '{}'", spec.name);
        };
        if let Ok(mut built) = self.built.lock() {
            built.push(spec.clone());
        }
        Ok(Box::new(MockEvaluator {
            name: spec.name.clone(),
            target: target.clone(),
            log: Arc::clone(&self.evaluations),
        }))
    }
}

/// Evaluator that replays a [`MockTarget`] script
pub struct MockEvaluator {
    name: String,
    target: MockTarget,
    log: Arc<Mutex<Vec<(String, Seed)>>>,
}

impl Evaluator for MockEvaluator {
    fn evaluate(&mut self, seed: Seed) -> Result<Candidate> {
        if !self.target.delay.is_zero() {
            std::thread::sleep(self.target.delay);
        }
        if let Ok(mut log) = self.log.lock() {
            log.push((self.name.clone(), seed));
        }

        let mut profiler = Profiler::new();
        profiler.add_stat(StatType::Perm, Duration::from_micros(10));

        let source = Some(format!("/* {} seed {} */\n", self.name, seed));
        match self.target.outcomes.get(&seed.value) {
            Some(MockOutcome::Score { score, hash }) => Ok(Candidate {
                score: Some(*score),
                hash: Some(hash.clone()),
                source,
                profiler,
            }),
            Some(MockOutcome::Unscored) => Ok(Candidate { score: None, hash: None, source, profiler }),
            Some(MockOutcome::Fail) => bail!("mock failure for seed {}", seed),
            None => Ok(Candidate {
                score: Some(self.target.base_score + 1),
                hash: Some(format!("{}-{}", self.name, seed.value)),
                source,
                profiler,
            }),
        }
    }

    /// Scripted outcomes do not depend on the random stream
    fn reseed(&mut self, _rng_seed: u64) {}
}

/// Create a minimal valid target directory `root/name`
///
/// Writes `base.c`, `target.o`, an executable `compile.sh` and a
/// `function.txt` naming the function `name`.
pub fn create_target_fixture(root: &Path, name: &str) -> Result<PathBuf> {
    let dir = root.join(name);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("base.c"), format!("int {}(void) {{ return 0; }}\n", name))?;
    fs::write(dir.join("target.o"), b"\x7fELF")?;
    fs::write(dir.join("function.txt"), format!("{}\n", name))?;

    let script = dir.join("compile.sh");
    fs::write(&script, "#!/bin/sh\nexit 1\n")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unscripted_seed_scores_above_base() {
        let factory = MockFactory::new().with_target("f", MockTarget::new(50, SeedSpace::Random));
        let mut evaluator = factory.build(&factory.spec_for("f")).unwrap();

        let candidate = evaluator.evaluate(Seed::from_value(9)).unwrap();
        assert_eq!(candidate.score, Some(51));
        assert_eq!(candidate.hash.as_deref(), Some("f-9"));
        assert_eq!(factory.evaluations(), vec![("f".to_string(), Seed::from_value(9))]);
    }

    #[test]
    fn test_prepare_reads_fixture() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = create_target_fixture(tmp.path(), "func_a").unwrap();
        let layout = TargetLayout::validate(&dir).unwrap();

        let factory = MockFactory::new().with_target("func_a", MockTarget::new(7, SeedSpace::Counted(2)));
        let spec = factory.prepare(&layout, &EvalSettings::default()).unwrap();
        assert_eq!(spec.name, "func_a");
        assert_eq!(spec.base_score, 7);
        assert!(spec.base_source.contains("func_a"));
    }

    #[test]
    fn test_failing_builds() {
        let factory = MockFactory::new()
            .with_target("f", MockTarget::new(1, SeedSpace::Random))
            .failing_builds();
        assert!(factory.build(&factory.spec_for("f")).is_err());
        assert_eq!(factory.builds(), 0);
    }
}

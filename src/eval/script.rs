//! Evaluator backed by external tools
//!
//! Each evaluation runs the mutator to produce a candidate source, the
//! target's compile script to build it, and objdump to score it. Every
//! evaluator owns a private scratch directory holding its copy of the
//! compile script and target object, so evaluators never share files and a
//! remote server needs nothing but the [`TargetSpec`].

use super::compiler::Compiler;
use super::mutator::Mutator;
use super::scorer::{Scorer, PENALTY_INF};
use super::{Candidate, EvalSettings, Evaluator, EvaluatorFactory, TargetSpec};
use crate::seed::Seed;
use crate::stats::{Profiler, StatType};
use crate::target::layout::TargetLayout;
use crate::Result;
use anyhow::Context;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::TempDir;
use tracing::debug;

/// Commands a server runs for every client
///
/// A server never runs a compile script or mutator received over the
/// network; these replace them.
#[derive(Debug, Clone)]
pub struct ServerTools {
    /// Mutator command line
    pub mutator: String,
    /// Compile wrapper: `COMPILER <input.c> -o <output.o>`
    pub compiler: PathBuf,
}

/// Factory for [`ScriptEvaluator`]s
#[derive(Debug, Default, Clone)]
pub struct ScriptFactory {
    tools: Option<ServerTools>,
}

impl ScriptFactory {
    /// Factory for the machine that owns the target directories
    pub fn new() -> Self {
        Self { tools: None }
    }

    /// Factory for a server: ignores any command carried by a spec
    pub fn for_server(tools: ServerTools) -> Self {
        Self { tools: Some(tools) }
    }
}

fn mutator_for(settings: &EvalSettings) -> Result<Mutator> {
    let command = settings
        .mutator
        .as_deref()
        .context("No mutator command configured (use --mutator)")?;
    Mutator::new(command)
}

impl EvaluatorFactory for ScriptFactory {
    fn prepare(&self, layout: &TargetLayout, settings: &EvalSettings) -> Result<TargetSpec> {
        let mutator = mutator_for(settings)?;
        let base_source = fs::read_to_string(&layout.base_c)
            .with_context(|| format!("Failed to read {}", layout.base_c.display()))?;
        let compile_script = fs::read_to_string(&layout.compile_sh)
            .with_context(|| format!("Failed to read {}", layout.compile_sh.display()))?;
        let target_object = fs::read(&layout.target_o)
            .with_context(|| format!("Failed to read {}", layout.target_o.display()))?;

        let seed_space = mutator.seed_space(&layout.base_c)?;

        // Score the unmodified base to anchor the search
        let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
        let compiler = Compiler::new(layout.compile_sh.clone(), settings.show_errors);
        let object = compiler
            .compile(&base_source, scratch.path())?
            .with_context(|| format!("{} does not compile", layout.base_c.display()))?;
        let scorer = Scorer::new(&layout.target_o, settings.stack_differences)?;
        let (base_score, _) = scorer.score(&object)?;

        debug!(name = %layout.display_name(), base_score, %seed_space, "prepared target");

        Ok(TargetSpec {
            name: layout.display_name(),
            dir: layout.dir.clone(),
            base_source,
            base_score,
            seed_space,
            compile_script,
            target_object,
            settings: settings.clone(),
        })
    }

    fn build(&self, spec: &TargetSpec) -> Result<Box<dyn Evaluator>> {
        Ok(Box::new(ScriptEvaluator::new(spec, self.tools.as_ref())?))
    }
}

/// Mutate/compile/score pipeline for one target
pub struct ScriptEvaluator {
    base_source: String,
    base_score: u64,
    settings: EvalSettings,
    randomized: bool,
    mutator: Mutator,
    compiler: Compiler,
    scorer: Scorer,
    rng: Xoshiro256PlusPlus,
    /// Last compiled candidate, a starting point for the next mutation
    last_source: Option<String>,
    workspace: TempDir,
}

impl ScriptEvaluator {
    /// Evaluator for `spec`; with `tools`, the spec's own compile script
    /// and mutator are never written or run
    pub fn new(spec: &TargetSpec, tools: Option<&ServerTools>) -> Result<Self> {
        Self::with_scorer(spec, tools, Scorer::new)
    }

    fn with_scorer(
        spec: &TargetSpec,
        tools: Option<&ServerTools>,
        make_scorer: impl FnOnce(&Path, bool) -> Result<Scorer>,
    ) -> Result<Self> {
        let workspace = tempfile::Builder::new()
            .prefix("permuter-")
            .tempdir()
            .context("Failed to create evaluator workspace")?;

        let (script, mutator) = match tools {
            Some(tools) => (tools.compiler.clone(), Mutator::new(&tools.mutator)?),
            None => {
                let script = workspace.path().join("compile.sh");
                fs::write(&script, &spec.compile_script)
                    .with_context(|| format!("Failed to write {}", script.display()))?;
                make_executable(&script)?;
                (script, mutator_for(&spec.settings)?)
            }
        };

        let target_o = workspace.path().join("target.o");
        fs::write(&target_o, &spec.target_object)
            .with_context(|| format!("Failed to write {}", target_o.display()))?;

        Ok(Self {
            base_source: spec.base_source.clone(),
            base_score: spec.base_score,
            settings: spec.settings.clone(),
            randomized: spec.seed_space.is_random(),
            mutator,
            compiler: Compiler::new(script, spec.settings.show_errors),
            scorer: make_scorer(&target_o, spec.settings.stack_differences)?,
            rng: Xoshiro256PlusPlus::from_entropy(),
            last_source: None,
            workspace,
        })
    }

    /// Source to mutate: the previous candidate with probability
    /// `keep_prob` when searching randomly, otherwise the base
    fn starting_point(&mut self) -> String {
        match &self.last_source {
            Some(previous) if self.randomized && self.rng.gen_bool(self.settings.keep_prob) => previous.clone(),
            _ => self.base_source.clone(),
        }
    }
}

impl Evaluator for ScriptEvaluator {
    fn evaluate(&mut self, seed: Seed) -> Result<Candidate> {
        if seed.rng_seed != 0 {
            self.reseed(seed.rng_seed);
        }
        let mut profiler = Profiler::new();

        let start = Instant::now();
        let input_path = self.workspace.path().join("input.c");
        let input = self.starting_point();
        fs::write(&input_path, &input).with_context(|| format!("Failed to write {}", input_path.display()))?;
        let source = self.mutator.generate(&input_path, seed)?;
        profiler.add_stat(StatType::Perm, start.elapsed());

        if self.settings.need_all_sources {
            return Ok(Candidate { score: None, hash: None, source: Some(source), profiler });
        }

        let start = Instant::now();
        let object = self.compiler.compile(&source, self.workspace.path())?;
        profiler.add_stat(StatType::Compile, start.elapsed());

        let Some(object) = object else {
            return Ok(Candidate {
                score: Some(PENALTY_INF),
                hash: None,
                source: None,
                profiler,
            });
        };

        let start = Instant::now();
        let (score, hash) = self.scorer.score(&object)?;
        profiler.add_stat(StatType::Score, start.elapsed());

        self.last_source = Some(source.clone());
        // Only candidates that can be recorded need their source shipped back
        let source = (score <= self.base_score).then_some(source);
        Ok(Candidate {
            score: Some(score),
            hash: Some(hash),
            source,
            profiler,
        })
    }

    fn reseed(&mut self, rng_seed: u64) {
        self.rng = Xoshiro256PlusPlus::seed_from_u64(rng_seed);
        self.last_source = None;
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to mark {} executable", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::SeedSpace;

    fn spec(mutator: Option<&str>) -> TargetSpec {
        TargetSpec {
            name: "f".to_string(),
            dir: "f".into(),
            base_source: "int f;\n".to_string(),
            base_score: 10,
            seed_space: SeedSpace::Random,
            compile_script: "#!/bin/sh\nexit 1\n".to_string(),
            target_object: Vec::new(),
            settings: EvalSettings {
                mutator: mutator.map(str::to_string),
                ..EvalSettings::default()
            },
        }
    }

    #[cfg(unix)]
    fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_server_ignores_client_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let compile_marker = tmp.path().join("client-compile-ran");
        let mutator_marker = tmp.path().join("client-mutator-ran");

        let mut spec = spec(Some(format!("touch {}", mutator_marker.display()).as_str()));
        spec.compile_script = format!("#!/bin/sh\ntouch {}\nexit 1\n", compile_marker.display());

        let server_mutator = tmp.path().join("mutate.sh");
        write_script(&server_mutator, "cat \"$2\"");
        let server_compiler = tmp.path().join("cc.sh");
        write_script(&server_compiler, "exit 1");
        let tools = ServerTools {
            mutator: server_mutator.display().to_string(),
            compiler: server_compiler,
        };

        let mut evaluator =
            ScriptEvaluator::with_scorer(&spec, Some(&tools), |_, stack| Ok(Scorer::from_lines(Vec::new(), stack)))
                .unwrap();
        let candidate = evaluator.evaluate(Seed::new(0, 1)).unwrap();

        assert_eq!(candidate.score, Some(PENALTY_INF));
        assert!(!compile_marker.exists());
        assert!(!mutator_marker.exists());
        assert!(!evaluator.workspace.path().join("compile.sh").exists());
    }

    #[test]
    fn test_mutator_is_required() {
        let err = mutator_for(&spec(None).settings).unwrap_err();
        assert!(err.to_string().contains("--mutator"));
    }

    #[cfg(unix)]
    #[test]
    fn test_print_diffs_mode_skips_compilation() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("mutate.sh");
        write_script(&script, "cat \"$2\"\necho \"/* $4 */\"");

        let mut spec = spec(Some(script.display().to_string().as_str()));
        spec.settings.need_all_sources = true;

        // A missing objdump target would fail construction, so skip the scorer
        let mut evaluator = ScriptEvaluator {
            base_source: spec.base_source.clone(),
            base_score: spec.base_score,
            settings: spec.settings.clone(),
            randomized: true,
            mutator: mutator_for(&spec.settings).unwrap(),
            compiler: Compiler::new(tmp.path().join("compile.sh"), false),
            scorer: Scorer::from_lines(Vec::new(), false),
            rng: Xoshiro256PlusPlus::seed_from_u64(1),
            last_source: None,
            workspace: tempfile::tempdir().unwrap(),
        };

        let candidate = evaluator.evaluate(Seed::from_value(6)).unwrap();
        assert_eq!(candidate.score, None);
        assert_eq!(candidate.source.as_deref(), Some("int f;\n/* 6 */\n"));
        assert!(candidate.profiler.seconds(StatType::Compile) == 0.0);
    }
}

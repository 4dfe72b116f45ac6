//! External mutator command
//!
//! The mutator is any program that understands two subcommands:
//!
//! ```text
//! CMD seed-space <input.c>                       prints "random" or a seed count
//! CMD generate <input.c> <rng_seed> <seed>       prints the mutated source
//! ```
//!
//! It must be deterministic in `(input, rng_seed, seed)` so recorded
//! candidates can be reproduced.

use crate::seed::{Seed, SeedSpace};
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;
use std::process::{Command, Output};

/// Handle to a mutator command line
#[derive(Debug, Clone)]
pub struct Mutator {
    program: String,
    args: Vec<String>,
}

impl Mutator {
    /// Parse a whitespace-separated command line, e.g. `python3 mutate.py`
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            bail!("Mutator command is empty");
        };
        Ok(Self { program, args: parts.collect() })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Ask the mutator which seeds exist for `base_c`
    pub fn seed_space(&self, base_c: &Path) -> Result<SeedSpace> {
        let output = self
            .command()
            .arg("seed-space")
            .arg(base_c)
            .output()
            .with_context(|| format!("Failed to run mutator '{}'", self.program))?;
        let stdout = checked_stdout(&self.program, output)?;
        parse_seed_space(&stdout)
    }

    /// Produce the candidate source for `seed` from the source in `input`
    pub fn generate(&self, input: &Path, seed: Seed) -> Result<String> {
        let output = self
            .command()
            .arg("generate")
            .arg(input)
            .arg(seed.rng_seed.to_string())
            .arg(seed.value.to_string())
            .output()
            .with_context(|| format!("Failed to run mutator '{}'", self.program))?;
        checked_stdout(&self.program, output)
    }
}

fn checked_stdout(program: &str, output: Output) -> Result<String> {
    if !output.status.success() {
        bail!(
            "Mutator '{}' exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    String::from_utf8(output.stdout).with_context(|| format!("Mutator '{}' printed invalid UTF-8", program))
}

/// Parse `seed-space` output: `random` or a non-negative count
pub fn parse_seed_space(text: &str) -> Result<SeedSpace> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("random") {
        return Ok(SeedSpace::Random);
    }
    let count = text
        .parse::<u64>()
        .with_context(|| format!("Unexpected seed-space output '{}'", text))?;
    Ok(SeedSpace::Counted(count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seed_space() {
        assert_eq!(parse_seed_space("random\n").unwrap(), SeedSpace::Random);
        assert_eq!(parse_seed_space(" 120 ").unwrap(), SeedSpace::Counted(120));
        assert!(parse_seed_space("lots").is_err());
    }

    #[test]
    fn test_command_line_split() {
        let mutator = Mutator::new("python3  -m mutate").unwrap();
        assert_eq!(mutator.program, "python3");
        assert_eq!(mutator.args, vec!["-m", "mutate"]);
        assert!(Mutator::new("   ").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_mutator() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("mutate.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\nif [ \"$1\" = seed-space ]; then echo 3; else cat \"$2\"; echo \"/* $3 $4 */\"; fi\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let input = tmp.path().join("input.c");
        std::fs::write(&input, "int x;\n").unwrap();

        let mutator = Mutator::new(&script.display().to_string()).unwrap();
        assert_eq!(mutator.seed_space(&input).unwrap(), SeedSpace::Counted(3));
        let out = mutator.generate(&input, Seed::new(4, 2)).unwrap();
        assert_eq!(out, "int x;\n/* 4 2 */\n");
    }
}

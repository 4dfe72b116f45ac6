//! Compile-script wrapper

use crate::Result;
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Runs `compile.sh <input.c> -o <output.o>` inside a scratch directory
#[derive(Debug, Clone)]
pub struct Compiler {
    script: PathBuf,
    show_errors: bool,
}

impl Compiler {
    pub fn new(script: PathBuf, show_errors: bool) -> Self {
        Self { script, show_errors }
    }

    /// Compile `source`, returning the object path, or `None` when the
    /// compiler rejects it
    pub fn compile(&self, source: &str, workspace: &Path) -> Result<Option<PathBuf>> {
        let input = workspace.join("candidate.c");
        let object = workspace.join("candidate.o");
        fs::write(&input, source).with_context(|| format!("Failed to write {}", input.display()))?;
        if object.exists() {
            fs::remove_file(&object).with_context(|| format!("Failed to remove stale {}", object.display()))?;
        }

        let output = Command::new(&self.script)
            .arg(&input)
            .arg("-o")
            .arg(&object)
            .current_dir(workspace)
            .output()
            .with_context(|| format!("Failed to run {}", self.script.display()))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || !object.is_file() {
            if self.show_errors {
                eprintln!("Compilation failed ({}):\n{}", output.status, stderr.trim_end());
            }
            return Ok(None);
        }
        if self.show_errors && !stderr.trim().is_empty() {
            eprintln!("{}", stderr.trim_end());
        }
        Ok(Some(object))
    }
}

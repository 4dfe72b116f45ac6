//! Persisting recorded candidates
//!
//! Each recorded candidate gets its own directory `output-{score}-{n}` inside
//! the target directory, where `n` is the smallest counter not already taken.
//! Directories are claimed with `create_dir`, so concurrent writers (or a
//! previous run) never overwrite each other.

use crate::Result;
use anyhow::Context;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Files written for one candidate
pub struct CandidateFiles<'a> {
    pub score: u64,
    pub source: &'a str,
    pub base_source: &'a str,
    pub diff: &'a str,
}

/// Write `files` into a fresh `output-{score}-{n}` directory under `dir`
pub fn write_candidate(dir: &Path, files: &CandidateFiles<'_>) -> Result<PathBuf> {
    let output_dir = claim_output_dir(dir, files.score)?;

    write_new(&output_dir.join("source.c"), files.source)?;
    write_new(&output_dir.join("base.c"), files.base_source)?;
    write_new(&output_dir.join("score.txt"), &format!("{}\n", files.score))?;
    write_new(&output_dir.join("diff.txt"), &format!("{}\n", files.diff))?;

    Ok(output_dir)
}

fn claim_output_dir(dir: &Path, score: u64) -> Result<PathBuf> {
    let mut counter = 0u64;
    loop {
        counter += 1;
        let candidate = dir.join(format!("output-{}-{}", score, counter));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create {}", candidate.display()));
            }
        }
    }
}

fn write_new(path: &Path, contents: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

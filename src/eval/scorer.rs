//! Disassembly scoring
//!
//! Both the target object and each candidate are disassembled with
//! `objdump -d` (override with `$OBJDUMP`). The instruction streams are
//! aligned line by line and every difference costs a penalty:
//!
//! | Difference                                   | Penalty |
//! |----------------------------------------------|---------|
//! | Only stack offsets differ (`--stack-diffs`)  | 1       |
//! | Same mnemonic, different operands            | 5       |
//! | Extra instruction in the candidate           | 100     |
//! | Instruction missing from the candidate       | 100     |
//!
//! A score of zero is a perfect match. Candidates that fail to compile are
//! given [`PENALTY_INF`].
//!
//! The output hash is a SHA-256 over the normalized instruction stream, so
//! candidates that differ only in ways the score ignores share a hash.

use crate::util::diff::{diff_lines, DiffOp};
use crate::Result;
use anyhow::{bail, Context};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Command;

/// Score of a candidate that could not be compiled
pub const PENALTY_INF: u64 = 1_000_000_000;
pub const PENALTY_STACKDIFF: u64 = 1;
pub const PENALTY_REGALLOC: u64 = 5;
pub const PENALTY_INSERTION: u64 = 100;
pub const PENALTY_DELETION: u64 = 100;

/// One disassembled instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmLine {
    /// Instruction text with whitespace collapsed and annotations removed
    pub raw: String,
    /// `raw` with stack offsets masked
    pub normalized: String,
}

impl AsmLine {
    pub fn new(text: &str) -> Self {
        let raw = clean_instruction(text);
        let normalized = mask_stack_offsets(&raw);
        Self { raw, normalized }
    }

    pub fn mnemonic(&self) -> &str {
        self.raw.split(' ').next().unwrap_or("")
    }
}

/// Compares candidate objects against a fixed target
#[derive(Debug, Clone)]
pub struct Scorer {
    objdump: String,
    target: Vec<AsmLine>,
    stack_differences: bool,
}

impl Scorer {
    /// Disassemble the target once up front
    pub fn new(target_o: &Path, stack_differences: bool) -> Result<Self> {
        let objdump = std::env::var("OBJDUMP").unwrap_or_else(|_| "objdump".to_string());
        let target = disassemble(&objdump, target_o)?;
        Ok(Self { objdump, target, stack_differences })
    }

    /// Build from already-parsed target lines
    pub fn from_lines(target: Vec<AsmLine>, stack_differences: bool) -> Self {
        Self {
            objdump: "objdump".to_string(),
            target,
            stack_differences,
        }
    }

    /// Score and hash a compiled candidate
    pub fn score(&self, object: &Path) -> Result<(u64, String)> {
        let candidate = disassemble(&self.objdump, object)?;
        Ok(self.score_lines(&candidate))
    }

    pub fn score_lines(&self, candidate: &[AsmLine]) -> (u64, String) {
        let score = score_lines(&self.target, candidate, self.stack_differences);
        (score, hash_lines(candidate, self.stack_differences))
    }
}

fn disassemble(objdump: &str, object: &Path) -> Result<Vec<AsmLine>> {
    let output = Command::new(objdump)
        .arg("-d")
        .arg("--no-show-raw-insn")
        .arg(object)
        .output()
        .with_context(|| format!("Failed to run {}", objdump))?;
    if !output.status.success() {
        bail!(
            "{} failed on {}: {}",
            objdump,
            object.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(parse_objdump(&String::from_utf8_lossy(&output.stdout)))
}

/// Extract instruction lines (`  addr:\tinsn ...`) from objdump output
pub fn parse_objdump(text: &str) -> Vec<AsmLine> {
    text.lines()
        .filter_map(|line| {
            let (addr, rest) = line.split_once(':')?;
            let addr = addr.trim();
            if addr.is_empty() || !addr.chars().all(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            let insn = rest.trim();
            if insn.is_empty() {
                return None;
            }
            Some(AsmLine::new(insn))
        })
        .filter(|line| !line.raw.is_empty())
        .collect()
}

/// Drop comments and symbol annotations, collapse whitespace
fn clean_instruction(text: &str) -> String {
    let end = text.find(['#', '<', ';']).unwrap_or(text.len());
    text[..end].split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Replace numeric offsets in stack-pointer operands with `N`
fn mask_stack_offsets(raw: &str) -> String {
    let Some((mnemonic, operands)) = raw.split_once(' ') else {
        return raw.to_string();
    };
    let operands: Vec<String> = operands
        .split(',')
        .map(|operand| {
            if mentions_stack_pointer(operand) {
                mask_numbers(operand)
            } else {
                operand.to_string()
            }
        })
        .collect();
    format!("{} {}", mnemonic, operands.join(","))
}

fn mentions_stack_pointer(operand: &str) -> bool {
    ["%rsp", "%esp", "%sp", "$sp", "(sp", "[sp"]
        .iter()
        .any(|reg| operand.contains(reg))
}

/// Mask numeric literals that are not part of a register name
fn mask_numbers(operand: &str) -> String {
    let chars: Vec<char> = operand.chars().collect();
    let mut out = String::with_capacity(operand.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let starts_literal = c.is_ascii_digit()
            && (i == 0 || !(chars[i - 1].is_ascii_alphanumeric() || matches!(chars[i - 1], '%' | '$' | '_')));
        if starts_literal {
            let hex = c == '0' && chars.get(i + 1) == Some(&'x');
            i += if hex { 2 } else { 1 };
            while i < chars.len() && (chars[i].is_ascii_digit() || (hex && chars[i].is_ascii_hexdigit())) {
                i += 1;
            }
            out.push('N');
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// Penalty for turning `target` into `candidate`
pub fn score_lines(target: &[AsmLine], candidate: &[AsmLine], stack_differences: bool) -> u64 {
    let target_keys: Vec<&str> = target.iter().map(|line| line.normalized.as_str()).collect();
    let candidate_keys: Vec<&str> = candidate.iter().map(|line| line.normalized.as_str()).collect();

    let mut score = 0;
    let (mut i, mut j) = (0, 0);
    let mut deleted: Vec<usize> = Vec::new();
    let mut inserted: Vec<usize> = Vec::new();

    for op in diff_lines(&target_keys, &candidate_keys) {
        match op {
            DiffOp::Equal(_) => {
                score += replacement_penalty(target, candidate, &mut deleted, &mut inserted);
                if stack_differences && target[i].raw != candidate[j].raw {
                    score += PENALTY_STACKDIFF;
                }
                i += 1;
                j += 1;
            }
            DiffOp::Delete(_) => {
                deleted.push(i);
                i += 1;
            }
            DiffOp::Insert(_) => {
                inserted.push(j);
                j += 1;
            }
        }
    }
    score + replacement_penalty(target, candidate, &mut deleted, &mut inserted)
}

/// Cost of a block of deletions and insertions, pairing them up in order
fn replacement_penalty(
    target: &[AsmLine],
    candidate: &[AsmLine],
    deleted: &mut Vec<usize>,
    inserted: &mut Vec<usize>,
) -> u64 {
    let mut score = 0;
    for (&d, &n) in deleted.iter().zip(inserted.iter()) {
        score += if target[d].mnemonic() == candidate[n].mnemonic() {
            PENALTY_REGALLOC
        } else {
            PENALTY_DELETION + PENALTY_INSERTION
        };
    }
    let paired = deleted.len().min(inserted.len());
    score += (deleted.len() - paired) as u64 * PENALTY_DELETION;
    score += (inserted.len() - paired) as u64 * PENALTY_INSERTION;
    deleted.clear();
    inserted.clear();
    score
}

/// Hex SHA-256 of the instruction stream as the score sees it
pub fn hash_lines(lines: &[AsmLine], stack_differences: bool) -> String {
    let mut hasher = Sha256::new();
    for line in lines {
        let text = if stack_differences { &line.raw } else { &line.normalized };
        hasher.update(text.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &[&str]) -> Vec<AsmLine> {
        text.iter().map(|line| AsmLine::new(line)).collect()
    }

    #[test]
    fn test_parse_objdump() {
        let dump = "\
target.o:     file format elf64-x86-64


Disassembly of section .text:

0000000000000000 <f>:
   0:\tmov    0x8(%rsp),%eax   # load
   4:\tadd    $0x1,%eax
   7:\tret
";
        let parsed = parse_objdump(dump);
        let raw: Vec<&str> = parsed.iter().map(|l| l.raw.as_str()).collect();
        assert_eq!(raw, vec!["mov 0x8(%rsp),%eax", "add $0x1,%eax", "ret"]);
        assert_eq!(parsed[0].normalized, "mov N(%rsp),%eax");
        assert_eq!(parsed[1].normalized, "add $0x1,%eax");
    }

    #[test]
    fn test_register_digits_are_kept() {
        assert_eq!(mask_numbers("0x10(%rsp,%r12,8)"), "N(%rsp,%r12,N)");
        assert_eq!(mask_numbers("24($sp)"), "N($sp)");
    }

    #[test]
    fn test_identical_streams_score_zero() {
        let target = lines(&["push %rbp", "mov %rsp,%rbp", "ret"]);
        assert_eq!(score_lines(&target, &target, false), 0);
        assert_eq!(score_lines(&target, &target, true), 0);
    }

    #[test]
    fn test_penalties() {
        let target = lines(&["mov 0x8(%rsp),%eax", "add %ecx,%eax", "ret"]);

        // Stack offset only
        let cand = lines(&["mov 0x10(%rsp),%eax", "add %ecx,%eax", "ret"]);
        assert_eq!(score_lines(&target, &cand, false), 0);
        assert_eq!(score_lines(&target, &cand, true), PENALTY_STACKDIFF);

        // Register allocation
        let cand = lines(&["mov 0x8(%rsp),%eax", "add %edx,%eax", "ret"]);
        assert_eq!(score_lines(&target, &cand, false), PENALTY_REGALLOC);

        // Extra and missing instructions
        let cand = lines(&["mov 0x8(%rsp),%eax", "add %ecx,%eax", "nop", "ret"]);
        assert_eq!(score_lines(&target, &cand, false), PENALTY_INSERTION);
        let cand = lines(&["mov 0x8(%rsp),%eax", "ret"]);
        assert_eq!(score_lines(&target, &cand, false), PENALTY_DELETION);
    }

    #[test]
    fn test_hash_follows_normalization() {
        let a = lines(&["mov 0x8(%rsp),%eax", "ret"]);
        let b = lines(&["mov 0x10(%rsp),%eax", "ret"]);
        assert_eq!(hash_lines(&a, false), hash_lines(&b, false));
        assert_ne!(hash_lines(&a, true), hash_lines(&b, true));
        assert_eq!(hash_lines(&a, false).len(), 64);
    }
}

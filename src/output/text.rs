//! Human-readable status messages

use crate::eval::PENALTY_INF;
use crate::seed::Seed;
use crate::target::Improvement;
use std::path::Path;

const BOLD_GREEN: &str = "\u{1b}[32;1m";
const YELLOW: &str = "\u{1b}[33m";
const RED: &str = "\u{1b}[31m";
const RESET: &str = "\u{1b}[0m";

/// `inf` for uncompilable candidates, `-` when there is no score
pub fn format_score(score: Option<u64>) -> String {
    match score {
        Some(PENALTY_INF) => "inf".to_string(),
        Some(score) => score.to_string(),
        None => "-".to_string(),
    }
}

fn colour(improvement: Improvement) -> &'static str {
    match improvement {
        Improvement::NewBest | Improvement::TiedBest => BOLD_GREEN,
        Improvement::BetterThanBase | Improvement::SameScoreNewAsm => YELLOW,
    }
}

/// `[name] found new best score! (40 vs 100)`
pub fn improvement_message(name: &str, improvement: Improvement, score: u64, base_score: u64) -> String {
    match improvement {
        // Score equals the base here, so only one number is shown
        Improvement::SameScoreNewAsm => format!("[{}] {} ({})", name, improvement, score),
        _ => format!("[{}] {} ({} vs {})", name, improvement, score, base_score),
    }
}

/// Coloured improvement message
pub fn improvement_line(name: &str, improvement: Improvement, score: u64, base_score: u64) -> String {
    format!(
        "{}{}{}",
        colour(improvement),
        improvement_message(name, improvement, score, base_score),
        RESET
    )
}

pub fn print_improvement(name: &str, improvement: Improvement, score: u64, base_score: u64) {
    println!("{}", improvement_line(name, improvement, score, base_score));
}

pub fn print_written(dir: &Path) {
    println!("wrote to {}", dir.display());
}

/// Report a failed evaluation with enough detail to reproduce it
pub fn print_eval_error(name: &str, seed: Option<Seed>, message: &str) {
    println!("{}[{}] internal permuter failure.{}", RED, name, RESET);
    println!("{}", message.trim_end());
    if let Some(seed) = seed {
        println!("To reproduce the failure, rerun with: --seed {}", seed);
    }
}

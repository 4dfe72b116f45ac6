//! Live progress line
//!
//! A single status line, rewritten in place with `\r` after every processed
//! feedback item:
//!
//! ```text
//! iteration 1532, 4 errors, score = 215 (12.4/s)
//! ```
//!
//! Anything else printed to stdout must call [`ProgressLine::clear`] first
//! so messages do not interleave with the status text.

use crate::output::text::format_score;
use crate::stats::Profiler;
use crate::util::time::{calculate_rate, format_rate};
use std::io::Write;
use std::time::Instant;

/// Snapshot shown on the progress line
#[derive(Debug, Clone, Copy)]
pub struct ProgressStatus<'a> {
    pub iteration: u64,
    pub errors: u64,
    /// Score of the item just processed
    pub score: Option<u64>,
    /// Accumulated stage timings, shown when timings are enabled
    pub timings: Option<&'a Profiler>,
}

/// In-place status line on stdout
#[derive(Debug)]
pub struct ProgressLine {
    started: Instant,
    /// Width of the text currently on screen
    width: usize,
}

impl ProgressLine {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            width: 0,
        }
    }

    pub fn format(&self, status: &ProgressStatus<'_>) -> String {
        let rate = calculate_rate(status.iteration, self.started.elapsed());
        let mut line = format!(
            "iteration {}, {} errors, score = {} ({})",
            status.iteration,
            status.errors,
            format_score(status.score),
            format_rate(rate)
        );
        if let Some(timings) = status.timings {
            line.push_str("    ");
            line.push_str(&timings.to_string());
        }
        line
    }

    pub fn render(&mut self, status: &ProgressStatus<'_>) {
        let line = self.format(status);
        let padding = self.width.saturating_sub(line.len());
        print!("\r{}{}", line, " ".repeat(padding));
        let _ = std::io::stdout().flush();
        self.width = line.len();
    }

    /// Erase the status line so a message can be printed
    pub fn clear(&mut self) {
        if self.width > 0 {
            print!("\r{}\r", " ".repeat(self.width));
            let _ = std::io::stdout().flush();
            self.width = 0;
        }
    }

    /// Move past the status line, leaving it visible
    pub fn finish(&mut self) {
        if self.width > 0 {
            println!();
            self.width = 0;
        }
    }
}

impl Default for ProgressLine {
    fn default() -> Self {
        Self::new()
    }
}

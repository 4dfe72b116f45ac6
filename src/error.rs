//! Error types surfaced to the command line
//!
//! Most failures travel as `anyhow::Error` with context attached. The two
//! enums here cover the cases callers need to tell apart: a target directory
//! that cannot be searched, and the ways a run ends without finishing.

use std::path::PathBuf;
use thiserror::Error;

/// A target directory failed validation before any search started
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing file {}", .0.display())]
    MissingFile(PathBuf),

    #[error("{} must be marked executable.", .0.display())]
    NotExecutable(PathBuf),

    #[error("Could not prepare {}: {message}", .dir.display())]
    Construction { dir: PathBuf, message: String },
}

/// Ways a search run can end other than exhausting its seeds
#[derive(Debug, Error)]
pub enum RunError {
    /// The user interrupted a healthy run
    #[error("interrupted")]
    Interrupted,

    /// An evaluation error while errors are configured to abort the run
    #[error("[{target}] evaluation failed: {message}")]
    FatalEvaluation { target: String, message: String },

    /// No local workers were requested and no remote server accepted us
    #[error("No remote servers available. Exiting.")]
    NoWorkers,
}

impl RunError {
    /// True when `err` is (or wraps) an interrupt
    pub fn is_interrupt(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<RunError>(), Some(RunError::Interrupted))
    }
}

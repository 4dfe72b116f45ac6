//! Small shared helpers

pub mod diff;
pub mod time;

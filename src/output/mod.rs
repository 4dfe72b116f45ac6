//! Console and file output

pub mod json;
pub mod text;

//! Internal utilities.

pub mod glob;

pub use glob::GlobPattern;

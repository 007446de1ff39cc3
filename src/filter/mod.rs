//! Access-control filtering logic

pub mod listfile;
pub mod rules;

pub use listfile::{ListFile, ListSet};
pub use rules::{Decision, RuleEngine, Verdict};

//! CLI command implementations.

pub mod check_conflict;
pub mod inspect;
pub mod prune;

//! CLI command implementations.

pub mod pending;
pub mod schedule;
pub mod simulate;

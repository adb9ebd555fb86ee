//! CLI command implementations.

pub mod clean;
pub mod fetch;
pub mod update;

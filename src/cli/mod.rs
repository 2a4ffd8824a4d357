//! Command-line interface for evalforge.
//!
//! Provides commands for validating presets, expanding them into generation
//! tasks and executing runs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};

//! Command-line interface for flowforge.
//!
//! Provides the `migrate` and `check-config` operational commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};

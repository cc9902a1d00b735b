//! Command-line interface for subset-forge.

mod commands;

pub use commands::{build_config, parse_cli, run, run_with_cli, Cli};

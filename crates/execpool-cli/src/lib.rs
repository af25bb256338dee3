//! execpool CLI
//!
//! Subcommand implementations for the `execpool` binary.

pub mod bench_cmd;
pub mod run_cmd;

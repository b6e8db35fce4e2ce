//! Subcommand implementations, one module per command.

pub mod clear;
pub mod ingest;
pub mod maintain;
pub mod queries;
pub mod query;
pub mod results;
pub mod serve;
pub mod status;

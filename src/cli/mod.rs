//! CLI module for gate-replicator
//!
//! Provides command-line interface for:
//! - consume: run the replication worker
//! - publish: publish one mutation request
//! - topology: declare exchange, queues and binding

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{consume, publish, run, run_command, topology};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{read_request, write_error, write_response};

//! CLI argument definitions using clap
//!
//! Commands:
//! - gate-replicator consume --config <path>
//! - gate-replicator publish --config <path> [--file <request.json>]
//! - gate-replicator topology --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// gate-replicator - replicate administrative mutations into a mirror database
#[derive(Parser, Debug)]
#[command(name = "gate-replicator")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the replication worker until SIGINT or SIGTERM
    Consume {
        /// Path to configuration file
        #[arg(long, default_value = "./gate-replicator.json")]
        config: PathBuf,
    },

    /// Publish one mutation request and print the receipt
    Publish {
        /// Path to configuration file
        #[arg(long, default_value = "./gate-replicator.json")]
        config: PathBuf,

        /// JSON request file; read from stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Declare exchange, queues and binding, then exit
    Topology {
        /// Path to configuration file
        #[arg(long, default_value = "./gate-replicator.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_args() {
        let cli = Cli::try_parse_from([
            "gate-replicator",
            "publish",
            "--config",
            "/etc/gate.json",
            "--file",
            "req.json",
        ])
        .unwrap();

        match cli.command {
            Command::Publish { config, file } => {
                assert_eq!(config, PathBuf::from("/etc/gate.json"));
                assert_eq!(file, Some(PathBuf::from("req.json")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_default_config_path() {
        let cli = Cli::try_parse_from(["gate-replicator", "consume"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Consume { config } if config == PathBuf::from("./gate-replicator.json")
        ));
    }
}

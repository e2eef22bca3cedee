//! CLI interface for Sift
//!
//! Defines all commands and global flags using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Sift: ask questions about CSV files
///
/// Turns a natural-language question into a small analysis script, checks
/// it against a safety policy, runs it in an isolated worker and explains
/// the result.
#[derive(Parser, Debug)]
#[command(name = "sift")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ask a question about one or more CSV files
    Ask {
        /// The question
        query: String,

        /// CSV file to analyse (repeatable)
        #[arg(short, long = "file", value_name = "PATH", required = true)]
        files: Vec<PathBuf>,

        /// Session the question belongs to
        #[arg(short, long, default_value = "cli")]
        session: String,
    },

    /// Check a script against the safety policy without running it
    Check {
        /// Script file, or - for stdin
        script: PathBuf,
    },

    /// Run a script directly in the sandbox
    Exec {
        /// Script file, or - for stdin
        script: PathBuf,

        /// CSV file to bind (repeatable)
        #[arg(short, long = "file", value_name = "PATH")]
        files: Vec<PathBuf>,

        /// Wall-clock limit in seconds (defaults to the configured timeout)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show the inferred schema of CSV files
    Inspect {
        /// CSV files to describe
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show recent runs
    History {
        /// Number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Only show runs for this session
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Run system diagnostics
    Doctor,

    /// Execute one sandbox request from stdin (internal)
    #[command(name = "sandbox-worker", hide = true)]
    SandboxWorker,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["sift", "doctor"]).unwrap();
        assert!(matches!(cli.command, Command::Doctor));
        assert!(!cli.json);
    }

    #[test]
    fn test_ask_with_files() {
        let cli = Cli::try_parse_from([
            "sift", "ask", "average X by Group", "-f", "a.csv", "--file", "b.csv", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Ask {
                query,
                files,
                session,
            } => {
                assert_eq!(query, "average X by Group");
                assert_eq!(files, vec![PathBuf::from("a.csv"), PathBuf::from("b.csv")]);
                assert_eq!(session, "cli");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_ask_requires_a_file() {
        assert!(Cli::try_parse_from(["sift", "ask", "q"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["sift", "--log", "debug", "--config", "/tmp/c.toml", "history"])
                .unwrap();
        assert_eq!(cli.log.as_deref(), Some("debug"));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(cli.command, Command::History { limit: 10, .. }));
    }

    #[test]
    fn test_worker_subcommand_name() {
        let cli = Cli::try_parse_from(["sift", crate::sandbox::WORKER_SUBCOMMAND]).unwrap();
        assert!(matches!(cli.command, Command::SandboxWorker));
    }
}

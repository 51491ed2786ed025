//! CLI interface for lovestats
//!
//! Defines the commands and global flags using clap's derive API. Scheduled
//! refreshes are run by invoking `lovestats refresh` from cron or a job
//! runner.

use crate::refresh::RefreshMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Wiki Loves campaign statistics
///
/// Pulls per-country statistics from the Commons replica, keeps them in a
/// local catalog and serves them over HTTP.
#[derive(Parser, Debug)]
#[command(name = "lovestats")]
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
    /// Serve the read API
    Serve {
        /// Override the bind address from the config
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Run a refresh in the foreground
    Refresh {
        #[arg(long, value_enum, default_value = "incremental")]
        mode: RefreshMode,

        /// Skip warming the cache afterwards
        #[arg(long)]
        no_prebuild: bool,
    },

    /// Warm the cache for recent years in the catalog
    Prebuild,

    /// Show recent refresh runs
    Status {
        /// Number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },

    /// Print catalog data for a campaign
    Show {
        /// Campaign id, e.g. `earth`
        campaign: String,

        /// Only this year
        #[arg(short, long)]
        year: Option<i32>,
    },

    /// Check configuration and upstream connectivity
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_refresh_args() {
        let cli = Cli::parse_from(["lovestats", "refresh", "--mode", "full", "--no-prebuild"]);
        match cli.command {
            Command::Refresh { mode, no_prebuild } => {
                assert_eq!(mode, RefreshMode::Full);
                assert!(no_prebuild);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["lovestats", "show", "earth", "--year", "2024", "--json"]);
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Command::Show { ref campaign, year: Some(2024) } if campaign == "earth"
        ));
    }
}

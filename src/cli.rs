//! Command-line interface.
//!
//! Handles argument parsing and logging configuration.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// finetune - per-application volume control
#[derive(Parser, Debug)]
#[command(name = "finetune")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: <config dir>/finetune/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the volume daemon, reading finetune:// URLs from stdin (default)
    Run,
    /// List apps currently producing audio with their saved volume
    List,
    /// Check a finetune:// URL and print what it would do
    Open { url: String },
    /// List output devices
    Devices,
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }

    /// Filter directive from the verbosity flags, if any were given.
    pub fn verbosity_filter(&self) -> Option<&'static str> {
        if self.quiet {
            return Some("error");
        }
        match self.verbose {
            0 => None,
            1 => Some("finetune=info,finetune_lib=info"),
            2 => Some("finetune=debug,finetune_lib=debug"),
            _ => Some("finetune=trace,finetune_lib=trace"),
        }
    }
}

const DEFAULT_FILTER: &str = "finetune=info,finetune_lib=info";

/// Install the tracing subscriber. `RUST_LOG` wins, then the verbosity flags,
/// then the configured filter.
pub fn init_logging(args: &Args, configured: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        args.verbosity_filter()
            .or(configured)
            .unwrap_or(DEFAULT_FILTER)
            .into()
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_run() {
        let args = Args::parse_from(["finetune"]);
        assert_eq!(args.command(), Command::Run);
        assert_eq!(args.verbosity_filter(), None);
    }

    #[test]
    fn parses_open_and_flags() {
        let args = Args::parse_from(["finetune", "-vv", "open", "finetune://mute?app=x&muted=true"]);
        assert_eq!(
            args.command(),
            Command::Open {
                url: "finetune://mute?app=x&muted=true".into()
            }
        );
        assert_eq!(
            args.verbosity_filter(),
            Some("finetune=debug,finetune_lib=debug")
        );
    }

    #[test]
    fn quiet_wins_over_verbose() {
        let args = Args::parse_from(["finetune", "list", "-q", "-v"]);
        assert_eq!(args.verbosity_filter(), Some("error"));
    }
}

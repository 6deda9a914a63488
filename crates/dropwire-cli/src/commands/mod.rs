//! CLI command definitions and handlers.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Load configuration with graceful fallback to defaults.
///
/// This function should be used by all commands to load the user's configuration.
/// If the config file doesn't exist or can't be parsed, it falls back to defaults.
pub fn load_config() -> dropwire_core::config::Config {
    match dropwire_core::config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Using default configuration: {}", e);
            dropwire_core::config::Config::default()
        }
    }
}

pub mod config;
pub mod host;
pub mod join;
pub mod transfer;

/// Dropwire - Direct peer-to-peer file transfer
#[derive(Parser)]
#[command(name = "dropwire")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Open a room and wait for a peer to join
    Host(HostArgs),

    /// Join a room hosted by a peer
    Join(JoinArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Options shared by `host` and `join`
#[derive(Args, Clone)]
pub struct TransferArgs {
    /// Files to send once connected
    pub files: Vec<PathBuf>,

    /// Directory to save received files in
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Replace existing files instead of picking a numbered name
    #[arg(long)]
    pub overwrite: bool,

    /// Disconnect once our files are sent and nothing is being received
    #[arg(long)]
    pub exit_when_done: bool,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output progress as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the host command
#[derive(Parser)]
pub struct HostArgs {
    /// Address to listen on (IP or IP:PORT)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Transfer options
    #[command(flatten)]
    pub transfer: TransferArgs,
}

/// Arguments for the join command
#[derive(Parser)]
pub struct JoinArgs {
    /// Room address printed by `dropwire host` (IP or IP:PORT)
    pub address: String,

    /// Transfer options
    #[command(flatten)]
    pub transfer: TransferArgs,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show all configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Reset to defaults
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_join_with_files() {
        let cli = Cli::parse_from([
            "dropwire",
            "join",
            "10.0.0.2:52620",
            "a.txt",
            "b.txt",
            "--output",
            "/tmp/in",
            "--json",
        ]);

        let Command::Join(args) = cli.command else {
            panic!("expected join");
        };
        assert_eq!(args.address, "10.0.0.2:52620");
        assert_eq!(args.transfer.files.len(), 2);
        assert_eq!(args.transfer.output, Some(PathBuf::from("/tmp/in")));
        assert!(args.transfer.json);
        assert!(!args.transfer.quiet);
    }

    #[test]
    fn test_parse_host_defaults() {
        let cli = Cli::parse_from(["dropwire", "host"]);
        let Command::Host(args) = cli.command else {
            panic!("expected host");
        };
        assert!(args.bind.is_none());
        assert!(args.transfer.files.is_empty());
        assert!(!args.transfer.exit_when_done);
    }

    #[test]
    fn test_subcommands_are_host_join_config() {
        let names: Vec<String> = Cli::command()
            .get_subcommands()
            .map(|c| c.get_name().to_string())
            .filter(|name| name != "help")
            .collect();
        assert_eq!(names, vec!["host", "join", "config"]);

        assert!(Cli::try_parse_from(["dropwire", "completions", "generate", "bash"]).is_err());
    }
}

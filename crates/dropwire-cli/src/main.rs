//! Dropwire CLI - Direct peer-to-peer file transfer
//!
//! One side hosts a room, the other joins it, and files flow directly
//! between the two in 16 KiB chunks.
//!
//! ## Quick Start
//!
//! ```bash
//! # Host a room and offer a file
//! dropwire host ./document.pdf
//!
//! # Join it from another machine
//! dropwire join 192.168.1.20
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Host(args) => commands::host::run(args).await,
        Command::Join(args) => commands::join::run(args).await,
        Command::Config(args) => commands::config::run(args),
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,dropwire=info,dropwire_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

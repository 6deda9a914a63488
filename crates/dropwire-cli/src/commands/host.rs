//! Host command implementation.

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use dropwire_core::net::{parse_host_address, TcpChannel};

use super::transfer::{self, OutputMode, TransferPlan};
use super::HostArgs;
use crate::ui::RoomBox;

/// Run the host command.
pub async fn run(args: HostArgs) -> Result<()> {
    let config = super::load_config();
    let plan = TransferPlan::new(&args.transfer, &config)?;

    let bind = args
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.network.bind, config.network.port));
    let addr = parse_host_address(&bind, config.network.port)?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {addr}"))?;
    let local = listener.local_addr()?;

    match plan.mode() {
        OutputMode::Pretty => {
            println!();
            println!("Dropwire v{}", dropwire_core::VERSION);
            println!("{}", "-".repeat(41));
            println!();
            RoomBox::new(&local.to_string())
                .with_files(plan.files().len())
                .display();
            println!();
            if local.ip().is_unspecified() {
                println!("  Join with: dropwire join <this-machine-ip>:{}", local.port());
            } else {
                println!("  Join with: dropwire join {local}");
            }
            println!("  Waiting for a peer...");
        }
        OutputMode::Json => {
            println!(
                "{}",
                serde_json::json!({ "event": "listening", "address": local.to_string() })
            );
        }
        OutputMode::Quiet => {}
    }

    let (channel, events) = tokio::select! {
        accepted = TcpChannel::accept(&listener, config.network.keepalive) => accepted?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Stopped waiting for a peer");
            return Ok(());
        }
    };
    drop(listener);

    transfer::run(channel, events, plan, &config).await
}

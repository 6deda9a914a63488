//! Join command implementation.

use anyhow::Result;

use dropwire_core::net::{parse_host_address, TcpChannel};

use super::transfer::{self, OutputMode, TransferPlan};
use super::JoinArgs;

/// Run the join command.
pub async fn run(args: JoinArgs) -> Result<()> {
    let config = super::load_config();
    let plan = TransferPlan::new(&args.transfer, &config)?;
    let addr = parse_host_address(&args.address, config.network.port)?;

    if plan.mode() == OutputMode::Pretty {
        println!();
        println!("Dropwire v{}", dropwire_core::VERSION);
        println!("{}", "-".repeat(41));
        println!();
        println!("  Joining room {addr}...");
    }

    let (channel, events) = TcpChannel::connect(addr, config.network.keepalive).await?;

    transfer::run(channel, events, plan, &config).await
}

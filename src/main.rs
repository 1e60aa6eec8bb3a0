use clap::Parser;
use leasewire::{network::read_mac_address, Args, ClientConfig, DhcpClient};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn StdError>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Read the hardware (MAC) address from the system.
    let mac_addr = read_mac_address(&args.interface).await?;
    tracing::info!("Found MAC address {} on {}", mac_addr, args.interface);

    let config = ClientConfig::new(args.interface.clone(), mac_addr).with_args(&args);
    let mut client = DhcpClient::new(config).await?;

    match client.run().await? {
        Some(lease) => tracing::info!(
            "Released {} on {} (held since {:?} ago)",
            lease.address,
            lease.interface,
            lease.bound_at.elapsed()
        ),
        None => tracing::info!("Shut down without a lease"),
    }

    Ok(())
}

//! # Leasewire - DHCPv4 Leases over Raw Frames
//!
//! Leasewire acquires and keeps an IPv4 lease by building every DHCP frame itself,
//! from the Ethernet header down to the options, and driving the
//! DISCOVER/OFFER/REQUEST/ACK exchange with its own retry timers.
//!
//! ## Features
//!
//! - Bounds-checked, big-endian Ethernet/IPv4/UDP/DHCP codec
//! - Several concurrent lease attempts per interface, keyed by transaction ID
//! - DISCOVER retries with a give-up limit and a REQUEST heartbeat once bound
//! - Pluggable network interface, timer and randomness sources for testing
//! - Linux `AF_PACKET` backend driven by Tokio
//!
//! ## Example
//!
//! ```rust,no_run
//! use leasewire::{ClientConfig, DhcpClient, MacAddr};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mac: MacAddr = "00:0c:29:a8:92:f4".parse()?;
//!     let config = ClientConfig::new("eth0".to_string(), mac);
//!     let mut client = DhcpClient::new(config).await?;
//!     let lease = client.run().await?;
//!     println!("Obtained lease: {:?}", lease);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod network;
pub mod timer;
pub mod v4;

pub use client::{DhcpClient, Lease};
pub use config::{Args, ClientConfig, LeasePolicy};
pub use error::LeaseError;
pub use network::{MacAddr, NetworkInterface};
pub use timer::{Scheduler, TimerQueue};
pub use v4::LeaseClient;

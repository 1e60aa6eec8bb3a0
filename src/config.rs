use crate::network::MacAddr;
use clap::Parser;
use std::{net::Ipv4Addr, time::Duration};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The network interface to lease an address on (e.g., 'eth0')
    #[arg(short, long)]
    pub interface: String,

    /// Seconds between DISCOVER retries and REQUEST re-sends
    #[arg(long, default_value_t = 5)]
    pub retry_interval: u64,

    /// DISCOVER retries before a lease attempt is abandoned
    #[arg(long, default_value_t = 5)]
    pub discover_attempts: u8,

    /// Prefix length used when assigning the leased address
    #[arg(long, default_value_t = 24)]
    pub prefix_len: u8,
}

/// Timing and addressing rules for lease negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub retry_interval: Duration,
    pub discover_limit: u8,
    /// IPv4 source address of REQUEST frames.
    pub request_source: Ipv4Addr,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
            discover_limit: 5,
            request_source: Ipv4Addr::new(1, 1, 1, 254),
        }
    }
}

pub struct ClientConfig {
    pub interface: String,
    pub mac_address: MacAddr,
    pub policy: LeasePolicy,
    pub prefix_len: u8,
    /// How often the driver checks for expired timers.
    pub timer_tick: Duration,
}

impl ClientConfig {
    pub fn new(interface: String, mac_address: MacAddr) -> Self {
        Self {
            interface,
            mac_address,
            policy: LeasePolicy::default(),
            prefix_len: 24,
            timer_tick: Duration::from_millis(250),
        }
    }

    /// Applies the command-line overrides.
    pub fn with_args(mut self, args: &Args) -> Self {
        self.policy.retry_interval = Duration::from_secs(args.retry_interval);
        self.policy.discover_limit = args.discover_attempts;
        self.prefix_len = args.prefix_len;
        self
    }
}

//! DHCPv4 protocol implementation
//!
//! This module contains the DHCPv4-specific implementation including:
//! - Frame construction and parsing down to the Ethernet layer
//! - The per-interface session store
//! - The lease state machine and its retry timers

pub mod frame;
pub mod handler;
pub mod session;
pub mod store;

#[cfg(test)]
mod tests;

pub use frame::{build_discover, build_request, parse_inbound, Inbound, Reply};
pub use handler::LeaseClient;
pub use session::{Context, Offer, Phase, Session, SessionState};
pub use store::{Entropy, SessionStore, ThreadRngEntropy};

use crate::{network::SocketError, v4::frame::CodecError};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("No network interface attached to the session")]
    NoInterface,

    #[error("No DHCP session for transaction {xid:#010x}")]
    NoSession { xid: u32 },

    #[error("DHCP session store has not been initialized on this interface")]
    NoSessionStore,

    #[error("Transaction ID must be non-zero")]
    InvalidTransactionId,

    #[error("Failed to allocate a {len}-byte frame")]
    FrameAllocationFailed { len: usize },

    #[error("Interface refused to transmit the frame")]
    TransmissionFailed,

    #[error("Lease attempt {xid:#010x} gave up after exhausting its retries")]
    RetriesExhausted { xid: u32 },

    #[error("Frame encoding failed")]
    Codec(#[from] CodecError),

    #[error("Socket operation failed")]
    Socket(#[from] SocketError),

    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("Failed to parse MAC address: {0}")]
    MacParse(String),

    #[error("Interface '{0}' not found or has no MAC address")]
    InterfaceInvalid(String),
}

use crate::{error::LeaseError, v4::frame::finalize_ipv4_udp};
use bytes::BytesMut;
use socket2::Socket;
use std::{
    fmt, io,
    net::Ipv4Addr,
    path::Path,
    process::Command,
    str::FromStr,
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tokio::{fs, io::unix::AsyncFd};

/// Defines all possible errors for socket operations.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Failed to create a new socket")]
    CreateSocket(#[source] io::Error),

    #[error("Interface '{interface}' has no kernel index")]
    InterfaceIndex {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind packet socket to interface '{interface}'")]
    BindToDevice {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to set socket to non-blocking mode")]
    SetNonBlocking(#[source] io::Error),

    #[error("Failed to register socket with the tokio reactor")]
    Register(#[source] io::Error),

    #[allow(dead_code)]
    #[error("Raw packet sockets are not implemented on this platform")]
    NotImplemented,
}

/// A 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn as_bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Parses a MAC address string (e.g., "0a:1b:2c:3d:4e:5f").
impl FromStr for MacAddr {
    type Err = LeaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| LeaseError::MacParse(s.to_string()))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|e| LeaseError::MacParse(format!("{s}: {e}")))?;
        }
        if parts.next().is_some() {
            return Err(LeaseError::MacParse(s.to_string()));
        }
        Ok(Self(octets))
    }
}

/// The link a DHCP client runs on.
///
/// Implementations own frame buffers and the transmit path; the lease state machine
/// only fills buffers in and hands them back.
pub trait NetworkInterface {
    fn name(&self) -> &str;

    fn mac_address(&self) -> MacAddr;

    /// Returns a zeroed buffer of exactly `len` bytes, or `None` when out of capacity.
    fn allocate(&mut self, len: usize) -> Option<BytesMut>;

    /// Finalizes IPv4/UDP lengths and checksum, then puts the frame on the wire.
    fn transmit(&mut self, frame: BytesMut) -> bool;

    /// Binds a leased address to the interface.
    fn add_ipv4_address(&mut self, addr: Ipv4Addr) -> bool;
}

/// Reads the hardware address of `interface` from sysfs.
pub async fn read_mac_address(interface: &str) -> Result<MacAddr, LeaseError> {
    let path = format!("/sys/class/net/{interface}/address");
    read_mac_address_from(&path)
        .await
        .map_err(|_| LeaseError::InterfaceInvalid(interface.to_string()))
}

pub async fn read_mac_address_from(path: impl AsRef<Path>) -> Result<MacAddr, LeaseError> {
    let mac_str = fs::read_to_string(path).await?;
    mac_str.trim().parse()
}

/// An `AF_PACKET` socket bound to a single Linux interface.
pub struct RawInterface {
    name: String,
    mac: MacAddr,
    prefix_len: u8,
    socket: Arc<AsyncFd<Socket>>,
}

impl RawInterface {
    /// Opens a raw IPv4 packet socket on `interface`.
    #[cfg(target_os = "linux")]
    pub fn open(interface: &str, mac: MacAddr, prefix_len: u8) -> Result<Self, SocketError> {
        use socket2::{Domain, Protocol, Type};
        use std::{ffi::CString, os::fd::AsRawFd};

        let eth_p_ip = (libc::ETH_P_IP as u16).to_be();
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(i32::from(eth_p_ip))),
        )
        .map_err(SocketError::CreateSocket)?;

        let name = CString::new(interface).map_err(|e| SocketError::InterfaceIndex {
            interface: interface.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;
        // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            return Err(SocketError::InterfaceIndex {
                interface: interface.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        // SAFETY: sockaddr_ll is plain old data; all-zero is a valid starting value.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = eth_p_ip;
        addr.sll_ifindex = index as i32;
        // SAFETY: the fd is valid and `addr` lives across the call with the length we pass.
        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(SocketError::BindToDevice {
                interface: interface.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        socket
            .set_nonblocking(true)
            .map_err(SocketError::SetNonBlocking)?;
        let socket = AsyncFd::try_new(socket)
            .map_err(|e| SocketError::Register(e.into_parts().1))?;

        Ok(Self {
            name: interface.to_string(),
            mac,
            prefix_len,
            socket: Arc::new(socket),
        })
    }

    /// Fallback for non-Linux systems where `AF_PACKET` is not available.
    #[cfg(not(target_os = "linux"))]
    pub fn open(_interface: &str, _mac: MacAddr, _prefix_len: u8) -> Result<Self, SocketError> {
        Err(SocketError::NotImplemented)
    }

    /// Shared handle to the socket for receive readiness.
    pub fn socket(&self) -> Arc<AsyncFd<Socket>> {
        Arc::clone(&self.socket)
    }
}

impl NetworkInterface for RawInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn mac_address(&self) -> MacAddr {
        self.mac
    }

    fn allocate(&mut self, len: usize) -> Option<BytesMut> {
        Some(BytesMut::zeroed(len))
    }

    fn transmit(&mut self, mut frame: BytesMut) -> bool {
        if let Err(e) = finalize_ipv4_udp(&mut frame) {
            tracing::error!("Refusing to send malformed frame: {}", e);
            return false;
        }
        match self.socket.get_ref().send(&frame) {
            Ok(sent) if sent == frame.len() => true,
            Ok(sent) => {
                tracing::warn!(
                    "Short write on {}: {} of {} bytes",
                    self.name,
                    sent,
                    frame.len()
                );
                false
            }
            Err(e) => {
                tracing::error!("Send on {} failed: {}", self.name, e);
                false
            }
        }
    }

    fn add_ipv4_address(&mut self, addr: Ipv4Addr) -> bool {
        let cidr = format!("{}/{}", addr, self.prefix_len);
        // Blocks the driver task; `ip addr add` returns in milliseconds and the
        // interface contract is synchronous.
        let started = Instant::now();
        let status = Command::new("ip")
            .args(["addr", "add", &cidr, "dev", &self.name])
            .status();
        tracing::debug!("`ip addr add {}` took {:?}", cidr, started.elapsed());
        match status {
            Ok(status) if status.success() => {
                tracing::info!("Assigned {} to {}", cidr, self.name);
                true
            }
            Ok(status) => {
                tracing::error!("`ip addr add {}` on {} exited with {}", cidr, self.name, status);
                false
            }
            Err(e) => {
                tracing::error!("Failed to run `ip`: {}", e);
                false
            }
        }
    }
}

//! Ethernet/IPv4/UDP/DHCP frame codec
//!
//! Client frames are laid out byte for byte as a broadcast Ethernet frame carrying
//! an IPv4/UDP datagram from port 68 to port 67. Every field goes through a
//! bounds-checked cursor and is written in network byte order.

use super::session::Session;
use crate::network::MacAddr;
use dhcproto::v4::{MessageType, OptionCode};
use std::net::Ipv4Addr;
use thiserror::Error;

pub const ETHER_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
/// Fixed BOOTP header (236 bytes) plus the magic cookie.
pub const DHCP_HEADER_LEN: usize = 240;
/// message-type (3) + client-identifier (9) + requested-ip (6)
/// + parameter-request-list (5) + end (1)
pub const DHCP_OPTIONS_LEN: usize = 24;

pub const DHCP_OFFSET: usize = ETHER_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN;
pub const FRAME_LEN: usize = DHCP_OFFSET + DHCP_HEADER_LEN + DHCP_OPTIONS_LEN;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const IP_PROTOCOL_UDP: u8 = 17;
pub const IP_TTL: u8 = 64;
pub const DHCP_CLIENT_PORT: u16 = 68;
pub const DHCP_SERVER_PORT: u16 = 67;
pub const MAGIC_COOKIE: u32 = 0x6382_5363;

const BOOTREQUEST: u8 = 1;
const HTYPE_ETHERNET: u8 = 1;
const HLEN_ETHERNET: u8 = 6;
const CHADDR_LEN: usize = 16;
const SNAME_LEN: usize = 64;
const FILE_LEN: usize = 128;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame buffer overflow: {needed} bytes needed at offset {offset}, {remaining} left")]
    Overflow {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("frame truncated: {needed} bytes needed at offset {offset}, {remaining} left")]
    Underflow {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
}

/// Write cursor over a frame buffer.
pub struct FrameWriter<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> FrameWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Moves the cursor to an absolute position inside the buffer.
    pub fn seek(&mut self, offset: usize) -> Result<&mut Self, CodecError> {
        if offset > self.buf.len() {
            return Err(CodecError::Overflow {
                offset: self.offset,
                needed: offset - self.offset,
                remaining: self.remaining(),
            });
        }
        self.offset = offset;
        Ok(self)
    }

    pub fn bytes(&mut self, data: &[u8]) -> Result<&mut Self, CodecError> {
        if data.len() > self.remaining() {
            return Err(CodecError::Overflow {
                offset: self.offset,
                needed: data.len(),
                remaining: self.remaining(),
            });
        }
        self.buf[self.offset..self.offset + data.len()].copy_from_slice(data);
        self.offset += data.len();
        Ok(self)
    }

    pub fn zeros(&mut self, len: usize) -> Result<&mut Self, CodecError> {
        if len > self.remaining() {
            return Err(CodecError::Overflow {
                offset: self.offset,
                needed: len,
                remaining: self.remaining(),
            });
        }
        self.buf[self.offset..self.offset + len].fill(0);
        self.offset += len;
        Ok(self)
    }

    pub fn u8(&mut self, value: u8) -> Result<&mut Self, CodecError> {
        self.bytes(&[value])
    }

    pub fn u16(&mut self, value: u16) -> Result<&mut Self, CodecError> {
        self.bytes(&value.to_be_bytes())
    }

    pub fn u32(&mut self, value: u32) -> Result<&mut Self, CodecError> {
        self.bytes(&value.to_be_bytes())
    }

    pub fn ipv4(&mut self, addr: Ipv4Addr) -> Result<&mut Self, CodecError> {
        self.bytes(&addr.octets())
    }

    /// Writes one `code, length, data` option.
    pub fn option(&mut self, code: OptionCode, data: &[u8]) -> Result<&mut Self, CodecError> {
        let len = u8::try_from(data.len()).map_err(|_| CodecError::Overflow {
            offset: self.offset,
            needed: data.len(),
            remaining: u8::MAX as usize,
        })?;
        self.u8(code.into())?.u8(len)?.bytes(data)
    }
}

/// Read cursor over a received frame.
pub struct FrameReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn slice(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if len > self.remaining() {
            return Err(CodecError::Underflow {
                offset: self.offset,
                needed: len,
                remaining: self.remaining(),
            });
        }
        let data = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(data)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), CodecError> {
        self.slice(len).map(|_| ())
    }

    pub fn arr<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0; N];
        out.copy_from_slice(self.slice(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        self.arr::<1>().map(|b| b[0])
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        self.arr().map(u16::from_be_bytes)
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        self.arr().map(u32::from_be_bytes)
    }

    pub fn ipv4(&mut self) -> Result<Ipv4Addr, CodecError> {
        self.arr::<4>().map(Ipv4Addr::from)
    }
}

/// Parameters of one client-to-server frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientFrame {
    pub message_type: MessageType,
    pub mac: MacAddr,
    pub xid: u32,
    pub source: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub requested: Ipv4Addr,
}

/// Encodes a complete client frame into `buf` and returns the number of bytes used.
///
/// IPv4 total length, identification and checksum as well as the UDP length and
/// checksum are left zero; see [`finalize_ipv4_udp`].
pub fn encode(buf: &mut [u8], frame: &ClientFrame) -> Result<usize, CodecError> {
    let mac = frame.mac.as_bytes();
    let mut w = FrameWriter::new(buf);

    // Ethernet
    w.bytes(&MacAddr::BROADCAST.as_bytes())?
        .bytes(&mac)?
        .u16(ETHER_TYPE_IPV4)?;

    // IPv4: version 4, IHL 5, DSCP/ECN 0, no fragmentation
    w.u8(0x45)?
        .u8(0)?
        .u16(0)? // total length
        .u16(0)? // identification
        .u16(0)? // flags + fragment offset
        .u8(IP_TTL)?
        .u8(IP_PROTOCOL_UDP)?
        .u16(0)? // header checksum
        .ipv4(frame.source)?
        .ipv4(Ipv4Addr::BROADCAST)?;

    // UDP
    w.u16(DHCP_CLIENT_PORT)?
        .u16(DHCP_SERVER_PORT)?
        .u16(0)? // length
        .u16(0)?; // checksum

    // BOOTP fixed header
    w.u8(BOOTREQUEST)?
        .u8(HTYPE_ETHERNET)?
        .u8(HLEN_ETHERNET)?
        .u8(0)? // hops
        .u32(frame.xid)?
        .u16(0)? // secs
        .u16(0)? // flags
        .ipv4(Ipv4Addr::UNSPECIFIED)? // ciaddr
        .ipv4(Ipv4Addr::UNSPECIFIED)? // yiaddr
        .ipv4(Ipv4Addr::UNSPECIFIED)? // siaddr
        .ipv4(frame.gateway)?
        .bytes(&mac)?
        .zeros(CHADDR_LEN - mac.len())?
        .zeros(SNAME_LEN + FILE_LEN)?
        .u32(MAGIC_COOKIE)?;

    let mut client_id = [0u8; 7];
    client_id[0] = HTYPE_ETHERNET;
    client_id[1..].copy_from_slice(&mac);

    w.option(OptionCode::MessageType, &[frame.message_type.into()])?
        .option(OptionCode::ClientIdentifier, &client_id)?
        .option(OptionCode::RequestedIpAddress, &frame.requested.octets())?
        .option(
            OptionCode::ParameterRequestList,
            &[
                OptionCode::SubnetMask.into(),
                OptionCode::Router.into(),
                OptionCode::DomainName.into(),
            ],
        )?
        .u8(OptionCode::End.into())?;

    Ok(w.offset())
}

/// Encodes the DISCOVER frame for `session`.
pub fn build_discover(
    buf: &mut [u8],
    mac: MacAddr,
    session: &Session,
) -> Result<usize, CodecError> {
    encode(
        buf,
        &ClientFrame {
            message_type: MessageType::Discover,
            mac,
            xid: session.xid(),
            source: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            requested: Ipv4Addr::UNSPECIFIED,
        },
    )
}

/// Encodes the REQUEST frame for `session` using whatever it learned from the OFFER.
pub fn build_request(
    buf: &mut [u8],
    mac: MacAddr,
    session: &Session,
    source: Ipv4Addr,
) -> Result<usize, CodecError> {
    encode(
        buf,
        &ClientFrame {
            message_type: MessageType::Request,
            mac,
            xid: session.xid(),
            source,
            gateway: session.gateway_address(),
            requested: session.offered_address(),
        },
    )
}

/// Server replies this client acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Offer,
    Ack,
    Nak,
}

/// The parts of a server reply the state machine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inbound {
    pub xid: u32,
    pub reply: Reply,
    pub your_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
}

/// Classifies a received frame.
///
/// Returns `None` for anything that is not an OFFER, ACK or NAK sent from the DHCP
/// server port, including truncated frames.
pub fn parse_inbound(frame: &[u8]) -> Option<Inbound> {
    match read_inbound(&mut FrameReader::new(frame)) {
        Ok(inbound) => inbound,
        Err(e) => {
            tracing::trace!("Dropping malformed frame: {}", e);
            None
        }
    }
}

fn read_inbound(r: &mut FrameReader<'_>) -> Result<Option<Inbound>, CodecError> {
    r.skip(12)?;
    if r.u16()? != ETHER_TYPE_IPV4 {
        return Ok(None);
    }

    let version_ihl = r.u8()?;
    let ihl = usize::from(version_ihl & 0x0f) * 4;
    if version_ihl >> 4 != 4 || ihl < IPV4_HEADER_LEN {
        return Ok(None);
    }
    r.skip(8)?;
    if r.u8()? != IP_PROTOCOL_UDP {
        return Ok(None);
    }
    r.skip(ihl - 10)?;

    if r.u16()? != DHCP_SERVER_PORT {
        return Ok(None);
    }
    r.skip(UDP_HEADER_LEN - 2)?;

    r.skip(4)?; // op, htype, hlen, hops
    let xid = r.u32()?;
    r.skip(4 + 4)?; // secs, flags, ciaddr
    let your_ip = r.ipv4()?;
    r.skip(4)?; // siaddr
    let gateway_ip = r.ipv4()?;
    r.skip(CHADDR_LEN + SNAME_LEN + FILE_LEN)?;
    if r.u32()? != MAGIC_COOKIE {
        return Ok(None);
    }

    let Some(message_type) = find_message_type(r)? else {
        return Ok(None);
    };
    let reply = match MessageType::from(message_type) {
        MessageType::Offer => Reply::Offer,
        MessageType::Ack => Reply::Ack,
        MessageType::Nak => Reply::Nak,
        _ => return Ok(None),
    };

    Ok(Some(Inbound {
        xid,
        reply,
        your_ip,
        gateway_ip,
    }))
}

fn find_message_type(r: &mut FrameReader<'_>) -> Result<Option<u8>, CodecError> {
    while r.remaining() > 0 {
        let code = OptionCode::from(r.u8()?);
        match code {
            OptionCode::Pad => continue,
            OptionCode::End => break,
            _ => {}
        }
        let len = usize::from(r.u8()?);
        let data = r.slice(len)?;
        if code == OptionCode::MessageType {
            return Ok(data.first().copied());
        }
    }
    Ok(None)
}

/// Fills in the IPv4 total length and header checksum and the UDP length of a
/// frame produced by [`encode`].
pub fn finalize_ipv4_udp(frame: &mut [u8]) -> Result<(), CodecError> {
    let ip_start = ETHER_HEADER_LEN;
    let ihl = {
        let mut r = FrameReader::new(frame);
        r.skip(ip_start)?;
        usize::from(r.u8()? & 0x0f) * 4
    };
    let udp_start = ip_start + ihl;
    let total = frame.len();
    if total < udp_start + UDP_HEADER_LEN {
        return Err(CodecError::Underflow {
            offset: udp_start,
            needed: UDP_HEADER_LEN,
            remaining: total.saturating_sub(udp_start),
        });
    }
    let ip_len = u16::try_from(total - ip_start).map_err(|_| CodecError::Overflow {
        offset: ip_start,
        needed: total - ip_start,
        remaining: u16::MAX as usize,
    })?;
    // Bounded by ip_len above.
    let udp_len = (total - udp_start) as u16;

    let mut w = FrameWriter::new(frame);
    w.seek(ip_start + 2)?.u16(ip_len)?;
    w.seek(ip_start + 10)?.u16(0)?;
    w.seek(udp_start + 4)?.u16(udp_len)?;

    let checksum = ipv4_checksum(&frame[ip_start..udp_start]);
    FrameWriter::new(frame).seek(ip_start + 10)?.u16(checksum)?;
    Ok(())
}

/// RFC 1071 one's-complement sum over an IPv4 header.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

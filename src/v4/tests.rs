use super::frame::{DHCP_HEADER_LEN, DHCP_OFFSET, ETHER_HEADER_LEN, FRAME_LEN};
use super::*;
use crate::{
    config::LeasePolicy,
    error::LeaseError,
    network::{MacAddr, NetworkInterface},
    timer::{Scheduler, TimerQueue},
};
use bytes::BytesMut;
use dhcproto::{v4, Decodable, Decoder, Encodable, Encoder};
use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

const MAC: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
const OFFERED: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default)]
struct FakeInterface {
    sent: Vec<Vec<u8>>,
    addresses: Vec<Ipv4Addr>,
    fail_allocation: bool,
    fail_transmit: bool,
}

impl NetworkInterface for FakeInterface {
    fn name(&self) -> &str {
        "eth0"
    }

    fn mac_address(&self) -> MacAddr {
        MAC
    }

    fn allocate(&mut self, len: usize) -> Option<BytesMut> {
        (!self.fail_allocation).then(|| BytesMut::zeroed(len))
    }

    fn transmit(&mut self, frame: BytesMut) -> bool {
        if self.fail_transmit {
            return false;
        }
        self.sent.push(frame.to_vec());
        true
    }

    fn add_ipv4_address(&mut self, addr: Ipv4Addr) -> bool {
        self.addresses.push(addr);
        true
    }
}

type Calls = Arc<Mutex<Vec<(String, u32, Ipv4Addr)>>>;

fn recorder(calls: &Calls) -> impl FnMut(&str, u32, Ipv4Addr, &Context) + Send + 'static {
    let calls = Arc::clone(calls);
    move |nic, xid, address, _| calls.lock().unwrap().push((nic.to_string(), xid, address))
}

struct Harness {
    client: LeaseClient<FakeInterface, TimerQueue>,
    offered: Calls,
    acked: Calls,
    t0: Instant,
}

impl Harness {
    fn new() -> Self {
        let mut client = LeaseClient::new(
            FakeInterface::default(),
            TimerQueue::new(),
            LeasePolicy::default(),
        );
        client.initialize();
        let t0 = client.timers().now();
        Self {
            client,
            offered: Calls::default(),
            acked: Calls::default(),
            t0,
        }
    }

    fn request(&mut self) -> u32 {
        self.client
            .lease_request(
                recorder(&self.offered),
                recorder(&self.acked),
                Arc::new(()),
            )
            .unwrap()
    }

    fn sent(&self) -> &[Vec<u8>] {
        &self.client.interface().sent
    }

    fn last_sent(&self) -> v4::Message {
        let frame = self.sent().last().expect("nothing was sent");
        v4::Message::decode(&mut Decoder::new(&frame[DHCP_OFFSET..])).unwrap()
    }

    fn tick(&mut self, periods: u32) -> usize {
        self.client.run_due_timers(self.t0 + INTERVAL * periods)
    }

    fn state(&self, xid: u32) -> Option<SessionState> {
        self.client.session(xid).map(Session::state)
    }
}

fn server_frame(
    xid: u32,
    message_type: v4::MessageType,
    yiaddr: Ipv4Addr,
    giaddr: Ipv4Addr,
) -> Vec<u8> {
    let mut msg = v4::Message::default();
    msg.set_opcode(v4::Opcode::BootReply)
        .set_xid(xid)
        .set_yiaddr(yiaddr)
        .set_giaddr(giaddr)
        .set_chaddr(&MAC.as_bytes());
    msg.opts_mut()
        .insert(v4::DhcpOption::MessageType(message_type));
    msg.opts_mut()
        .insert(v4::DhcpOption::ServerIdentifier(GATEWAY));
    msg.opts_mut()
        .insert(v4::DhcpOption::AddressLeaseTime(3600));

    let mut payload = Vec::new();
    msg.encode(&mut Encoder::new(&mut payload)).unwrap();
    wrap_udp(67, 5, &payload)
}

/// Puts a DHCP payload behind Ethernet, IPv4 (`ihl` words) and UDP headers.
fn wrap_udp(source_port: u16, ihl: u8, payload: &[u8]) -> Vec<u8> {
    let ip_len = usize::from(ihl) * 4;
    let mut frame = vec![0u8; ETHER_HEADER_LEN + ip_len + 8 + payload.len()];
    let mut w = frame::FrameWriter::new(&mut frame);
    w.bytes(&MacAddr::BROADCAST.as_bytes()).unwrap();
    w.bytes(&[0x02, 0, 0, 0, 0, 0x01]).unwrap();
    w.u16(frame::ETHER_TYPE_IPV4).unwrap();
    w.u8(0x40 | ihl).unwrap();
    w.zeros(7).unwrap();
    w.u8(64).unwrap();
    w.u8(frame::IP_PROTOCOL_UDP).unwrap();
    w.u16(0).unwrap();
    w.ipv4(GATEWAY).unwrap();
    w.ipv4(Ipv4Addr::BROADCAST).unwrap();
    w.zeros(ip_len - 20).unwrap();
    w.u16(source_port).unwrap();
    w.u16(68).unwrap();
    w.u16((8 + payload.len()) as u16).unwrap();
    w.u16(0).unwrap();
    w.bytes(payload).unwrap();
    frame
}

fn offer(xid: u32) -> Vec<u8> {
    server_frame(xid, v4::MessageType::Offer, OFFERED, GATEWAY)
}

fn ack(xid: u32) -> Vec<u8> {
    server_frame(xid, v4::MessageType::Ack, OFFERED, GATEWAY)
}

fn nak(xid: u32) -> Vec<u8> {
    server_frame(xid, v4::MessageType::Nak, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)
}

#[test]
fn lease_request_broadcasts_a_discover() {
    let mut h = Harness::new();
    let xid = h.request();

    assert_ne!(xid, 0);
    assert_eq!(h.state(xid), Some(SessionState::Discovering));
    assert_eq!(h.sent().len(), 1);

    let frame = &h.sent()[0];
    assert_eq!(frame.len(), FRAME_LEN);
    assert_eq!(&frame[0..6], &[0xff; 6]);
    assert_eq!(&frame[6..12], &MAC.as_bytes());
    assert_eq!(&frame[12..14], &[0x08, 0x00]);
    assert_eq!(frame[14], 0x45);
    assert_eq!(frame[23], 17);
    assert_eq!(&frame[26..30], &[0, 0, 0, 0]);
    assert_eq!(&frame[30..34], &[255, 255, 255, 255]);
    assert_eq!(&frame[34..38], &[0, 68, 0, 67]);

    let msg = h.last_sent();
    assert_eq!(msg.xid(), xid);
    assert_eq!(msg.opcode(), v4::Opcode::BootRequest);
    assert_eq!(msg.htype(), v4::HType::Eth);
    assert_eq!(msg.chaddr(), &MAC.as_bytes()[..]);
    assert_eq!(msg.ciaddr(), Ipv4Addr::UNSPECIFIED);
    assert_eq!(msg.yiaddr(), Ipv4Addr::UNSPECIFIED);
    assert_eq!(msg.giaddr(), Ipv4Addr::UNSPECIFIED);
    assert!(matches!(
        msg.opts().get(v4::OptionCode::MessageType),
        Some(v4::DhcpOption::MessageType(v4::MessageType::Discover))
    ));
    assert!(matches!(
        msg.opts().get(v4::OptionCode::ClientIdentifier),
        Some(v4::DhcpOption::ClientIdentifier(id))
            if id[..] == [1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]
    ));
}

#[test]
fn options_are_written_in_wire_order() {
    let mut h = Harness::new();
    h.request();

    let options = &h.sent()[0][DHCP_OFFSET + DHCP_HEADER_LEN..];
    assert_eq!(
        options,
        &[
            53, 1, 1, // DISCOVER
            61, 7, 1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, // client identifier
            50, 4, 0, 0, 0, 0, // requested address
            55, 3, 1, 3, 15, // subnet mask, router, domain name
            255,
        ]
    );
}

#[test]
fn offer_is_answered_with_a_request() {
    let mut h = Harness::new();
    let xid = h.request();
    let discover_timer = h.client.session(xid).unwrap().discover_timer().unwrap();

    assert!(h.client.handle_inbound(&offer(xid)));

    let session = h.client.session(xid).unwrap();
    assert_eq!(session.state(), SessionState::Requesting);
    assert_eq!(session.offered_address(), OFFERED);
    assert_eq!(session.gateway_address(), GATEWAY);
    assert_eq!(session.discover_timer(), None);
    assert!(!h.client.timers().is_active(discover_timer));
    assert!(h.client.timers().is_active(session.request_timer().unwrap()));

    assert_eq!(
        *h.offered.lock().unwrap(),
        vec![("eth0".to_string(), xid, OFFERED)]
    );
    assert!(h.acked.lock().unwrap().is_empty());

    assert_eq!(h.sent().len(), 2);
    assert_eq!(&h.sent()[1][26..30], &[1, 1, 1, 254]);
    let msg = h.last_sent();
    assert_eq!(msg.xid(), xid);
    assert_eq!(msg.giaddr(), GATEWAY);
    assert!(matches!(
        msg.opts().get(v4::OptionCode::MessageType),
        Some(v4::DhcpOption::MessageType(v4::MessageType::Request))
    ));
    assert!(matches!(
        msg.opts().get(v4::OptionCode::RequestedIpAddress),
        Some(v4::DhcpOption::RequestedIpAddress(ip)) if *ip == OFFERED
    ));
}

#[test]
fn ack_binds_the_offered_address() {
    let mut h = Harness::new();
    let xid = h.request();
    h.client.handle_inbound(&offer(xid));
    let request_timer = h.client.session(xid).unwrap().request_timer().unwrap();

    assert!(h.client.handle_inbound(&ack(xid)));

    let session = h.client.session(xid).unwrap();
    assert_eq!(session.state(), SessionState::Bound);
    assert_eq!(session.offered_address(), OFFERED);
    assert_eq!(session.discover_timer(), None);
    let heartbeat = session.request_timer().unwrap();
    assert_ne!(heartbeat, request_timer);
    assert!(!h.client.timers().is_active(request_timer));
    assert!(h.client.timers().is_active(heartbeat));
    assert_eq!(h.client.timers().len(), 1);

    assert_eq!(
        *h.acked.lock().unwrap(),
        vec![("eth0".to_string(), xid, OFFERED)]
    );
    assert_eq!(h.client.interface().addresses, vec![OFFERED]);
}

#[test]
fn bound_sessions_keep_re_sending_request() {
    let mut h = Harness::new();
    let xid = h.request();
    h.client.handle_inbound(&offer(xid));
    h.client.handle_inbound(&ack(xid));
    assert_eq!(h.sent().len(), 2);

    for period in 1..=3 {
        assert_eq!(h.tick(period), 1);
        assert!(matches!(
            h.last_sent().opts().get(v4::OptionCode::MessageType),
            Some(v4::DhcpOption::MessageType(v4::MessageType::Request))
        ));
    }
    assert_eq!(h.sent().len(), 5);
    assert_eq!(h.state(xid), Some(SessionState::Bound));
}

#[test]
fn renewal_ack_does_not_rebind() {
    let mut h = Harness::new();
    let xid = h.request();
    h.client.handle_inbound(&offer(xid));
    h.client.handle_inbound(&ack(xid));
    h.tick(1);

    assert!(h.client.handle_inbound(&ack(xid)));
    assert_eq!(h.acked.lock().unwrap().len(), 1);
    assert_eq!(h.client.interface().addresses.len(), 1);
    assert_eq!(h.client.timers().len(), 1);
}

#[test]
fn nak_unbinds_the_session() {
    let mut h = Harness::new();
    let xid = h.request();
    h.client.handle_inbound(&offer(xid));

    assert!(h.client.handle_inbound(&nak(xid)));

    let session = h.client.session(xid).unwrap();
    assert_eq!(session.state(), SessionState::Unbound);
    assert_eq!(session.offered_address(), Ipv4Addr::UNSPECIFIED);
    assert_eq!(session.gateway_address(), Ipv4Addr::UNSPECIFIED);
    assert_eq!(session.interface(), None);
    assert!(!session.has_callbacks());
    assert!(h.client.timers().is_empty());

    // Nothing more is sent or accepted for it.
    let sent = h.sent().len();
    assert_eq!(h.tick(1), 0);
    assert!(!h.client.handle_inbound(&ack(xid)));
    assert_eq!(h.sent().len(), sent);
    assert!(h.acked.lock().unwrap().is_empty());
}

#[test]
fn discover_gives_up_after_the_retry_limit() {
    let mut h = Harness::new();
    let xid = h.request();

    for period in 1..=5 {
        assert_eq!(h.tick(period), 1);
        assert_eq!(h.sent().len(), 1 + period as usize);
        assert_eq!(h.state(xid), Some(SessionState::Discovering));
    }

    assert_eq!(h.tick(6), 1);
    assert_eq!(h.state(xid), None);
    assert!(h.client.timers().is_empty());
    assert_eq!(h.sent().len(), 6);

    assert_eq!(h.tick(20), 0);
    assert_eq!(h.sent().len(), 6);
}

#[test]
fn releasing_a_discarded_attempt_reports_no_session() {
    let mut h = Harness::new();
    let xid = h.request();
    for period in 1..=6 {
        h.tick(period);
    }
    assert_eq!(h.state(xid), None);

    assert!(matches!(
        h.client.release(xid),
        Err(LeaseError::NoSession { xid: missing }) if missing == xid
    ));

    h.client.destroy();
    assert!(matches!(
        h.client.release(xid),
        Err(LeaseError::NoSessionStore)
    ));
}

#[test]
fn retry_counters_are_per_session() {
    let mut h = Harness::new();
    let first = h.request();
    h.tick(1);
    h.tick(2);
    let second = h.request();

    for period in 3..=6 {
        h.tick(period);
    }
    // The first session exhausted its retries at the sixth firing, the second has
    // only fired four times.
    assert_eq!(h.state(first), None);
    assert_eq!(h.state(second), Some(SessionState::Discovering));
    assert!(matches!(
        h.client.session(second).unwrap().phase(),
        Phase::Discovering { attempts: 4, .. }
    ));
}

#[test]
fn foreign_traffic_is_ignored() {
    let mut h = Harness::new();
    let xid = h.request();
    let mut dns = offer(xid);
    // Rewrite the UDP source port to 53.
    dns[34..36].copy_from_slice(&53u16.to_be_bytes());

    assert!(!h.client.handle_inbound(&dns));
    assert_eq!(h.state(xid), Some(SessionState::Discovering));
    assert!(h.offered.lock().unwrap().is_empty());
    assert_eq!(h.sent().len(), 1);

    let mut arp = offer(xid);
    arp[12..14].copy_from_slice(&[0x08, 0x06]);
    assert!(!h.client.handle_inbound(&arp));

    let mut tcp = offer(xid);
    tcp[23] = 6;
    assert!(!h.client.handle_inbound(&tcp));
    assert_eq!(h.state(xid), Some(SessionState::Discovering));
}

#[test]
fn replies_for_unknown_transactions_are_ignored() {
    let mut h = Harness::new();
    let xid = h.request();

    assert!(!h.client.handle_inbound(&offer(xid.wrapping_add(1))));
    assert_eq!(h.state(xid), Some(SessionState::Discovering));
}

#[test]
fn unrecognized_message_types_are_ignored() {
    let mut h = Harness::new();
    let xid = h.request();
    let inform = server_frame(xid, v4::MessageType::Inform, OFFERED, GATEWAY);

    assert!(!h.client.handle_inbound(&inform));
    assert_eq!(h.state(xid), Some(SessionState::Discovering));
}

#[test]
fn replies_out_of_order_are_ignored() {
    let mut h = Harness::new();
    let xid = h.request();

    // ACK before any OFFER.
    assert!(!h.client.handle_inbound(&ack(xid)));
    assert_eq!(h.state(xid), Some(SessionState::Discovering));

    h.client.handle_inbound(&offer(xid));
    // A second OFFER while requesting.
    assert!(!h.client.handle_inbound(&offer(xid)));
    assert_eq!(h.offered.lock().unwrap().len(), 1);
    assert_eq!(h.sent().len(), 2);
}

#[test]
fn offers_without_an_address_are_ignored() {
    let mut h = Harness::new();
    let xid = h.request();
    let empty = server_frame(xid, v4::MessageType::Offer, Ipv4Addr::UNSPECIFIED, GATEWAY);

    assert!(!h.client.handle_inbound(&empty));
    assert_eq!(h.state(xid), Some(SessionState::Discovering));
}

#[test]
fn ip_options_in_server_replies_are_skipped() {
    let mut h = Harness::new();
    let xid = h.request();
    let mut payload = Vec::new();
    let mut msg = v4::Message::default();
    msg.set_opcode(v4::Opcode::BootReply)
        .set_xid(xid)
        .set_yiaddr(OFFERED)
        .set_giaddr(GATEWAY);
    msg.opts_mut()
        .insert(v4::DhcpOption::MessageType(v4::MessageType::Offer));
    msg.encode(&mut Encoder::new(&mut payload)).unwrap();

    assert!(h.client.handle_inbound(&wrap_udp(67, 6, &payload)));
    assert_eq!(h.state(xid), Some(SessionState::Requesting));
}

#[test]
fn replies_without_the_magic_cookie_are_ignored() {
    let mut h = Harness::new();
    let xid = h.request();
    let mut bootp = offer(xid);
    let cookie = DHCP_OFFSET + DHCP_HEADER_LEN - 4;
    assert_eq!(&bootp[cookie..cookie + 4], &[0x63, 0x82, 0x53, 0x63]);
    bootp[cookie + 3] = 0x00;

    assert!(!h.client.handle_inbound(&bootp));
    assert_eq!(h.state(xid), Some(SessionState::Discovering));
    assert!(h.offered.lock().unwrap().is_empty());
    assert_eq!(h.sent().len(), 1);
}

#[test]
fn pad_options_before_the_message_type_are_skipped() {
    let mut h = Harness::new();
    let xid = h.request();

    let mut payload = vec![0u8; DHCP_HEADER_LEN + 6];
    let mut w = frame::FrameWriter::new(&mut payload);
    w.bytes(&[2, 1, 6, 0]).unwrap(); // op, htype, hlen, hops
    w.u32(xid).unwrap();
    w.zeros(4 + 4).unwrap();
    w.ipv4(OFFERED).unwrap();
    w.zeros(4).unwrap();
    w.ipv4(GATEWAY).unwrap();
    w.bytes(&MAC.as_bytes()).unwrap();
    w.zeros(10 + 64 + 128).unwrap();
    w.u32(frame::MAGIC_COOKIE).unwrap();
    w.bytes(&[0, 0, 53, 1, 2, 255]).unwrap();
    assert_eq!(w.remaining(), 0);

    assert!(h.client.handle_inbound(&wrap_udp(67, 5, &payload)));
    assert_eq!(h.state(xid), Some(SessionState::Requesting));
    let session = h.client.session(xid).unwrap();
    assert_eq!(session.offered_address(), OFFERED);
    assert_eq!(session.gateway_address(), GATEWAY);
}

#[test]
fn context_is_passed_back_to_callbacks() {
    let mut h = Harness::new();
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let xid = h
        .client
        .lease_request(
            move |_, _, _, context| {
                *sink.lock().unwrap() = context.downcast_ref::<u32>().copied();
            },
            |_, _, _, _| {},
            Arc::new(99u32),
        )
        .unwrap();

    h.client.handle_inbound(&offer(xid));
    assert_eq!(*seen.lock().unwrap(), Some(99));
}

#[test]
fn lease_request_needs_an_initialized_store() {
    let mut client = LeaseClient::new(
        FakeInterface::default(),
        TimerQueue::new(),
        LeasePolicy::default(),
    );
    let err = client
        .lease_request(|_, _, _, _| {}, |_, _, _, _| {}, Arc::new(()))
        .unwrap_err();

    assert!(matches!(err, LeaseError::NoSessionStore));
    assert!(!client.handle_inbound(&offer(7)));
}

#[test]
fn failed_discover_leaves_no_session_behind() {
    let mut h = Harness::new();
    h.client.interface_mut().fail_allocation = true;
    let err = h
        .client
        .lease_request(|_, _, _, _| {}, |_, _, _, _| {}, Arc::new(()))
        .unwrap_err();
    assert!(matches!(err, LeaseError::FrameAllocationFailed { len } if len == FRAME_LEN));

    h.client.interface_mut().fail_allocation = false;
    h.client.interface_mut().fail_transmit = true;
    let err = h
        .client
        .lease_request(|_, _, _, _| {}, |_, _, _, _| {}, Arc::new(()))
        .unwrap_err();
    assert!(matches!(err, LeaseError::TransmissionFailed));

    assert!(h.client.store().unwrap().is_empty());
    assert!(h.client.timers().is_empty());
}

#[test]
fn transaction_ids_come_from_the_entropy_source() {
    let mut draws = vec![39u64, 39, 40].into_iter();
    let mut client = LeaseClient::new(
        FakeInterface::default(),
        TimerQueue::new(),
        LeasePolicy::default(),
    )
    .with_entropy(move || draws.next().unwrap());
    client.initialize();

    let first = client
        .lease_request(|_, _, _, _| {}, |_, _, _, _| {}, Arc::new(()))
        .unwrap();
    let second = client
        .lease_request(|_, _, _, _| {}, |_, _, _, _| {}, Arc::new(()))
        .unwrap();

    assert_eq!(first, 42);
    assert_eq!(second, 43);
}

#[test]
fn release_cancels_timers_once() {
    let mut h = Harness::new();
    let xid = h.request();
    h.client.handle_inbound(&offer(xid));

    assert!(h.client.release(xid).is_ok());
    assert!(h.client.timers().is_empty());
    assert!(matches!(
        h.client.release(xid),
        Err(LeaseError::NoSession { xid: missing }) if missing == xid
    ));
    assert!(matches!(
        h.client.release(0),
        Err(LeaseError::InvalidTransactionId)
    ));
}

#[test]
fn destroy_drops_every_session_and_timer() {
    let mut h = Harness::new();
    let first = h.request();
    let second = h.request();
    h.client.handle_inbound(&offer(second));
    assert_eq!(h.client.timers().len(), 2);

    h.client.destroy();

    assert!(h.client.store().is_none());
    assert!(h.client.timers().is_empty());
    assert!(!h.client.handle_inbound(&ack(second)));
    assert!(h.client.session(first).is_none());
}

#[test]
fn stale_timers_do_nothing() {
    let mut h = Harness::new();
    let xid = h.request();
    h.client.handle_inbound(&offer(xid));
    let sent = h.sent().len();

    assert!(!h.client.fire(crate::timer::TimerTask {
        xid,
        kind: crate::timer::TimerKind::DiscoverRetry,
    }));
    assert!(!h.client.fire(crate::timer::TimerTask {
        xid: xid.wrapping_add(1),
        kind: crate::timer::TimerKind::RequestResend,
    }));
    assert_eq!(h.sent().len(), sent);
}

#[test]
fn cancelling_twice_through_the_scheduler_is_harmless() {
    let mut h = Harness::new();
    let xid = h.request();
    let handle = h.client.session(xid).unwrap().discover_timer().unwrap();

    assert!(h.client.timers_mut().cancel(handle));
    assert!(!h.client.timers_mut().cancel(handle));
    // The session still retries nothing, and removal does not trip over the
    // already-cancelled handle.
    assert_eq!(h.tick(1), 0);
    assert!(h.client.release(xid).is_ok());
}

//! DHCPv4 lease state machine
//!
//! A [`LeaseClient`] runs every lease negotiation of one network interface:
//! DISCOVER is re-broadcast until an OFFER arrives, the OFFER is answered with a
//! REQUEST, and an ACK binds the address and keeps a REQUEST heartbeat going.
//!
//! Inbound frames and timer firings must be fed in from a single task; nothing in
//! here locks.

use super::{
    frame::{self, Inbound, Reply, FRAME_LEN},
    session::{Callbacks, Context, Offer, Phase, Session},
    store::{Entropy, SessionStore, ThreadRngEntropy},
};
use crate::{
    config::LeasePolicy,
    error::LeaseError,
    network::NetworkInterface,
    timer::{Scheduler, TimerKind, TimerQueue, TimerTask},
};
use dhcproto::v4::MessageType;
use std::{net::Ipv4Addr, time::Instant};
use tracing::{debug, info, warn};

pub struct LeaseClient<N, S> {
    nic: N,
    timers: S,
    store: Option<SessionStore>,
    entropy: Box<dyn Entropy + Send>,
    policy: LeasePolicy,
}

impl<N: NetworkInterface, S: Scheduler> LeaseClient<N, S> {
    pub fn new(nic: N, timers: S, policy: LeasePolicy) -> Self {
        Self {
            nic,
            timers,
            store: None,
            entropy: Box::new(ThreadRngEntropy),
            policy,
        }
    }

    /// Replaces the transaction ID randomness source.
    pub fn with_entropy(mut self, entropy: impl Entropy + Send + 'static) -> Self {
        self.entropy = Box::new(entropy);
        self
    }

    pub fn interface(&self) -> &N {
        &self.nic
    }

    pub fn interface_mut(&mut self) -> &mut N {
        &mut self.nic
    }

    pub fn timers(&self) -> &S {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut S {
        &mut self.timers
    }

    pub fn policy(&self) -> &LeasePolicy {
        &self.policy
    }

    /// Prepares the session store. Calling it again keeps the existing sessions.
    pub fn initialize(&mut self) {
        if self.store.is_none() {
            debug!("Creating DHCP session store for {}", self.nic.name());
            self.store = Some(SessionStore::new());
        }
    }

    /// Cancels every timer and drops all sessions with the store.
    pub fn destroy(&mut self) {
        if let Some(store) = self.store.take() {
            for session in store.into_sessions() {
                if let Some(handle) = session.phase().timer() {
                    self.timers.cancel(handle);
                }
            }
            debug!("Destroyed DHCP session store for {}", self.nic.name());
        }
    }

    pub fn store(&self) -> Option<&SessionStore> {
        self.store.as_ref()
    }

    pub fn session(&self, xid: u32) -> Option<&Session> {
        self.store.as_ref()?.get(xid)
    }

    /// Starts a new negotiation and returns its transaction ID.
    ///
    /// `on_offered` runs once the server's OFFER has been answered, `on_acked` once
    /// the address is bound. Both receive `context` back.
    pub fn lease_request<F, G>(
        &mut self,
        on_offered: F,
        on_acked: G,
        context: Context,
    ) -> Result<u32, LeaseError>
    where
        F: FnMut(&str, u32, Ipv4Addr, &Context) + Send + 'static,
        G: FnMut(&str, u32, Ipv4Addr, &Context) + Send + 'static,
    {
        let store = self.store.as_mut().ok_or(LeaseError::NoSessionStore)?;
        let xid = store.generate_xid(self.entropy.as_mut());
        let callbacks = Callbacks {
            on_offered: Box::new(on_offered),
            on_acked: Box::new(on_acked),
        };
        store.insert(Session::new(xid, self.nic.name(), callbacks, context));

        info!("Requesting lease on {} (xid={:#010x})", self.nic.name(), xid);
        if let Err(e) = self.send(xid, MessageType::Discover) {
            if let Some(store) = self.store.as_mut() {
                store.remove(xid);
            }
            return Err(e);
        }

        let interval = self.policy.retry_interval;
        let handle = self.timers.add(
            TimerTask {
                xid,
                kind: TimerKind::DiscoverRetry,
            },
            interval,
            interval,
        );
        if let Some(session) = self.session_mut(xid) {
            session.set_timer(handle);
        }
        Ok(xid)
    }

    /// Feeds a frame from the interface's receive path.
    ///
    /// Returns `true` if it was a DHCP reply that moved one of our sessions along;
    /// everything else is dropped silently.
    pub fn handle_inbound(&mut self, frame: &[u8]) -> bool {
        let Some(inbound) = frame::parse_inbound(frame) else {
            return false;
        };
        let Some(session) = self.store.as_ref().and_then(|store| store.get(inbound.xid)) else {
            debug!("No session for xid={:#010x}, ignoring {:?}", inbound.xid, inbound.reply);
            return false;
        };
        if session.xid() != inbound.xid {
            return false;
        }

        match (inbound.reply, *session.phase()) {
            (Reply::Offer, Phase::Discovering { .. }) => self.on_offer(inbound),
            (Reply::Ack, Phase::Requesting { .. }) => self.on_ack(inbound.xid),
            (Reply::Ack, Phase::Bound { offer, .. }) => {
                debug!(
                    "Lease {} renewed (xid={:#010x})",
                    offer.address, inbound.xid
                );
                true
            }
            (
                Reply::Nak,
                Phase::Discovering { .. } | Phase::Requesting { .. } | Phase::Bound { .. },
            ) => self.on_nak(inbound.xid),
            (reply, phase) => {
                debug!(
                    "Ignoring {:?} for xid={:#010x} in state {:?}",
                    reply,
                    inbound.xid,
                    phase.state()
                );
                false
            }
        }
    }

    /// Runs the work behind a fired timer. Returns whether the timer should stay armed.
    pub fn fire(&mut self, task: TimerTask) -> bool {
        match task.kind {
            TimerKind::DiscoverRetry => self.retry_discover(task.xid),
            TimerKind::RequestResend => self.resend_request(task.xid),
        }
    }

    /// Abandons a negotiation: its timers are cancelled and the session removed.
    pub fn release(&mut self, xid: u32) -> Result<(), LeaseError> {
        if xid == 0 {
            return Err(LeaseError::InvalidTransactionId);
        }
        self.remove_session(xid)?;
        info!("Released lease attempt xid={:#010x}", xid);
        Ok(())
    }

    fn session_mut(&mut self, xid: u32) -> Option<&mut Session> {
        self.store.as_mut()?.get_mut(xid)
    }

    fn on_offer(&mut self, inbound: Inbound) -> bool {
        let xid = inbound.xid;
        if inbound.your_ip.is_unspecified() {
            debug!("Ignoring OFFER without an address (xid={:#010x})", xid);
            return false;
        }
        let offer = Offer {
            address: inbound.your_ip,
            gateway: inbound.gateway_ip,
        };

        let Some(session) = self.store.as_mut().and_then(|store| store.get_mut(xid)) else {
            return false;
        };
        let previous = session.transition(Phase::Requesting { offer, timer: None });
        if let Some(handle) = previous.timer() {
            self.timers.cancel(handle);
        }
        info!(
            "Offered {} via gateway {} (xid={:#010x})",
            offer.address, offer.gateway, xid
        );

        if let Err(e) = self.send(xid, MessageType::Request) {
            warn!("Failed to send REQUEST (xid={:#010x}): {}", xid, e);
        }
        let interval = self.policy.retry_interval;
        let handle = self.timers.add(
            TimerTask {
                xid,
                kind: TimerKind::RequestResend,
            },
            interval,
            interval,
        );

        let name = self.nic.name();
        if let Some(session) = self.store.as_mut().and_then(|store| store.get_mut(xid)) {
            session.set_timer(handle);
            session.notify_offered(name, offer.address);
        }
        true
    }

    fn on_ack(&mut self, xid: u32) -> bool {
        let Some(session) = self.store.as_mut().and_then(|store| store.get_mut(xid)) else {
            return false;
        };
        let Phase::Requesting { offer, timer } = *session.phase() else {
            return false;
        };
        session.transition(Phase::Bound { offer, timer: None });
        if let Some(handle) = timer {
            self.timers.cancel(handle);
        }

        if let Err(e) = self.bind(xid) {
            warn!("Failed to arm lease heartbeat (xid={:#010x}): {}", xid, e);
        }

        let name = self.nic.name();
        if let Some(session) = self.store.as_mut().and_then(|store| store.get_mut(xid)) {
            session.notify_acked(name, offer.address);
        }
        if !self.nic.add_ipv4_address(offer.address) {
            warn!("Could not register {} with {}", offer.address, self.nic.name());
        }
        info!("Bound {} (xid={:#010x})", offer.address, xid);
        true
    }

    fn on_nak(&mut self, xid: u32) -> bool {
        let Some(session) = self.session_mut(xid) else {
            return false;
        };
        let previous = session.unbind();
        if let Some(handle) = previous.timer() {
            self.timers.cancel(handle);
        }
        warn!("Server declined lease (xid={:#010x})", xid);
        true
    }

    /// Arms the periodic REQUEST re-send of a bound session.
    fn bind(&mut self, xid: u32) -> Result<(), LeaseError> {
        let store = self.store.as_mut().ok_or(LeaseError::NoSessionStore)?;
        let session = store.get_mut(xid).ok_or(LeaseError::NoSession { xid })?;
        let interval = self.policy.retry_interval;
        let handle = self.timers.add(
            TimerTask {
                xid,
                kind: TimerKind::RequestResend,
            },
            interval,
            interval,
        );
        session.set_timer(handle);
        Ok(())
    }

    fn retry_discover(&mut self, xid: u32) -> bool {
        let limit = self.policy.discover_limit;
        let Some(session) = self.session_mut(xid) else {
            return false;
        };
        let Phase::Discovering { attempts, .. } = *session.phase() else {
            return false;
        };

        if attempts < limit {
            session.count_discover_attempt();
            debug!(
                "Re-sending DISCOVER, attempt {} of {} (xid={:#010x})",
                attempts + 1,
                limit,
                xid
            );
            if let Err(e) = self.send(xid, MessageType::Discover) {
                warn!("Failed to re-send DISCOVER (xid={:#010x}): {}", xid, e);
            }
            true
        } else {
            warn!("No OFFER after {} retries, giving up (xid={:#010x})", attempts, xid);
            if let Err(e) = self.remove_session(xid) {
                warn!("Failed to drop session xid={:#010x}: {}", xid, e);
            }
            false
        }
    }

    fn resend_request(&mut self, xid: u32) -> bool {
        let Some(session) = self.session(xid) else {
            return false;
        };
        if !matches!(session.phase(), Phase::Requesting { .. } | Phase::Bound { .. }) {
            return false;
        }
        debug!("Re-sending REQUEST (xid={:#010x})", xid);
        if let Err(e) = self.send(xid, MessageType::Request) {
            warn!("Failed to re-send REQUEST (xid={:#010x}): {}", xid, e);
        }
        true
    }

    fn remove_session(&mut self, xid: u32) -> Result<Session, LeaseError> {
        let store = self.store.as_mut().ok_or(LeaseError::NoSessionStore)?;
        let session = store.remove(xid).ok_or(LeaseError::NoSession { xid })?;
        if let Some(handle) = session.phase().timer() {
            self.timers.cancel(handle);
        }
        Ok(session)
    }

    /// Builds and transmits a DISCOVER or REQUEST for session `xid`.
    fn send(&mut self, xid: u32, message_type: MessageType) -> Result<(), LeaseError> {
        if xid == 0 {
            return Err(LeaseError::InvalidTransactionId);
        }
        let store = self.store.as_ref().ok_or(LeaseError::NoSessionStore)?;
        let session = store.get(xid).ok_or(LeaseError::NoSession { xid })?;
        if session.interface().is_none() {
            return Err(LeaseError::NoInterface);
        }

        let mut buf = self
            .nic
            .allocate(FRAME_LEN)
            .ok_or(LeaseError::FrameAllocationFailed { len: FRAME_LEN })?;
        let mac = self.nic.mac_address();
        let len = match message_type {
            MessageType::Discover => frame::build_discover(&mut buf, mac, session)?,
            _ => frame::build_request(&mut buf, mac, session, self.policy.request_source)?,
        };
        buf.truncate(len);

        if !self.nic.transmit(buf) {
            return Err(LeaseError::TransmissionFailed);
        }
        Ok(())
    }
}

impl<N: NetworkInterface> LeaseClient<N, TimerQueue> {
    /// Fires every timer due at `now` and returns how many ran.
    pub fn run_due_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        for (handle, task) in self.timers.due(now) {
            // An earlier callback in this batch may have cancelled it.
            if !self.timers.is_active(handle) {
                continue;
            }
            let keep = self.fire(task);
            self.timers.rearm(handle, keep);
            fired += 1;
        }
        fired
    }
}

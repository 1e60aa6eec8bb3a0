//! One lease negotiation and its callbacks

use crate::timer::TimerHandle;
use std::{any::Any, fmt, net::Ipv4Addr, sync::Arc};

/// Opaque value handed back unchanged to the lease callbacks.
pub type Context = Arc<dyn Any + Send + Sync>;

/// Called with the interface name, transaction ID, leased address and context.
pub type LeaseCallback = Box<dyn FnMut(&str, u32, Ipv4Addr, &Context) + Send>;

pub struct Callbacks {
    pub on_offered: LeaseCallback,
    pub on_acked: LeaseCallback,
}

/// Addresses learned from the server's OFFER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// Where a negotiation stands, together with the one timer that drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// DISCOVER sent; `attempts` counts retries after the first one.
    Discovering {
        attempts: u8,
        timer: Option<TimerHandle>,
    },
    /// REQUEST sent, waiting for ACK or NAK.
    Requesting {
        offer: Offer,
        timer: Option<TimerHandle>,
    },
    /// Address leased; `timer` is the REQUEST heartbeat.
    Bound {
        offer: Offer,
        timer: Option<TimerHandle>,
    },
    /// Rejected by the server. Nothing is sent for this session any more.
    Unbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Discovering,
    Requesting,
    Bound,
    Unbound,
}

impl Phase {
    pub fn state(&self) -> SessionState {
        match self {
            Phase::Discovering { .. } => SessionState::Discovering,
            Phase::Requesting { .. } => SessionState::Requesting,
            Phase::Bound { .. } => SessionState::Bound,
            Phase::Unbound => SessionState::Unbound,
        }
    }

    pub fn offer(&self) -> Option<Offer> {
        match self {
            Phase::Requesting { offer, .. } | Phase::Bound { offer, .. } => Some(*offer),
            Phase::Discovering { .. } | Phase::Unbound => None,
        }
    }

    pub fn timer(&self) -> Option<TimerHandle> {
        match self {
            Phase::Discovering { timer, .. }
            | Phase::Requesting { timer, .. }
            | Phase::Bound { timer, .. } => *timer,
            Phase::Unbound => None,
        }
    }

    fn timer_mut(&mut self) -> Option<&mut Option<TimerHandle>> {
        match self {
            Phase::Discovering { timer, .. }
            | Phase::Requesting { timer, .. }
            | Phase::Bound { timer, .. } => Some(timer),
            Phase::Unbound => None,
        }
    }
}

pub struct Session {
    xid: u32,
    interface: Option<String>,
    phase: Phase,
    callbacks: Option<Callbacks>,
    context: Context,
}

impl Session {
    pub fn new(
        xid: u32,
        interface: impl Into<String>,
        callbacks: Callbacks,
        context: Context,
    ) -> Self {
        Self {
            xid,
            interface: Some(interface.into()),
            phase: Phase::Discovering {
                attempts: 0,
                timer: None,
            },
            callbacks: Some(callbacks),
            context,
        }
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// The interface this session negotiates on; `None` once the server has NAKed it.
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn state(&self) -> SessionState {
        self.phase.state()
    }

    pub fn state_name(&self) -> &'static str {
        match self.state() {
            SessionState::Discovering => "Discovering",
            SessionState::Requesting => "Requesting",
            SessionState::Bound => "Bound",
            SessionState::Unbound => "Unbound",
        }
    }

    /// `0.0.0.0` until an OFFER has been accepted.
    pub fn offered_address(&self) -> Ipv4Addr {
        self.phase
            .offer()
            .map_or(Ipv4Addr::UNSPECIFIED, |offer| offer.address)
    }

    pub fn gateway_address(&self) -> Ipv4Addr {
        self.phase
            .offer()
            .map_or(Ipv4Addr::UNSPECIFIED, |offer| offer.gateway)
    }

    pub fn discover_timer(&self) -> Option<TimerHandle> {
        match self.phase {
            Phase::Discovering { timer, .. } => timer,
            _ => None,
        }
    }

    pub fn request_timer(&self) -> Option<TimerHandle> {
        match self.phase {
            Phase::Requesting { timer, .. } | Phase::Bound { timer, .. } => timer,
            _ => None,
        }
    }

    pub fn has_callbacks(&self) -> bool {
        self.callbacks.is_some()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Moves to `next` and returns the phase left behind, whose timer the caller
    /// still has to cancel.
    pub(crate) fn transition(&mut self, next: Phase) -> Phase {
        std::mem::replace(&mut self.phase, next)
    }

    pub(crate) fn set_timer(&mut self, handle: TimerHandle) {
        if let Some(timer) = self.phase.timer_mut() {
            *timer = Some(handle);
        }
    }

    pub(crate) fn count_discover_attempt(&mut self) {
        if let Phase::Discovering { attempts, .. } = &mut self.phase {
            *attempts = attempts.saturating_add(1);
        }
    }

    /// Drops the interface, callbacks and learned addresses.
    pub(crate) fn unbind(&mut self) -> Phase {
        self.interface = None;
        self.callbacks = None;
        self.transition(Phase::Unbound)
    }

    pub(crate) fn notify_offered(&mut self, interface: &str, address: Ipv4Addr) {
        if let Some(callbacks) = self.callbacks.as_mut() {
            (callbacks.on_offered)(interface, self.xid, address, &self.context);
        }
    }

    pub(crate) fn notify_acked(&mut self, interface: &str, address: Ipv4Addr) {
        if let Some(callbacks) = self.callbacks.as_mut() {
            (callbacks.on_acked)(interface, self.xid, address, &self.context);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("xid", &format_args!("{:#010x}", self.xid))
            .field("interface", &self.interface)
            .field("phase", &self.phase)
            .field("callbacks", &self.callbacks.is_some())
            .finish_non_exhaustive()
    }
}

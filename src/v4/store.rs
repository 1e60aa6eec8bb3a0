//! Per-interface table of in-flight lease negotiations

use super::session::Session;
use rand::Rng as _;
use std::collections::HashMap;

/// Transaction IDs are drawn from `[XID_OFFSET, XID_OFFSET + XID_MODULUS)`,
/// keeping clear of the small values.
const XID_MODULUS: u64 = 0xffff_fffe;
const XID_OFFSET: u64 = 3;

/// Source of raw randomness for transaction IDs.
pub trait Entropy {
    fn next_u64(&mut self) -> u64;
}

/// Draws from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngEntropy;

impl Entropy for ThreadRngEntropy {
    fn next_u64(&mut self) -> u64 {
        rand::rng().random()
    }
}

impl<F: FnMut() -> u64> Entropy for F {
    fn next_u64(&mut self) -> u64 {
        self()
    }
}

/// Sessions of one interface, keyed by transaction ID.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<u32, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks a non-zero transaction ID not used by any session in the store.
    pub fn generate_xid(&self, entropy: &mut dyn Entropy) -> u32 {
        loop {
            // The top of the range wraps to zero, which is redrawn like a collision.
            let xid = ((entropy.next_u64() % XID_MODULUS) + XID_OFFSET) as u32;
            if xid != 0 && !self.sessions.contains_key(&xid) {
                return xid;
            }
            tracing::trace!("Transaction ID {:#010x} unusable, drawing again", xid);
        }
    }

    /// Adds `session` under its own transaction ID, returning any session it replaced.
    pub fn insert(&mut self, session: Session) -> Option<Session> {
        self.sessions.insert(session.xid(), session)
    }

    pub fn get(&self, xid: u32) -> Option<&Session> {
        self.sessions.get(&xid)
    }

    pub fn get_mut(&mut self, xid: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&xid)
    }

    pub fn remove(&mut self, xid: u32) -> Option<Session> {
        self.sessions.remove(&xid)
    }

    pub fn contains(&self, xid: u32) -> bool {
        self.sessions.contains_key(&xid)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub(crate) fn into_sessions(self) -> impl Iterator<Item = Session> {
        self.sessions.into_values()
    }
}

//! Tokio driver for a single interface
//!
//! Owns the [`LeaseClient`] and serializes everything that touches it: received
//! frames, timer ticks and lease notifications all run on the one task polling
//! [`DhcpClient::run`].

use crate::{
    config::ClientConfig,
    error::LeaseError,
    network::{NetworkInterface, RawInterface},
    timer::{Scheduler, TimerQueue},
    v4::{Context, LeaseClient, SessionState},
};
use socket2::Socket;
use std::{
    io::Read as _,
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::mpsc,
    time::{self, MissedTickBehavior},
};

/// Notifications forwarded from the lease callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEvent {
    Offered { xid: u32, address: Ipv4Addr },
    Acked { xid: u32, address: Ipv4Addr },
}

/// A bound lease.
#[derive(Debug, Clone)]
pub struct Lease {
    pub interface: String,
    pub xid: u32,
    pub address: Ipv4Addr,
    pub bound_at: Instant,
}

pub struct DhcpClient {
    config: ClientConfig,
    lease: LeaseClient<RawInterface, TimerQueue>,
}

impl DhcpClient {
    pub async fn new(config: ClientConfig) -> Result<Self, LeaseError> {
        let nic = RawInterface::open(&config.interface, config.mac_address, config.prefix_len)?;
        let mut lease = LeaseClient::new(nic, TimerQueue::new(), config.policy);
        lease.initialize();

        Ok(Self { config, lease })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Acquires a lease and keeps it alive until Ctrl-C.
    ///
    /// A NAKed attempt is replaced by a fresh one. Returns the lease held at
    /// shutdown, or [`LeaseError::RetriesExhausted`] once DISCOVER gives up.
    pub async fn run(&mut self) -> Result<Option<Lease>, LeaseError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<LeaseEvent>();
        let context: Context = Arc::new(tx);
        let socket = self.lease.interface().socket();

        let mut ticker = time::interval(self.config.timer_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 2048];
        let mut lease = None;
        let mut xid = request_lease(&mut self.lease, &context)?;

        loop {
            tokio::select! {
                readable = socket.readable() => {
                    let mut guard = readable?;
                    match guard.try_io(|inner| {
                        let mut sock: &Socket = inner.get_ref();
                        sock.read(&mut buf)
                    }) {
                        Ok(Ok(len)) => {
                            self.lease.handle_inbound(&buf[..len]);
                        }
                        Ok(Err(e)) => {
                            tracing::error!("Socket receive error: {}", e);
                            return Err(LeaseError::Io(e));
                        }
                        Err(_would_block) => continue,
                    }
                }
                _ = ticker.tick() => {
                    self.lease.run_due_timers(Instant::now());
                }
                Some(event) = rx.recv() => {
                    lease = self.on_event(event).or(lease);
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutting down");
                    if let Err(e) = self.lease.release(xid) {
                        tracing::debug!("Nothing to release: {}", e);
                    }
                    return Ok(lease);
                }
            }

            let next = reconcile(&mut self.lease, xid, &context)?;
            if next != xid {
                lease = None;
                xid = next;
            }
        }
    }

    fn on_event(&mut self, event: LeaseEvent) -> Option<Lease> {
        tracing::info!("State: {:?}", event);
        match event {
            LeaseEvent::Offered { .. } => None,
            LeaseEvent::Acked { xid, address } => {
                tracing::info!(
                    "DHCP Bind Successful! {} on {}, renewing every {:?}",
                    address,
                    self.lease.interface().name(),
                    self.retry_interval()
                );
                Some(Lease {
                    interface: self.config.interface.clone(),
                    xid,
                    address,
                    bound_at: Instant::now(),
                })
            }
        }
    }

    fn retry_interval(&self) -> Duration {
        self.lease.policy().retry_interval
    }
}

fn request_lease<N, S>(lease: &mut LeaseClient<N, S>, context: &Context) -> Result<u32, LeaseError>
where
    N: NetworkInterface,
    S: Scheduler,
{
    lease.lease_request(
        |_, xid, address, context| forward(context, LeaseEvent::Offered { xid, address }),
        |_, xid, address, context| forward(context, LeaseEvent::Acked { xid, address }),
        Arc::clone(context),
    )
}

/// Checks on attempt `xid` after the driver has done some work and returns the
/// attempt to follow from now on.
///
/// A declined attempt is released and replaced by a fresh one; an attempt that
/// has left the store ran out of DISCOVER retries.
fn reconcile<N, S>(
    lease: &mut LeaseClient<N, S>,
    xid: u32,
    context: &Context,
) -> Result<u32, LeaseError>
where
    N: NetworkInterface,
    S: Scheduler,
{
    match lease.session(xid).map(|session| session.state()) {
        None => Err(LeaseError::RetriesExhausted { xid }),
        Some(SessionState::Unbound) => {
            tracing::warn!("Lease attempt {:#010x} was declined, starting over", xid);
            lease.release(xid)?;
            request_lease(lease, context)
        }
        Some(_) => Ok(xid),
    }
}

fn forward(context: &Context, event: LeaseEvent) {
    if let Some(tx) = context.downcast_ref::<mpsc::UnboundedSender<LeaseEvent>>() {
        // The receiver only goes away together with the driver.
        let _ = tx.send(event);
    }
}

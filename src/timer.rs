//! Periodic timers for the lease state machine
//!
//! Timer callbacks are not closures: each timer carries a [`TimerTask`] naming the
//! session and the kind of work, and the owner of the queue dispatches it.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// Opaque handle returned when a timer is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Re-broadcast DISCOVER until an OFFER shows up or attempts run out.
    DiscoverRetry,
    /// Re-send REQUEST while waiting for an ACK, then as the bound-state heartbeat.
    RequestResend,
}

/// What to do when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerTask {
    pub xid: u32,
    pub kind: TimerKind,
}

/// The timer subsystem the state machine schedules against.
pub trait Scheduler {
    /// Registers a timer first firing after `delay` and then every `interval`.
    fn add(&mut self, task: TimerTask, delay: Duration, interval: Duration) -> TimerHandle;

    /// Stops a timer. Returns `false` if it had already fired for good or been cancelled.
    fn cancel(&mut self, handle: TimerHandle) -> bool;
}

#[derive(Debug)]
struct Entry {
    task: TimerTask,
    deadline: Instant,
    interval: Duration,
}

/// A clock-driven timer queue.
///
/// The queue never reads the clock on its own after construction; callers feed it
/// the current time through [`TimerQueue::due`].
#[derive(Debug)]
pub struct TimerQueue {
    now: Instant,
    next_handle: u64,
    entries: HashMap<TimerHandle, Entry>,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            now,
            next_handle: 1,
            entries: HashMap::new(),
        }
    }

    /// The last time the queue was advanced to.
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn is_active(&self, handle: TimerHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Advances the clock and returns every timer whose deadline has passed,
    /// earliest first.
    ///
    /// Returned timers stay registered until [`TimerQueue::rearm`] decides their fate.
    pub fn due(&mut self, now: Instant) -> Vec<(TimerHandle, TimerTask)> {
        self.now = self.now.max(now);
        let mut due: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= self.now)
            .map(|(handle, entry)| (entry.deadline, *handle, entry.task))
            .collect();
        due.sort_by_key(|(deadline, handle, _)| (*deadline, *handle));
        due.into_iter().map(|(_, handle, task)| (handle, task)).collect()
    }

    /// Completes a firing: reschedules one interval later when `keep` is set,
    /// otherwise drops the timer. A timer cancelled by its own callback stays gone.
    pub fn rearm(&mut self, handle: TimerHandle, keep: bool) {
        if !keep {
            self.entries.remove(&handle);
            return;
        }
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.deadline += entry.interval;
            if entry.deadline <= self.now {
                // Skip missed periods instead of firing in a burst.
                entry.deadline = self.now + entry.interval;
            }
        }
    }
}

impl Scheduler for TimerQueue {
    fn add(&mut self, task: TimerTask, delay: Duration, interval: Duration) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.insert(
            handle,
            Entry {
                task,
                deadline: self.now + delay,
                interval,
            },
        );
        tracing::trace!("Timer {:?} armed for {:?}", handle, task);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.entries.remove(&handle).is_some()
    }
}

// vim: tw=80
//! The State Waiter
//!
//! Polls the gateway until the storage service reports a target condition, or
//! until a timeout elapses.  Polling is an explicit state machine driven by an
//! injectable [`Clock`], so tests can run it without sleeping.

use std::{
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    gateway::{array, system, Gateway, Request},
    types::{ArrayCondition, Error, Result},
};

/// The default delay between successive polls
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A source of time for the State Waiter
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// The real, monotonic clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }
}

/// A clock that only moves when told to.  Sleeping advances it instantly.
#[derive(Debug)]
pub struct ManualClock {
    base:    Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock().unwrap() += duration;
    }

    /// Total time advanced since creation
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap()
    }

    pub fn new() -> Self {
        ManualClock {
            base:    Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitState {
    Polling,
    Observed,
    TimedOut,
}

/// One wait in progress.
///
/// Each [`step`](Poll::step) probes once.  If the probe fails and time
/// remains, it then sleeps until the next poll is due.  A final probe is
/// always made at the deadline itself.  A timeout too large to represent as
/// an `Instant` means there is no deadline.
pub struct Poll<'c, P> {
    clock:    &'c dyn Clock,
    probe:    P,
    interval: Duration,
    start:    Instant,
    deadline: Option<Instant>,
    polls:    u32,
    state:    WaitState,
}

impl<'c, P: FnMut() -> bool> Poll<'c, P> {
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.start)
    }

    /// How many times has the probe been run?
    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Poll until the wait reaches a final state.
    pub fn run(&mut self) -> WaitState {
        loop {
            let state = self.step();
            if state != WaitState::Polling {
                break state;
            }
        }
    }

    pub fn state(&self) -> WaitState {
        self.state
    }

    pub fn step(&mut self) -> WaitState {
        if self.state != WaitState::Polling {
            return self.state;
        }
        self.polls += 1;
        if (self.probe)() {
            self.state = WaitState::Observed;
        } else {
            let now = self.clock.now();
            match self.deadline {
                Some(deadline) if now >= deadline => {
                    self.state = WaitState::TimedOut;
                }
                Some(deadline) => {
                    self.clock.sleep(self.interval.min(deadline - now));
                }
                None => self.clock.sleep(self.interval)
            }
        }
        self.state
    }
}

/// Waits for the storage service to reach some condition.
#[derive(Clone, Copy)]
pub struct StateWaiter<'a> {
    gateway:  &'a dyn Gateway,
    clock:    &'a dyn Clock,
    interval: Duration,
}

impl<'a> StateWaiter<'a> {
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn new(gateway: &'a dyn Gateway, clock: &'a dyn Clock) -> Self {
        StateWaiter { gateway, clock, interval: POLL_INTERVAL }
    }

    /// Begin polling `probe`, giving up once `timeout` has elapsed.
    pub fn poll<P>(&self, timeout: Duration, probe: P) -> Poll<'a, P>
        where P: FnMut() -> bool
    {
        let start = self.clock.now();
        Poll {
            clock: self.clock,
            probe,
            interval: self.interval,
            start,
            deadline: start.checked_add(timeout),
            polls: 0,
            state: WaitState::Polling,
        }
    }

    /// Issue `query` repeatedly until its response reports `target`.
    ///
    /// Returns false if `target` was never seen within `timeout`.  Gateway
    /// errors and failed queries along the way merely count as "not yet".
    pub fn wait_for(&self, query: &Request, target: &ArrayCondition,
                    timeout: Duration) -> bool
    {
        let probe = || match self.gateway.call(query) {
            Ok(resp) if resp.is_success() => {
                debug!(request = query.label(), situation = ?resp.situation,
                       "poll");
                resp.condition().as_ref() == Some(target)
            }
            Ok(resp) => {
                warn!(request = query.label(), code = resp.code,
                      "status query failed; retrying");
                false
            }
            Err(e) => {
                warn!(request = query.label(), error = %e,
                      "status query failed; retrying");
                false
            }
        };
        let mut poll = self.poll(timeout, probe);
        let observed = poll.run() == WaitState::Observed;
        if observed {
            info!(%target, polls = poll.polls(), "condition observed");
        } else {
            warn!(%target, elapsed = ?poll.elapsed(), "condition not observed");
        }
        observed
    }

    /// Wait for the named array to reach `target`.
    pub fn wait_for_array(&self, array: &str, target: &ArrayCondition,
                          timeout: Duration) -> bool
    {
        self.wait_for(&array::info(array), target, timeout)
    }

    /// Like [`wait_for`](Self::wait_for), but a timeout is an error.
    pub fn wait_until(&self, query: &Request, target: ArrayCondition,
                      timeout: Duration) -> Result<()>
    {
        let start = self.clock.now();
        if self.wait_for(query, &target, timeout) {
            Ok(())
        } else {
            let elapsed = self.clock.now().saturating_duration_since(start);
            Err(Error::Timeout { target, elapsed })
        }
    }

    /// Wait until the service answers a system query at all.
    pub fn wait_responsive(&self, timeout: Duration) -> bool {
        let req = system::info();
        self.poll(timeout, || {
            matches!(self.gateway.call(&req), Ok(resp) if resp.is_success())
        }).run() == WaitState::Observed
    }
}

//! Blocking primitives: timeouts, counting semaphores and the retry pacer

use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;

/// Upper bound on a blocking call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Block until the condition is met
    Infinite,
    /// Give up after the duration has elapsed
    After(Duration),
}

impl Timeout {
    /// Fail immediately if the operation cannot complete
    pub const ZERO: Timeout = Timeout::After(Duration::ZERO);

    pub const fn millis(ms: u64) -> Self {
        Timeout::After(Duration::from_millis(ms))
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Timeout::After(d) if d.is_zero())
    }

    /// Whether more than the allowed time has passed since `start`
    pub fn expired(&self, start: Instant) -> bool {
        match self {
            Timeout::Infinite => false,
            Timeout::After(limit) => start.elapsed() >= *limit,
        }
    }

    /// Time left relative to `start`; `None` when infinite
    pub fn remaining(&self, start: Instant) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::After(limit) => Some(limit.saturating_sub(start.elapsed())),
        }
    }

    /// The longer of this timeout and `floor`
    pub fn at_least(self, floor: Duration) -> Self {
        match self {
            Timeout::Infinite => Timeout::Infinite,
            Timeout::After(limit) => Timeout::After(limit.max(floor)),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

/// Counting semaphore
pub struct Semaphore {
    count: Mutex<u32>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Add one permit and wake a waiter. Never blocks for long; callable from
    /// the interrupt path.
    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_add(1);
        self.available.notify_one();
    }

    /// Take one permit, blocking up to `timeout`. Returns `false` on timeout.
    pub fn wait(&self, timeout: Timeout) -> bool {
        let start = Instant::now();
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            count = match timeout.remaining(start) {
                None => self
                    .available
                    .wait(count)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(left) if left.is_zero() => return false,
                Some(left) => {
                    self.available
                        .wait_timeout(count, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Permits currently available
    pub fn permits(&self) -> u32 {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Paces a retry loop: snooze for the poll quantum, then sleep in steps.
pub(crate) struct Pacer {
    start: Instant,
    poll_time: Duration,
    sleep_step: Duration,
    backoff: Backoff,
}

impl Pacer {
    pub(crate) fn new(poll_time: Duration, sleep_step: Duration) -> Self {
        Self {
            start: Instant::now(),
            poll_time,
            sleep_step,
            backoff: Backoff::new(),
        }
    }

    pub(crate) fn start(&self) -> Instant {
        self.start
    }

    pub(crate) fn pause(&self) {
        if self.start.elapsed() > self.poll_time {
            thread::sleep(self.sleep_step);
        } else {
            self.backoff.snooze();
        }
    }
}

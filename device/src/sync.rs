//! Timeline signals for ordering host observation after stream work.
//!
//! A timeline signal is a monotonically increasing counter. The CPU stream
//! worker advances it as submissions finish; host threads block on it until
//! the ticket they care about has been reached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TimeoutSnafu};

/// Completion counter of one stream. Ticket `n` is done once the value is `>= n`.
pub trait TimelineSignal: Send + Sync + std::fmt::Debug {
    /// Highest completed ticket.
    fn value(&self) -> u64;

    /// Advance the signal to `value`. Lower values are ignored.
    fn set(&self, value: u64);

    /// Block until the signal reaches `value`, or until `timeout` elapses.
    ///
    /// `None` waits forever.
    fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<()>;

    fn is_reached(&self, value: u64) -> bool {
        self.value() >= value
    }
}

/// Signal advanced by the CPU stream worker.
#[derive(Debug)]
pub struct CpuTimelineSignal {
    value: AtomicU64,
    parked: Mutex<()>,
    condvar: Condvar,
}

impl Default for CpuTimelineSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuTimelineSignal {
    pub fn new() -> Self {
        Self::with_initial(0)
    }

    pub fn with_initial(initial: u64) -> Self {
        Self { value: AtomicU64::new(initial), parked: Mutex::new(()), condvar: Condvar::new() }
    }
}

impl TimelineSignal for CpuTimelineSignal {
    fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn set(&self, value: u64) {
        // Taking the lock closes the window between a waiter's check and its park.
        let _guard = self.parked.lock();
        self.value.fetch_max(value, Ordering::AcqRel);
        self.condvar.notify_all();
    }

    fn wait(&self, target: u64, timeout: Option<Duration>) -> Result<()> {
        if self.value() >= target {
            return Ok(());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.parked.lock();
        while self.value() < target {
            match deadline {
                None => self.condvar.wait(&mut guard),
                Some(deadline) => {
                    if self.condvar.wait_until(&mut guard, deadline).timed_out() && self.value() < target {
                        let waited_ms = timeout.map_or(0, |t| t.as_millis() as u64);
                        return TimeoutSnafu { ticket: target, completed: self.value(), waited_ms }.fail();
                    }
                }
            }
        }
        Ok(())
    }
}

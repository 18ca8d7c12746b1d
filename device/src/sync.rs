//! Timeline signals used to observe queue completion.
//!
//! A timeline signal is a monotonically increasing counter. Producers set it
//! to the sequence number of the last finished operation; consumers block until
//! it reaches the value they care about.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TimeoutSnafu};

pub trait TimelineSignal: Send + Sync + std::fmt::Debug {
    fn value(&self) -> u64;

    /// Advance the signal. Values lower than the current one are ignored.
    fn set(&self, value: u64);

    /// Block until the signal reaches `target`. `timeout_ms == 0` waits forever.
    fn wait(&self, target: u64, timeout_ms: u64) -> Result<()>;

    fn is_reached(&self, value: u64) -> bool {
        self.value() >= value
    }
}

/// Host-side signal built on an atomic counter and a condvar.
#[derive(Debug, Default)]
pub struct CpuTimelineSignal {
    value: AtomicU64,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl CpuTimelineSignal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimelineSignal for CpuTimelineSignal {
    fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn set(&self, value: u64) {
        // Taking the mutex orders the store against a waiter that is between its check and its park.
        let _guard = self.mutex.lock();
        self.value.fetch_max(value, Ordering::AcqRel);
        self.condvar.notify_all();
    }

    fn wait(&self, target: u64, timeout_ms: u64) -> Result<()> {
        if self.is_reached(target) {
            return Ok(());
        }

        let mut guard = self.mutex.lock();
        if timeout_ms == 0 {
            while !self.is_reached(target) {
                self.condvar.wait(&mut guard);
            }
            return Ok(());
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while !self.is_reached(target) {
            if self.condvar.wait_until(&mut guard, deadline).timed_out() && !self.is_reached(target) {
                return TimeoutSnafu { target, current: self.value(), timeout_ms }.fail();
            }
        }
        Ok(())
    }
}

//! Stage wake-up primitive.
//!
//! Each pipeline stage thread parks on its own [`Wake`] between polls and is
//! nudged whenever a peer changes something it cares about (space freed,
//! bytes arrived, a control request landed). Signals coalesce: any number of
//! `signal` calls before the next wait produce a single wake.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    TimedOut,
}

#[derive(Default)]
pub struct Wake {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Wake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nudge the waiting thread. Cheap and callable from any thread; a
    /// signal with no waiter is remembered until the next wait.
    pub fn signal(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.cond.notify_one();
    }

    /// Park until signalled or `timeout` elapses. Consumes the pending flag.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitOutcome {
        let mut pending = self.pending.lock().unwrap();
        if !*pending {
            let (guard, res) = self
                .cond
                .wait_timeout_while(pending, timeout, |p| !*p)
                .unwrap();
            pending = guard;
            if res.timed_out() && !*pending {
                return WaitOutcome::TimedOut;
            }
        }
        *pending = false;
        WaitOutcome::Woken
    }
}

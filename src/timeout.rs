//! Timeout guard
//!
//! Arms an unreferenced delay that fails the test if the body has not settled
//! in time. At most one timeout is armed per test; arming a new one cancels
//! the previous.

use crate::config::TRACE_WATCHERS_ENV;
use crate::event_loop::{Handle, WatcherId};
use crate::failure::TestFailure;
use crate::sentinel::SentinelSwitch;
use crate::signal::CompletionSignal;
use std::cell::Cell;
use std::panic::Location;
use std::time::Duration;

/// Owner of the timeout registration of one test
pub struct TimeoutGuard {
    handle: Handle,
    signal: CompletionSignal,
    sentinel: SentinelSwitch,
    trace_watchers: bool,
    current: Cell<Option<WatcherId>>,
}

impl TimeoutGuard {
    /// Create a guard that settles `signal` when a timeout fires
    pub fn new(
        handle: Handle,
        signal: CompletionSignal,
        sentinel: SentinelSwitch,
        trace_watchers: bool,
    ) -> Self {
        Self {
            handle,
            signal,
            sentinel,
            trace_watchers,
            current: Cell::new(None),
        }
    }

    /// Fail the test if it has not settled after `limit`, replacing any armed timeout
    #[track_caller]
    pub fn arm(&self, limit: Duration) -> WatcherId {
        self.cancel();

        let signal = self.signal.clone();
        let sentinel = self.sentinel.clone();
        let trace_watchers = self.trace_watchers;

        let id = self.handle.delay_at(limit, Location::caller(), move |handle, _| {
            sentinel.disable();

            let additional_info = if trace_watchers {
                format!("\n\n{}", handle.dump())
            } else {
                format!(
                    "\n\nSet {}=true as environment variable to trace watchers keeping the loop running.",
                    TRACE_WATCHERS_ENV
                )
            };

            if signal.settle(Err(TestFailure::TimeoutExceeded {
                limit,
                additional_info,
            })) {
                log::debug!("Test timed out after {:?}", limit);
                handle.stop();
            }
            Ok(())
        });

        // the timeout must not keep an otherwise finished loop alive
        if let Err(e) = self.handle.unreference(id) {
            log::warn!("Failed to unreference timeout watcher {}: {}", id, e);
        }

        self.current.set(Some(id));
        id
    }

    /// Cancel the armed timeout, if any
    pub fn cancel(&self) {
        if let Some(id) = self.current.take() {
            self.handle.cancel(id);
        }
    }

    /// Whether a timeout is armed
    pub fn is_armed(&self) -> bool {
        self.current
            .get()
            .map_or(false, |id| self.handle.watchers().iter().any(|w| w.id == id))
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

//! Loop error sentinel
//!
//! Routes errors that escape loop callbacks and detached tasks into the
//! completion signal the driver waits on.

use crate::event_loop::{ErrorHandler, Handle};
use crate::failure::{LoopCaughtError, TestFailure};
use crate::signal::CompletionSignal;
use crate::thrown::Thrown;
use std::cell::Cell;
use std::rc::Rc;

/// Error handler installed for the duration of one test.
///
/// Dropping the sentinel restores the handler it replaced.
pub struct LoopErrorSentinel {
    handle: Handle,
    switch: SentinelSwitch,
    previous: Option<ErrorHandler>,
}

/// Turns a [`LoopErrorSentinel`] off without uninstalling it
#[derive(Debug, Clone, Default)]
pub struct SentinelSwitch {
    disabled: Rc<Cell<bool>>,
}

impl SentinelSwitch {
    /// Drop every error intercepted from now on
    pub fn disable(&self) {
        self.disabled.set(true);
    }

    /// Whether intercepted errors are dropped
    pub fn is_disabled(&self) -> bool {
        self.disabled.get()
    }
}

impl LoopErrorSentinel {
    /// Install the sentinel on `handle`, settling `signal` with intercepted errors
    pub fn install(handle: &Handle, signal: CompletionSignal) -> Self {
        let switch = SentinelSwitch::default();
        let handler = {
            let switch = switch.clone();
            let handle = handle.clone();
            Box::new(move |thrown: Thrown| intercept(&handle, &signal, &switch, thrown))
        };

        let previous = handle.set_error_handler(Some(handler));
        Self {
            handle: handle.clone(),
            switch,
            previous,
        }
    }

    /// Switch controlling this sentinel
    pub fn switch(&self) -> SentinelSwitch {
        self.switch.clone()
    }
}

impl Drop for LoopErrorSentinel {
    fn drop(&mut self) {
        let ours = self.handle.set_error_handler(self.previous.take());
        drop(ours);
    }
}

fn intercept(handle: &Handle, signal: &CompletionSignal, switch: &SentinelSwitch, thrown: Thrown) {
    if switch.is_disabled() || signal.is_settled() {
        log::warn!("Dropping error thrown to event loop after the test settled: {}", thrown);
        return;
    }

    log::debug!("Event loop error handler caught {}", thrown);
    // assertion failures pass through unwrapped
    let failure = if thrown.is_panic() {
        TestFailure::from_body(thrown)
    } else {
        TestFailure::LoopCaught(LoopCaughtError::new(thrown))
    };
    if signal.settle(Err(failure)) {
        handle.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::thrown::TestException;
    use std::time::Duration;

    #[test]
    fn test_error_settles_signal_and_stops_loop() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let (signal, mut receiver) = CompletionSignal::new();
        let _sentinel = LoopErrorSentinel::install(handle, signal);

        handle.defer(|_, _| Err(TestException::new("detached").into()));
        handle.delay(Duration::from_secs(60), |_, _| Ok(()));

        event_loop.run().unwrap();
        let failure = receiver.take().unwrap().unwrap_err();
        assert_eq!(
            failure.to_string(),
            "loop_test::thrown::TestException thrown to event loop error handler: detached"
        );
    }

    #[test]
    fn test_panic_settles_as_assertion() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let (signal, mut receiver) = CompletionSignal::new();
        let _sentinel = LoopErrorSentinel::install(handle, signal);

        handle.defer(|_, _| crate::thrown::fail("assertion from callback"));
        handle.delay(Duration::from_secs(60), |_, _| Ok(()));

        event_loop.run().unwrap();
        let failure = receiver.take().unwrap().unwrap_err();
        assert!(matches!(failure, TestFailure::Assertion { .. }));
        assert_eq!(failure.to_string(), "assertion from callback");
    }

    #[test]
    fn test_error_after_settlement_is_dropped() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let (signal, mut receiver) = CompletionSignal::new();
        let _sentinel = LoopErrorSentinel::install(handle, signal.clone());

        signal.settle(Ok(()));
        handle.defer(|_, _| Err(TestException::new("late").into()));

        assert!(event_loop.run().is_ok());
        assert!(matches!(receiver.take(), Some(Ok(()))));
    }

    #[test]
    fn test_disabled_switch_drops_errors() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let (signal, mut receiver) = CompletionSignal::new();
        let sentinel = LoopErrorSentinel::install(handle, signal);

        sentinel.switch().disable();
        handle.defer(|_, _| panic!("ignored"));

        assert!(event_loop.run().is_ok());
        assert!(receiver.take().is_none());
    }

    #[test]
    fn test_drop_restores_previous_handler() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let seen = Rc::new(Cell::new(0));

        let s = Rc::clone(&seen);
        handle.set_error_handler(Some(Box::new(move |_: Thrown| s.set(s.get() + 1))));

        let (signal, _receiver) = CompletionSignal::new();
        drop(LoopErrorSentinel::install(handle, signal));

        handle.defer(|_, _| panic!("after restore"));
        event_loop.run().unwrap();
        assert_eq!(seen.get(), 1);
    }
}

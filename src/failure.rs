//! Test failures
//!
//! Every way a test can fail ends up as one [`TestFailure`]. Its `Display`
//! output is the message the test runner shows.

use crate::event_loop::LoopInfo;
use crate::thrown::Thrown;
use crate::timing::format_duration;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a failed test
#[derive(Error, Debug)]
pub enum TestFailure {
    /// A fixture overrode `set_up` without calling [`TestCase::set_up`](crate::TestCase::set_up)
    #[error("{fixture}::set_up() overrides TestCase::set_up() without calling the parent method")]
    SetupContractViolation {
        /// Sanitized type name of the fixture
        fixture: String,
    },

    /// The body panicked or called [`fail`](crate::fail)
    #[error("{message}")]
    Assertion {
        /// Panic message
        message: String,
    },

    /// The body returned its own error
    #[error("{0}")]
    Thrown(Thrown),

    /// An error escaped a detached callback or task before the body settled
    #[error("{0}")]
    LoopCaught(LoopCaughtError),

    /// The timeout fired before the body settled
    #[error("Expected test to complete before {} time limit{additional_info}", format_duration(.limit))]
    TimeoutExceeded {
        /// Timeout that was armed
        limit: Duration,
        /// Watcher dump or a hint on how to enable one
        additional_info: String,
    },

    /// The body settled faster than the configured minimum
    #[error("Expected test to take at least {} but instead took {}", format_duration(.required), format_duration(.actual))]
    RuntimeTooShort {
        /// Configured minimum runtime
        required: Duration,
        /// Measured runtime
        actual: Duration,
    },

    /// Watchers were still pending when the test ended
    #[error("Found enabled watchers at end of test '{test}': {snapshot}{trace}")]
    LeakedWatchers {
        /// Name of the test
        test: String,
        /// Pending watchers
        snapshot: LoopInfo,
        /// Watcher dump when tracing is enabled, else empty
        trace: String,
    },

    /// A callback stub was invoked the wrong number of times or with wrong arguments
    #[error("{message}")]
    StubExpectation {
        /// Description of the unmet expectation
        message: String,
    },

    /// The loop ran out of work with the body still pending
    #[error("Loop stopped without resolving promise or coroutine returned from test method")]
    LoopStopped,
}

impl TestFailure {
    /// Convert an error raised by the body.
    ///
    /// Panics are the host framework's assertion failures and pass through as
    /// [`TestFailure::Assertion`]; any other error is kept as is.
    pub fn from_body(thrown: Thrown) -> Self {
        if thrown.is_panic() {
            TestFailure::Assertion {
                message: thrown.message().to_string(),
            }
        } else {
            TestFailure::Thrown(thrown)
        }
    }

    /// Whether this failure is an assertion failure rather than a raised error
    pub fn is_assertion_failure(&self) -> bool {
        !matches!(self, TestFailure::Thrown(_) | TestFailure::LoopCaught(_))
    }

    /// The error raised by the body or intercepted from the loop, if any
    pub fn thrown(&self) -> Option<&Thrown> {
        match self {
            TestFailure::Thrown(thrown) => Some(thrown),
            TestFailure::LoopCaught(caught) => Some(caught.original()),
            _ => None,
        }
    }

    /// Fail the surrounding `#[test]` with this failure's message
    #[track_caller]
    pub fn raise(self) -> ! {
        panic!("{}", self)
    }
}

/// Error intercepted by the loop error handler while a test was running
#[derive(Debug)]
pub struct LoopCaughtError {
    original: Thrown,
}

impl LoopCaughtError {
    /// Wrap an intercepted error
    pub fn new(original: Thrown) -> Self {
        Self { original }
    }

    /// The error that escaped to the loop
    pub fn original(&self) -> &Thrown {
        &self.original
    }

    /// Take the error that escaped to the loop
    pub fn into_original(self) -> Thrown {
        self.original
    }
}

impl fmt::Display for LoopCaughtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} thrown to event loop error handler: {}",
            self.original.type_name(),
            self.original.message()
        )
    }
}

impl std::error::Error for LoopCaughtError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thrown::TestException;

    #[test]
    fn test_loop_caught_message_format() {
        let failure = TestFailure::LoopCaught(LoopCaughtError::new(Thrown::custom("Anon\0class", "message")));
        assert_eq!(
            failure.to_string(),
            "Anon@class thrown to event loop error handler: message"
        );
        assert!(!failure.is_assertion_failure());
    }

    #[test]
    fn test_timeout_message() {
        let failure = TestFailure::TimeoutExceeded {
            limit: Duration::from_millis(100),
            additional_info: String::new(),
        };
        assert_eq!(failure.to_string(), "Expected test to complete before 100ms time limit");
        assert!(failure.is_assertion_failure());
    }

    #[test]
    fn test_runtime_message() {
        let failure = TestFailure::RuntimeTooShort {
            required: Duration::from_millis(100),
            actual: Duration::from_micros(75_250),
        };
        assert_eq!(
            failure.to_string(),
            "Expected test to take at least 100ms but instead took 75.25ms"
        );
    }

    #[test]
    fn test_from_body_keeps_errors_as_is() {
        let failure = TestFailure::from_body(Thrown::from(TestException::new("business")));
        assert!(matches!(failure, TestFailure::Thrown(_)));
        assert!(failure.thrown().unwrap().is::<TestException>());

        let failure = TestFailure::from_body(Thrown::from_panic(Box::new("assert failed")));
        assert!(matches!(failure, TestFailure::Assertion { ref message } if message == "assert failed"));
    }
}

//! Call-counting callback stubs

use crate::failure::TestFailure;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::Location;
use std::rc::Rc;

type ReturnCallback<A, R> = Box<dyn Fn(&A) -> R>;

/// Callback that must be invoked exactly a given number of times.
///
/// Clones share their call count. Expectations are checked by
/// [`CallbackStub::verify`], which the driver calls after the test body
/// settled for every stub created through
/// [`TestContext::create_callback`](crate::TestContext::create_callback).
pub struct CallbackStub<A = (), R = ()> {
    inner: Rc<StubState<A, R>>,
}

struct StubState<A, R> {
    created_at: &'static Location<'static>,
    expected_calls: usize,
    calls: Cell<usize>,
    expected_args: Option<A>,
    mismatch: RefCell<Option<String>>,
    returns: Option<ReturnCallback<A, R>>,
}

impl<A, R> Clone for CallbackStub<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A, R> CallbackStub<A, R>
where
    A: fmt::Debug + PartialEq + 'static,
    R: Default + 'static,
{
    /// Stub expecting `expected_calls` invocations
    #[track_caller]
    pub fn new(expected_calls: usize) -> Self {
        Self::build(expected_calls, None, None, Location::caller())
    }

    /// Stub answering each invocation with `returns(&args)`
    #[track_caller]
    pub fn returning<F>(expected_calls: usize, returns: F) -> Self
    where
        F: Fn(&A) -> R + 'static,
    {
        Self::build(expected_calls, Some(Box::new(returns)), None, Location::caller())
    }

    /// Stub that also requires every invocation to receive `args`
    #[track_caller]
    pub fn with_args(expected_calls: usize, args: A) -> Self {
        Self::build(expected_calls, None, Some(args), Location::caller())
    }

    pub(crate) fn build(
        expected_calls: usize,
        returns: Option<ReturnCallback<A, R>>,
        expected_args: Option<A>,
        created_at: &'static Location<'static>,
    ) -> Self {
        Self {
            inner: Rc::new(StubState {
                created_at,
                expected_calls,
                calls: Cell::new(0),
                expected_args,
                mismatch: RefCell::new(None),
                returns,
            }),
        }
    }

    /// Invoke the stub
    pub fn call(&self, args: A) -> R {
        let state = &self.inner;
        state.calls.set(state.calls.get() + 1);

        if let Some(expected) = &state.expected_args {
            if *expected != args {
                let mut mismatch = state.mismatch.borrow_mut();
                if mismatch.is_none() {
                    *mismatch = Some(format!(
                        "Expectation failed for callback created at {}: invocation {} received {:?}, expected {:?}",
                        state.created_at,
                        state.calls.get(),
                        args,
                        expected
                    ));
                }
            }
        }

        match &state.returns {
            Some(returns) => returns(&args),
            None => R::default(),
        }
    }

    /// Number of invocations so far
    pub fn calls(&self) -> usize {
        self.inner.calls.get()
    }

    /// Check the call count and arguments
    pub fn verify(&self) -> Result<(), TestFailure> {
        self.inner.verify()
    }

    pub(crate) fn expectation(&self) -> Rc<dyn Expectation> {
        self.inner.clone()
    }
}

/// An expectation checked once the test body settled
pub(crate) trait Expectation {
    fn verify(&self) -> Result<(), TestFailure>;
}

impl<A, R> Expectation for StubState<A, R> {
    fn verify(&self) -> Result<(), TestFailure> {
        if let Some(message) = self.mismatch.borrow().clone() {
            return Err(TestFailure::StubExpectation { message });
        }

        let calls = self.calls.get();
        if calls != self.expected_calls {
            return Err(TestFailure::StubExpectation {
                message: format!(
                    "Expectation failed for callback created at {} when invoked {} time(s).\n\
                     Callback was expected to be called {} times, actually called {} times.",
                    self.created_at, self.expected_calls, self.expected_calls, calls
                ),
            });
        }

        Ok(())
    }
}

impl<A, R> fmt::Debug for CallbackStub<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackStub")
            .field("created_at", &self.inner.created_at)
            .field("expected_calls", &self.inner.expected_calls)
            .field("calls", &self.inner.calls.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_count_passes() {
        let stub: CallbackStub = CallbackStub::new(2);
        stub.call(());
        stub.clone().call(());
        assert_eq!(stub.calls(), 2);
        assert!(stub.verify().is_ok());
    }

    #[test]
    fn test_wrong_count_fails() {
        let stub: CallbackStub = CallbackStub::new(1);
        let message = stub.verify().unwrap_err().to_string();
        assert!(message.contains("expected to be called 1 times, actually called 0 times"));
        assert!(message.contains("stub.rs"));
    }

    #[test]
    fn test_return_callback_answers() {
        let stub = CallbackStub::returning(1, |x: &i32| x * 2);
        assert_eq!(stub.call(21), 42);
        assert!(stub.verify().is_ok());
    }

    #[test]
    fn test_unexpected_arguments_fail() {
        let stub: CallbackStub<(&str, i32)> = CallbackStub::with_args(2, ("a", 1));
        stub.call(("a", 1));
        stub.call(("b", 2));

        let message = stub.verify().unwrap_err().to_string();
        assert!(message.contains("invocation 2 received (\"b\", 2), expected (\"a\", 1)"));
    }
}

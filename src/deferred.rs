//! Deferred values and checkpoints
//!
//! Helpers for bodies that hand back a promise and resolve it from loop
//! callbacks, or that must see a number of asynchronous steps happen.
//!
//! ```
//! use futures::executor::block_on;
//! use loop_test::Checkpoints;
//!
//! let checkpoints = Checkpoints::new(2);
//! let promise = checkpoints.promise();
//! checkpoints.checkpoint();
//! checkpoints.checkpoint();
//! assert!(block_on(promise).is_ok());
//! ```

use crate::error::Error;
use crate::thrown::Thrown;
use futures::channel::oneshot;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Producer side of a [`Promise`]
pub struct Deferred<T> {
    inner: Rc<DeferredState<T>>,
}

struct DeferredState<T> {
    sender: RefCell<Option<oneshot::Sender<Result<T, Thrown>>>>,
    receiver: RefCell<Option<oneshot::Receiver<Result<T, Thrown>>>>,
}

/// Future resolving with the value or error given to its [`Deferred`]
pub struct Promise<T> {
    receiver: Option<oneshot::Receiver<Result<T, Thrown>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deferred<T> {
    /// Create an unresolved deferred
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            inner: Rc::new(DeferredState {
                sender: RefCell::new(Some(sender)),
                receiver: RefCell::new(Some(receiver)),
            }),
        }
    }

    /// The promise of this deferred. Only the first call gets a live promise;
    /// later ones fail with [`Error::PromiseTaken`].
    pub fn promise(&self) -> Promise<T> {
        Promise {
            receiver: self.inner.receiver.borrow_mut().take(),
        }
    }

    /// Resolve the promise with `value`; returns `false` if already settled
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Fail the promise with `error`; returns `false` if already settled
    pub fn fail(&self, error: impl Into<Thrown>) -> bool {
        self.settle(Err(error.into()))
    }

    /// Whether the promise was resolved or failed
    pub fn is_settled(&self) -> bool {
        self.inner.sender.borrow().is_none()
    }

    fn settle(&self, result: Result<T, Thrown>) -> bool {
        let Some(sender) = self.inner.sender.borrow_mut().take() else {
            return false;
        };
        // nobody waiting is fine
        let _ = sender.send(result);
        true
    }
}

impl<T> Future for Promise<T> {
    type Output = Result<T, Thrown>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Poll::Ready(Err(Thrown::new(Error::PromiseTaken)));
        };

        match Pin::new(receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Thrown::new(Error::DeferredDropped))),
        }
    }
}

/// Resolves its promise once [`Checkpoints::checkpoint`] was called the required number of times
#[derive(Clone)]
pub struct Checkpoints {
    deferred: Deferred<()>,
    required: Rc<Cell<usize>>,
    reached: Rc<Cell<usize>>,
}

impl Checkpoints {
    /// Require `required` checkpoints before resolving
    pub fn new(required: usize) -> Self {
        Self {
            deferred: Deferred::new(),
            required: Rc::new(Cell::new(required)),
            reached: Rc::new(Cell::new(0)),
        }
    }

    /// Change the number of checkpoints required
    pub fn require(&self, required: usize) {
        self.required.set(required);
    }

    /// Record one checkpoint
    pub fn checkpoint(&self) {
        let reached = self.reached.get() + 1;
        self.reached.set(reached);
        if reached == self.required.get() {
            self.deferred.resolve(());
        }
    }

    /// Checkpoints recorded so far
    pub fn reached(&self) -> usize {
        self.reached.get()
    }

    /// Resolve the promise early
    pub fn resolve(&self) -> bool {
        self.deferred.resolve(())
    }

    /// Fail the promise
    pub fn fail(&self, error: impl Into<Thrown>) -> bool {
        self.deferred.fail(error)
    }

    /// Promise resolved by the last required checkpoint
    pub fn promise(&self) -> Promise<()> {
        self.deferred.promise()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thrown::TestException;
    use futures::executor::block_on;
    use futures::FutureExt;

    #[test]
    fn test_promise_resolves_with_value() {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        assert!(deferred.resolve("foo"));
        assert!(!deferred.resolve("bar"));
        assert_eq!(block_on(promise).unwrap(), "foo");
    }

    #[test]
    fn test_promise_fails_with_error() {
        let deferred = Deferred::<()>::new();
        let promise = deferred.promise();
        deferred.fail(TestException::new("We encountered some error"));

        let thrown = block_on(promise).unwrap_err();
        assert_eq!(
            thrown.downcast_ref::<TestException>(),
            Some(&TestException::new("We encountered some error"))
        );
    }

    #[test]
    fn test_second_promise_is_taken() {
        let deferred = Deferred::<u8>::new();
        let _first = deferred.promise();
        let thrown = block_on(deferred.promise()).unwrap_err();
        assert_eq!(thrown.downcast_ref::<Error>(), Some(&Error::PromiseTaken));
    }

    #[test]
    fn test_dropped_deferred_fails_promise() {
        let promise = Deferred::<u8>::new().promise();
        let thrown = block_on(promise).unwrap_err();
        assert!(thrown.is::<Error>());
    }

    #[test]
    fn test_not_enough_checkpoints() {
        let checkpoints = Checkpoints::new(3);
        let mut promise = checkpoints.promise();
        checkpoints.checkpoint();
        checkpoints.checkpoint();
        assert!((&mut promise).now_or_never().is_none());
        assert_eq!(checkpoints.reached(), 2);
    }

    #[test]
    fn test_enough_checkpoints() {
        let checkpoints = Checkpoints::new(1);
        checkpoints.require(3);
        let promise = checkpoints.promise();
        for _ in 0..3 {
            checkpoints.checkpoint();
        }
        assert!(block_on(promise).is_ok());
    }
}

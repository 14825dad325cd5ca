//! What a test body returns

use crate::thrown::Thrown;
use futures::future::{self, FutureExt, LocalBoxFuture};
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Result of invoking a test body
pub enum TestOutcome<T> {
    /// The body produced its value synchronously
    Immediate(T),
    /// The body is still running; await the future
    Deferred(LocalBoxFuture<'static, Result<T, Thrown>>),
    /// The body failed synchronously
    Failed(Thrown),
}

impl<T: 'static> TestOutcome<T> {
    /// Wrap a future the loop has to drive
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, Thrown>> + 'static,
    {
        TestOutcome::Deferred(future.boxed_local())
    }

    /// Turn every outcome into a future; panics while polling become failures
    pub fn normalize(self) -> LocalBoxFuture<'static, Result<T, Thrown>> {
        match self {
            TestOutcome::Immediate(value) => future::ready(Ok(value)).boxed_local(),
            TestOutcome::Failed(thrown) => future::ready(Err(thrown)).boxed_local(),
            TestOutcome::Deferred(body) => AssertUnwindSafe(body)
                .catch_unwind()
                .map(|polled| match polled {
                    Ok(result) => result,
                    Err(payload) => Err(Thrown::from_panic(payload)),
                })
                .boxed_local(),
        }
    }
}

impl<T> From<Result<T, Thrown>> for TestOutcome<T> {
    fn from(result: Result<T, Thrown>) -> Self {
        match result {
            Ok(value) => TestOutcome::Immediate(value),
            Err(thrown) => TestOutcome::Failed(thrown),
        }
    }
}

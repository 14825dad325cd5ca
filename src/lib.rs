//! # loop-test
//!
//! Run asynchronous test bodies on an isolated event loop and report every way
//! they can go wrong as an ordinary test failure.
//!
//! ## Features
//!
//! - **Fresh loop per test**: each body runs on its own [`event_loop::EventLoop`],
//!   dropped with everything registered on it when the test ends
//! - **Timeouts**: fail a test that has not settled in time, optionally listing
//!   the watchers that kept it waiting
//! - **Minimum runtimes**: fail a test that finished too quickly
//! - **Leak detection**: fail a test that left enabled watchers behind
//! - **Loop errors**: errors escaping detached callbacks fail the running test
//! - **Callback stubs**: callbacks that must be invoked an exact number of times
//!
//! ## Quick Start
//!
//! ```rust
//! use loop_test::prelude::*;
//! use std::time::Duration;
//!
//! let result = TestCase::new("delayed_value").run_test(|ctx| async move {
//!     ctx.set_timeout(Duration::from_secs(1));
//!
//!     let deferred = Deferred::new();
//!     let resolver = deferred.clone();
//!     ctx.handle().delay(Duration::from_millis(10), move |_, _| {
//!         resolver.resolve("done");
//!         Ok(())
//!     });
//!
//!     deferred.promise().await
//! });
//!
//! assert_eq!(result.unwrap(), "done");
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod deferred;
pub mod driver;
pub mod error;
pub mod event_loop;
pub mod failure;
pub mod leak;
pub mod outcome;
pub mod sentinel;
pub mod signal;
pub mod stub;
pub mod thrown;
pub mod timeout;
pub mod timing;

/// Convenient re-exports for writing async tests
pub mod prelude {
    pub use crate::config::HarnessConfig;
    pub use crate::deferred::{Checkpoints, Deferred, Promise};
    pub use crate::driver::{AsyncFixture, TestCase, TestContext};
    pub use crate::error::{Error, Result};
    pub use crate::event_loop::{EventLoop, Handle, IoSource, LoopInfo, WatcherId};
    pub use crate::failure::TestFailure;
    pub use crate::leak::WatcherPolicy;
    pub use crate::outcome::TestOutcome;
    pub use crate::stub::CallbackStub;
    pub use crate::thrown::{assert_greater_or_equal, fail, CallbackResult, TestException, Thrown};
    pub use crate::timing::{assert_run_time_between, assert_run_time_greater_than, assert_run_time_less_than};

    /// Define a `#[test]` whose body runs on a fresh event loop.
    ///
    /// The body receives a [`TestContext`](crate::TestContext) and evaluates to
    /// a `Result<_, Thrown>`; a failure fails the test with its message.
    ///
    /// ```rust
    /// use loop_test::prelude::*;
    /// use std::time::Duration;
    ///
    /// async_test!(async fn waits_for_sleep(ctx) {
    ///     ctx.sleep(Duration::from_millis(1)).await;
    ///     Ok(())
    /// });
    /// ```
    #[macro_export]
    macro_rules! async_test {
        ($(#[$meta:meta])* async fn $name:ident($ctx:ident) $body:block) => {
            $(#[$meta])*
            #[test]
            fn $name() {
                let result = $crate::TestCase::new(stringify!($name))
                    .run_test(|$ctx: $crate::TestContext| async move $body);
                if let Err(failure) = result {
                    failure.raise();
                }
            }
        };
    }

    pub use async_test;
}

// Re-export the prelude at crate root for convenience
pub use prelude::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn basic_async_test() {
        let value = TestCase::with_config("basic", HarnessConfig::default())
            .run_test(|ctx| async move {
                ctx.sleep(Duration::from_millis(1)).await;
                Ok(7)
            })
            .unwrap();
        assert_eq!(value, 7);
    }
}

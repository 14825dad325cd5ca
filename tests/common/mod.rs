//! Common test harness for loop-test integration tests
//!
//! Tests build their cases through these helpers so they never depend on the
//! `LOOP_TEST_*` variables of the environment running the suite.

use loop_test::{HarnessConfig, TestCase, TestFailure};

/// Test case with the default configuration
#[allow(dead_code)]
pub fn case(name: &str) -> TestCase {
    TestCase::with_config(name, HarnessConfig::default())
}

/// Test case whose timeout failures list pending watchers
#[allow(dead_code)]
pub fn tracing_case(name: &str) -> TestCase {
    TestCase::with_config(name, HarnessConfig::default().with_trace_watchers(true))
}

/// Unwrap the failure of a run that must fail
#[allow(dead_code)]
pub fn expect_failure<T>(result: Result<T, TestFailure>) -> TestFailure {
    match result {
        Ok(_) => panic!("Expected the test to fail"),
        Err(failure) => failure,
    }
}

/// Define a test running its body through [`case`]
///
/// Usage:
/// ```ignore
/// loop_test_case!(async fn my_test(ctx) {
///     ctx.sleep(Duration::from_millis(1)).await;
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! loop_test_case {
    (async fn $name:ident($ctx:ident) $body:block) => {
        #[test]
        fn $name() {
            let result = $crate::common::case(stringify!($name))
                .run_test(|$ctx: loop_test::TestContext| async move $body);
            if let Err(failure) = result {
                failure.raise();
            }
        }
    };
}

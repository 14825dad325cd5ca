//! Integration tests for deferred values and checkpoints driven by the loop

mod common;

use common::{case, expect_failure};
use loop_test::prelude::*;
use std::time::Duration;

#[test]
fn test_checkpoints_resolve_after_async_steps() {
    case("checkpoints")
        .run_test(|ctx| async move {
            let checkpoints = Checkpoints::new(3);

            for delay in [5u64, 10, 15] {
                let c = checkpoints.clone();
                ctx.handle().delay(Duration::from_millis(delay), move |_, _| {
                    c.checkpoint();
                    Ok(())
                });
            }

            checkpoints.promise().await?;
            assert_eq!(checkpoints.reached(), 3);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_missing_checkpoint_stops_loop() {
    let failure = expect_failure(case("missing_checkpoint").run_test(|ctx| async move {
        let checkpoints = Checkpoints::new(2);

        let c = checkpoints.clone();
        ctx.handle().defer(move |_, _| {
            c.checkpoint();
            Ok(())
        });

        checkpoints.promise().await
    }));

    assert!(matches!(failure, TestFailure::LoopStopped));
}

#[test]
fn test_deferred_failed_from_callback() {
    let failure = expect_failure(case("deferred_failed").run_test(|ctx| async move {
        let deferred = Deferred::<u32>::new();

        let d = deferred.clone();
        ctx.handle().delay(Duration::from_millis(5), move |_, _| {
            d.fail(TestException::new("We encountered some error"));
            Ok(())
        });

        deferred.promise().await
    }));

    assert_eq!(
        failure.to_string(),
        "loop_test::thrown::TestException: We encountered some error"
    );
}

#[test]
fn test_deferred_resolved_from_tokio_channel() {
    let value = case("deferred_tokio")
        .run_test(|ctx| async move {
            let deferred = Deferred::new();
            let (tx, rx) = tokio::sync::oneshot::channel::<&'static str>();

            let d = deferred.clone();
            ctx.handle().spawn(async move {
                if let Ok(value) = rx.await {
                    d.resolve(value);
                }
            });
            ctx.handle().defer(move |_, _| {
                let _ = tx.send("from tokio");
                Ok(())
            });

            deferred.promise().await
        })
        .unwrap();

    assert_eq!(value, "from tokio");
}

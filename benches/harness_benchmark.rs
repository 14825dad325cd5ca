//! Harness overhead benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use loop_test::prelude::*;
use std::time::Duration;

fn bench_immediate_test(c: &mut Criterion) {
    c.bench_function("run_test_immediate", |b| {
        b.iter(|| {
            let value = TestCase::with_config("bench", HarnessConfig::default())
                .run_test(|_| async { Ok(black_box(42)) })
                .unwrap();
            black_box(value);
        })
    });
}

fn bench_defer_chain(c: &mut Criterion) {
    c.bench_function("defer_chain_1000", |b| {
        b.iter(|| {
            let event_loop = EventLoop::new();
            let handle = event_loop.handle();

            for i in 0..1000 {
                handle.defer(move |_, _| {
                    black_box(i);
                    Ok(())
                });
            }

            event_loop.run().unwrap();
        })
    });
}

fn bench_timer_heap(c: &mut Criterion) {
    c.bench_function("zero_delays_1000", |b| {
        b.iter(|| {
            let event_loop = EventLoop::new();
            let handle = event_loop.handle();

            for _ in 0..1000 {
                handle.delay(Duration::ZERO, |_, _| Ok(()));
            }

            event_loop.run().unwrap();
            black_box(handle.info());
        })
    });
}

fn bench_timeout_and_leak_check(c: &mut Criterion) {
    c.bench_function("run_test_with_timeout", |b| {
        b.iter(|| {
            TestCase::with_config("bench", HarnessConfig::default())
                .run_test(|ctx| async move {
                    ctx.set_timeout(Duration::from_secs(10));
                    ctx.sleep(Duration::ZERO).await;
                    Ok(())
                })
                .unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_immediate_test,
    bench_defer_chain,
    bench_timer_heap,
    bench_timeout_and_leak_check
);
criterion_main!(benches);

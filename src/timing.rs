//! Run-time measurement helpers
//!
//! Durations in failure messages are rendered in milliseconds with at most
//! [`RUNTIME_PRECISION`] decimals, so messages stay deterministic.

use crate::thrown::fail;
use std::time::{Duration, Instant};

/// Number of decimals used in run-time comparisons and messages
pub const RUNTIME_PRECISION: i32 = 2;

/// Milliseconds in `duration`, rounded to [`RUNTIME_PRECISION`] decimals
pub fn round_millis(duration: Duration) -> f64 {
    let scale = 10f64.powi(RUNTIME_PRECISION);
    (duration.as_secs_f64() * 1000.0 * scale).round() / scale
}

/// Render `duration` as `100ms` or `12.5ms`
pub fn format_duration(duration: &Duration) -> String {
    let millis = round_millis(*duration);
    if millis.fract() == 0.0 {
        format!("{}ms", millis as u64)
    } else {
        let rendered = format!("{:.*}", RUNTIME_PRECISION as usize, millis);
        format!("{}ms", rendered.trim_end_matches('0'))
    }
}

/// Run `callback` and return how long it took
pub fn measure<F, R>(callback: F) -> (R, Duration)
where
    F: FnOnce() -> R,
{
    let start = Instant::now();
    let result = callback();
    (result, start.elapsed())
}

/// Fail unless `callback` finishes within `max`
#[track_caller]
pub fn assert_run_time_less_than<F, R>(callback: F, max: Duration) -> R
where
    F: FnOnce() -> R,
{
    assert_run_time_between(callback, Duration::ZERO, max)
}

/// Fail unless `callback` takes at least `min`
#[track_caller]
pub fn assert_run_time_greater_than<F, R>(callback: F, min: Duration) -> R
where
    F: FnOnce() -> R,
{
    assert_run_time_between(callback, min, Duration::ZERO)
}

/// Fail unless `callback` takes between `min` and `max`; a zero bound is not checked
#[track_caller]
pub fn assert_run_time_between<F, R>(callback: F, min: Duration, max: Duration) -> R
where
    F: FnOnce() -> R,
{
    let (result, elapsed) = measure(callback);
    let run_time = round_millis(elapsed);

    if !max.is_zero() && run_time > round_millis(max) {
        fail(format!(
            "The run time of {} was greater than the max run time of {}.",
            format_duration(&elapsed),
            format_duration(&max)
        ));
    }

    if !min.is_zero() && run_time < round_millis(min) {
        fail(format!(
            "The run time of {} was less than the min run time of {}.",
            format_duration(&elapsed),
            format_duration(&min)
        ));
    }

    result
}

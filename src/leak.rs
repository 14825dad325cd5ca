//! Watcher leak detection
//!
//! A test that leaves enabled watchers behind fails, because those watchers
//! would have kept a real program's loop running after the work was done.

use crate::event_loop::{Handle, LoopInfo};
use crate::failure::TestFailure;
use serde::Serialize;

/// Which leftover watchers fail a test
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatcherPolicy {
    /// Skip the check entirely
    pub ignore_all: bool,
    /// Count unreferenced watchers as well as referenced ones
    pub include_unreferenced: bool,
}

impl WatcherPolicy {
    /// Number of watchers in `info` that count as leaked
    pub fn leaked(&self, info: &LoopInfo) -> usize {
        if self.ignore_all {
            return 0;
        }

        let mut count = info.referenced();
        if self.include_unreferenced {
            count += info.unreferenced();
        }
        count
    }
}

/// Fail with [`TestFailure::LeakedWatchers`] if `handle` still has watchers `policy` counts
pub fn check_leaks(
    handle: &Handle,
    test: &str,
    policy: WatcherPolicy,
    trace_watchers: bool,
) -> Result<(), TestFailure> {
    let snapshot = handle.info();
    let leaked = policy.leaked(&snapshot);

    if leaked == 0 {
        return Ok(());
    }

    log::debug!("Test '{}' left {} enabled watchers", test, leaked);
    let trace = if trace_watchers {
        format!("\n\n{}", handle.dump())
    } else {
        String::new()
    };

    Err(TestFailure::LeakedWatchers {
        test: test.to_string(),
        snapshot,
        trace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::time::Duration;

    #[test]
    fn test_referenced_delay_is_a_leak() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        handle.delay(Duration::from_secs(60), |_, _| Ok(()));

        let failure = check_leaks(handle, "leaky", WatcherPolicy::default(), false).unwrap_err();
        let message = failure.to_string();
        assert!(message.starts_with("Found enabled watchers at end of test 'leaky': {"));
        assert!(message.contains("\"delay\""));
    }

    #[test]
    fn test_policy_counts() {
        let mut info = LoopInfo::default();
        info.enabled_watchers.referenced = 1;
        info.enabled_watchers.unreferenced = 2;

        assert_eq!(WatcherPolicy::default().leaked(&info), 1);
        let strict = WatcherPolicy {
            include_unreferenced: true,
            ..WatcherPolicy::default()
        };
        assert_eq!(strict.leaked(&info), 3);
        let ignore = WatcherPolicy {
            ignore_all: true,
            include_unreferenced: true,
        };
        assert_eq!(ignore.leaked(&info), 0);
    }

    #[test]
    fn test_unreferenced_only_fails_when_included() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let id = handle.repeat(Duration::from_secs(60), |_, _| Ok(()));
        handle.unreference(id).unwrap();

        assert!(check_leaks(handle, "t", WatcherPolicy::default(), false).is_ok());
        let strict = WatcherPolicy {
            include_unreferenced: true,
            ..WatcherPolicy::default()
        };
        let failure = check_leaks(handle, "t", strict, true).unwrap_err();
        assert!(failure.to_string().contains("Enabled, unreferenced watcher ('repeat')"));
    }

    #[test]
    fn test_disabled_watchers_are_not_leaks() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let id = handle.defer(|_, _| Ok(()));
        handle.disable(id).unwrap();

        assert!(check_leaks(handle, "t", WatcherPolicy::default(), false).is_ok());
    }
}

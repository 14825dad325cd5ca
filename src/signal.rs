//! One-shot completion signal
//!
//! The test body, the timeout and the loop error handler race to settle the
//! same [`CompletionSignal`]. The first settlement is delivered to the
//! [`CompletionReceiver`]; every later attempt is ignored.

use crate::failure::TestFailure;
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::sync::Arc;

/// Result a test invocation settles with
pub type Settlement = Result<(), TestFailure>;

/// Single-assignment settlement cell shared by everything racing the body
#[derive(Clone)]
pub struct CompletionSignal {
    sender: Arc<Mutex<Option<oneshot::Sender<Settlement>>>>,
}

/// Receiving side of a [`CompletionSignal`], owned by the driver
pub struct CompletionReceiver {
    receiver: oneshot::Receiver<Settlement>,
}

impl CompletionSignal {
    /// Create a signal together with its receiver
    pub fn new() -> (Self, CompletionReceiver) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(sender))),
            },
            CompletionReceiver { receiver },
        )
    }

    /// Settle the signal unless it already is.
    ///
    /// Returns `true` when this call won the race.
    pub fn settle(&self, settlement: Settlement) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            log::trace!("Ignoring settlement of an already settled signal");
            return false;
        };

        if sender.send(settlement).is_err() {
            log::debug!("Completion receiver dropped before settlement");
        }
        true
    }

    /// Whether some party already settled the signal
    pub fn is_settled(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl CompletionReceiver {
    /// Take the settlement, if the signal was settled
    pub fn take(&mut self) -> Option<Settlement> {
        self.receiver.try_recv().ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_settlement_wins() {
        let (signal, mut receiver) = CompletionSignal::new();
        let other = signal.clone();

        assert!(!signal.is_settled());
        assert!(signal.settle(Err(TestFailure::LoopStopped)));
        assert!(!other.settle(Ok(())));
        assert!(other.is_settled());

        assert!(matches!(receiver.take(), Some(Err(TestFailure::LoopStopped))));
    }

    #[test]
    fn test_unsettled_signal_yields_nothing() {
        let (_signal, mut receiver) = CompletionSignal::new();
        assert!(receiver.take().is_none());
    }

    #[test]
    fn test_settle_after_receiver_dropped() {
        let (signal, receiver) = CompletionSignal::new();
        drop(receiver);
        assert!(signal.settle(Ok(())));
        assert!(!signal.settle(Ok(())));
    }
}

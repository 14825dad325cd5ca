//! Futures driven by the event loop
//!
//! Tasks are polled on the loop thread. Their wakers only carry a channel
//! sender, so they may be woken from any thread.

use super::{Handle, LoopEvent, WatcherId};
use crate::thrown::CallbackResult;
use crossbeam::channel::Sender;
use futures::future::LocalBoxFuture;
use futures::task::ArcWake;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Identifier of a task spawned on an event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

pub(crate) type LocalTask = LocalBoxFuture<'static, CallbackResult>;

/// Waker that queues its task on the owning loop
pub(crate) struct TaskWaker {
    pub id: TaskId,
    pub events: Sender<LoopEvent>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        // the loop may already be gone
        let _ = arc_self.events.send(LoopEvent::Wake(arc_self.id));
    }
}

pub(crate) fn task_waker(id: TaskId, events: Sender<LoopEvent>) -> Waker {
    futures::task::waker(Arc::new(TaskWaker { id, events }))
}

#[derive(Default)]
struct SleepShared {
    fired: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

/// Future completing after a delay measured by the event loop.
///
/// The delay watcher is registered on first poll and cancelled when the
/// future is dropped early, so an abandoned sleep never counts as a leak.
#[must_use = "futures do nothing unless polled"]
pub struct Sleep {
    handle: Handle,
    duration: Duration,
    shared: Rc<SleepShared>,
    watcher: Option<WatcherId>,
    created_at: &'static Location<'static>,
}

impl Sleep {
    pub(crate) fn new(handle: Handle, duration: Duration, created_at: &'static Location<'static>) -> Self {
        Self {
            handle,
            duration,
            shared: Rc::new(SleepShared::default()),
            watcher: None,
            created_at,
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if this.shared.fired.get() {
            this.watcher = None;
            return Poll::Ready(());
        }

        *this.shared.waker.borrow_mut() = Some(cx.waker().clone());

        if this.watcher.is_none() {
            let shared = Rc::clone(&this.shared);
            let id = this.handle.delay_at(this.duration, this.created_at, move |_, _| {
                shared.fired.set(true);
                if let Some(waker) = shared.waker.borrow_mut().take() {
                    waker.wake();
                }
                Ok(())
            });
            this.watcher = Some(id);
        }

        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.watcher.take() {
            if !self.shared.fired.get() {
                self.handle.cancel(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn test_waker_sends_wake_event() {
        let (tx, rx) = unbounded();
        let waker = task_waker(TaskId(7), tx);

        waker.wake_by_ref();
        waker.wake();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, LoopEvent::Wake(TaskId(7)))));
    }

    #[test]
    fn test_waker_survives_dropped_loop() {
        let (tx, rx) = unbounded();
        let waker = task_waker(TaskId(1), tx);
        drop(rx);
        waker.wake();
    }
}

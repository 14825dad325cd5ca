//! Single-threaded event loop
//!
//! One [`EventLoop`] is created per test invocation and dropped when the test
//! ends, so no watcher, task or error handler can survive into another test.
//! Callbacks and tasks run on the thread that calls [`Handle::run`]; readiness
//! notifications and task wakeups may arrive from any thread through the
//! loop's event channel (see [`Remote`]).

mod info;
mod task;
mod watcher;

pub use info::{EnabledWatchers, KindInfo, LoopInfo, WatcherEntry};
pub use task::{Sleep, TaskId};
pub use watcher::{Callback, IoSource, WatcherId, WatcherKind};

use crate::error::{Error, Result};
use crate::thrown::{CallbackResult, Thrown};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use task::LocalTask;
use watcher::{Target, WatcherTable};

/// Handler receiving errors that escape loop callbacks and detached tasks
pub type ErrorHandler = Box<dyn FnMut(Thrown)>;

/// Events delivered to the loop through its channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopEvent {
    Wake(TaskId),
    Readable(IoSource),
    Writable(IoSource),
    Signal(i32),
}

/// Event loop owning its registrations.
///
/// Dropping the loop cancels every watcher and drops every task, even when
/// handles to it are still alive.
pub struct EventLoop {
    handle: Handle,
}

/// Cheap, cloneable reference to an [`EventLoop`], usable only on its thread
#[derive(Clone)]
pub struct Handle {
    inner: Rc<Inner>,
}

/// Thread-safe sender for readiness notifications
#[derive(Debug, Clone)]
pub struct Remote {
    events: Sender<LoopEvent>,
}

struct Inner {
    id: usize,
    table: RefCell<WatcherTable>,
    tasks: RefCell<HashMap<TaskId, LocalTask>>,
    next_task: Cell<u64>,
    ready: RefCell<VecDeque<TaskId>>,
    readiness: RefCell<VecDeque<LoopEvent>>,
    error_handler: RefCell<Option<ErrorHandler>>,
    handler_epoch: Cell<u64>,
    uncaught: RefCell<Option<Thrown>>,
    running: Cell<bool>,
    stop_requested: Cell<bool>,
    events_tx: Sender<LoopEvent>,
    events_rx: Receiver<LoopEvent>,
}

impl EventLoop {
    /// Create a new, empty event loop
    pub fn new() -> Self {
        static LOOP_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

        let (events_tx, events_rx) = unbounded();
        let inner = Inner {
            id: LOOP_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            table: RefCell::new(WatcherTable::default()),
            tasks: RefCell::new(HashMap::new()),
            next_task: Cell::new(0),
            ready: RefCell::new(VecDeque::new()),
            readiness: RefCell::new(VecDeque::new()),
            error_handler: RefCell::new(None),
            handler_epoch: Cell::new(0),
            uncaught: RefCell::new(None),
            running: Cell::new(false),
            stop_requested: Cell::new(false),
            events_tx,
            events_rx,
        };

        log::trace!("Created event loop {}", inner.id);
        Self {
            handle: Handle {
                inner: Rc::new(inner),
            },
        }
    }

    /// Handle to this loop
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run the loop, see [`Handle::run`]
    pub fn run(&self) -> Result<()> {
        self.handle.run()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let inner = &self.handle.inner;
        // Callbacks and tasks may hold handles; clear them to break the cycle.
        let watchers = inner.table.borrow_mut().clear();
        let tasks: Vec<_> = inner.tasks.borrow_mut().drain().collect();
        let handler = inner.error_handler.borrow_mut().take();
        log::debug!(
            "Dropping event loop {} ({} watchers, {} tasks left)",
            inner.id,
            watchers.len(),
            tasks.len()
        );
        drop(watchers);
        drop(tasks);
        drop(handler);
    }
}

impl Handle {
    /// Identifier of the loop, for logs
    pub fn loop_id(&self) -> usize {
        self.inner.id
    }

    /// Sender that can report readiness to this loop from any thread
    pub fn remote(&self) -> Remote {
        Remote {
            events: self.inner.events_tx.clone(),
        }
    }

    fn register(
        &self,
        kind: WatcherKind,
        target: Target,
        callback: Callback,
        created_at: &'static Location<'static>,
    ) -> WatcherId {
        let id = self
            .inner
            .table
            .borrow_mut()
            .insert(kind, target, callback, created_at);
        log::trace!("Loop {}: registered {} watcher {} at {}", self.inner.id, kind, id, created_at);
        id
    }

    /// Run `callback` once on the next tick
    #[track_caller]
    pub fn defer<F>(&self, callback: F) -> WatcherId
    where
        F: FnOnce(&Handle, WatcherId) -> CallbackResult + 'static,
    {
        self.register(WatcherKind::Defer, Target::Tick, once(callback), Location::caller())
    }

    /// Run `callback` once after `delay`
    #[track_caller]
    pub fn delay<F>(&self, delay: Duration, callback: F) -> WatcherId
    where
        F: FnOnce(&Handle, WatcherId) -> CallbackResult + 'static,
    {
        self.delay_at(delay, Location::caller(), callback)
    }

    pub(crate) fn delay_at<F>(
        &self,
        delay: Duration,
        created_at: &'static Location<'static>,
        callback: F,
    ) -> WatcherId
    where
        F: FnOnce(&Handle, WatcherId) -> CallbackResult + 'static,
    {
        self.register(
            WatcherKind::Delay,
            Target::Timer { interval: delay },
            once(callback),
            created_at,
        )
    }

    /// Run `callback` every `interval` until cancelled
    #[track_caller]
    pub fn repeat<F>(&self, interval: Duration, callback: F) -> WatcherId
    where
        F: FnMut(&Handle, WatcherId) -> CallbackResult + 'static,
    {
        self.register(
            WatcherKind::Repeat,
            Target::Timer { interval },
            Box::new(callback),
            Location::caller(),
        )
    }

    /// Run `callback` whenever `source` is reported readable
    #[track_caller]
    pub fn on_readable<F>(&self, source: IoSource, callback: F) -> WatcherId
    where
        F: FnMut(&Handle, WatcherId) -> CallbackResult + 'static,
    {
        self.register(
            WatcherKind::OnReadable,
            Target::Source(source),
            Box::new(callback),
            Location::caller(),
        )
    }

    /// Run `callback` whenever `source` is reported writable
    #[track_caller]
    pub fn on_writable<F>(&self, source: IoSource, callback: F) -> WatcherId
    where
        F: FnMut(&Handle, WatcherId) -> CallbackResult + 'static,
    {
        self.register(
            WatcherKind::OnWritable,
            Target::Source(source),
            Box::new(callback),
            Location::caller(),
        )
    }

    /// Run `callback` whenever `signo` is delivered
    #[track_caller]
    pub fn on_signal<F>(&self, signo: i32, callback: F) -> WatcherId
    where
        F: FnMut(&Handle, WatcherId) -> CallbackResult + 'static,
    {
        self.register(
            WatcherKind::OnSignal,
            Target::Signal(signo),
            Box::new(callback),
            Location::caller(),
        )
    }

    /// Cancel a watcher. Unknown or already cancelled ids are ignored.
    pub fn cancel(&self, id: WatcherId) {
        let removed = self.inner.table.borrow_mut().watchers.remove(&id);
        if removed.is_some() {
            log::trace!("Loop {}: cancelled watcher {}", self.inner.id, id);
        }
    }

    fn with_watcher<R>(&self, id: WatcherId, f: impl FnOnce(&mut WatcherTable) -> R) -> Result<R> {
        let mut table = self.inner.table.borrow_mut();
        if !table.watchers.contains_key(&id) {
            return Err(Error::InvalidWatcher { id });
        }
        Ok(f(&mut table))
    }

    /// Enable a disabled watcher; timers restart their full delay
    pub fn enable(&self, id: WatcherId) -> Result<()> {
        self.with_watcher(id, |table| {
            let Some(watcher) = table.watchers.get_mut(&id) else {
                return;
            };
            if !watcher.enabled {
                watcher.enabled = true;
                table.activate(id);
            }
        })
    }

    /// Disable a watcher without cancelling it
    pub fn disable(&self, id: WatcherId) -> Result<()> {
        self.with_watcher(id, |table| {
            if let Some(watcher) = table.watchers.get_mut(&id) {
                watcher.enabled = false;
            }
        })
    }

    /// Let the watcher keep the loop alive (the default)
    pub fn reference(&self, id: WatcherId) -> Result<()> {
        self.with_watcher(id, |table| {
            if let Some(watcher) = table.watchers.get_mut(&id) {
                watcher.referenced = true;
            }
        })
    }

    /// Stop the watcher from keeping the loop alive
    pub fn unreference(&self, id: WatcherId) -> Result<()> {
        self.with_watcher(id, |table| {
            if let Some(watcher) = table.watchers.get_mut(&id) {
                watcher.referenced = false;
            }
        })
    }

    /// Install `handler`, returning the one it replaces
    pub fn set_error_handler(&self, handler: Option<ErrorHandler>) -> Option<ErrorHandler> {
        self.inner.handler_epoch.set(self.inner.handler_epoch.get() + 1);
        std::mem::replace(&mut *self.inner.error_handler.borrow_mut(), handler)
    }

    /// Counts of pending watchers
    pub fn info(&self) -> LoopInfo {
        LoopInfo::capture(&self.inner.table.borrow(), self.inner.running.get())
    }

    /// Every registered watcher with the site that created it
    pub fn watchers(&self) -> Vec<WatcherEntry> {
        WatcherEntry::list(&self.inner.table.borrow())
    }

    /// Human readable list of enabled watchers
    pub fn dump(&self) -> String {
        let entries: Vec<String> = self
            .watchers()
            .into_iter()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.to_string())
            .collect();

        if entries.is_empty() {
            "No enabled watchers".to_string()
        } else {
            entries.join("\n")
        }
    }

    /// Spawn a task on this loop
    pub fn spawn<F>(&self, future: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        self.spawn_fallible(async move {
            future.await;
            Ok(())
        })
    }

    /// Spawn a task whose error is routed to the error handler
    pub fn spawn_fallible<F>(&self, future: F) -> TaskId
    where
        F: Future<Output = CallbackResult> + 'static,
    {
        let id = TaskId(self.inner.next_task.get() + 1);
        self.inner.next_task.set(id.0);
        self.inner.tasks.borrow_mut().insert(id, Box::pin(future));
        self.inner.ready.borrow_mut().push_back(id);
        id
    }

    /// Future completing after `duration`
    #[track_caller]
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::new(self.clone(), duration, Location::caller())
    }

    /// Ask a running loop to return after the current tick
    pub fn stop(&self) {
        self.inner.stop_requested.set(true);
    }

    /// Whether [`Handle::run`] is on the stack
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Run until stopped or until no enabled, referenced watcher remains.
    ///
    /// Returns [`Error::Uncaught`] when a callback failed while no error
    /// handler was installed; the loop stops at the end of that tick.
    pub fn run(&self) -> Result<()> {
        if self.inner.running.replace(true) {
            return Err(Error::LoopRunning);
        }
        self.inner.stop_requested.set(false);
        let _running = RunningGuard(&self.inner);

        log::debug!("Event loop {} running", self.inner.id);

        loop {
            self.tick();

            if self.inner.stop_requested.get() {
                log::debug!("Event loop {} stopped", self.inner.id);
                break;
            }

            if self.has_ready_work() {
                continue;
            }

            if !self.inner.table.borrow().has_referenced() {
                log::debug!("Event loop {} idle", self.inner.id);
                break;
            }

            self.wait_for_events();
        }

        match self.inner.uncaught.borrow_mut().take() {
            Some(thrown) => Err(Error::Uncaught {
                type_name: thrown.type_name().into_owned(),
                message: thrown.message().to_string(),
            }),
            None => Ok(()),
        }
    }

    fn tick(&self) {
        self.drain_events();
        self.poll_ready_tasks();
        self.run_defers();
        self.run_timers();
        self.dispatch_readiness();
    }

    fn accept(&self, event: LoopEvent) {
        match event {
            LoopEvent::Wake(id) => self.inner.ready.borrow_mut().push_back(id),
            other => self.inner.readiness.borrow_mut().push_back(other),
        }
    }

    fn drain_events(&self) {
        while let Ok(event) = self.inner.events_rx.try_recv() {
            self.accept(event);
        }
    }

    fn has_ready_work(&self) -> bool {
        if !self.inner.events_rx.is_empty()
            || !self.inner.ready.borrow().is_empty()
            || !self.inner.readiness.borrow().is_empty()
        {
            return true;
        }

        let mut table = self.inner.table.borrow_mut();
        table.has_runnable_defer()
            || table
                .next_deadline()
                .map_or(false, |deadline| deadline <= Instant::now())
    }

    fn wait_for_events(&self) {
        let deadline = self.inner.table.borrow_mut().next_deadline();
        let event = match deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match self.inner.events_rx.recv_timeout(timeout) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
                }
            }
            // the loop holds a sender itself, so this only returns with an event
            None => self.inner.events_rx.recv().ok(),
        };

        if let Some(event) = event {
            self.accept(event);
        }
    }

    fn poll_ready_tasks(&self) {
        let ready: Vec<TaskId> = self.inner.ready.borrow_mut().drain(..).collect();
        let mut polled = Vec::with_capacity(ready.len());

        for id in ready {
            if polled.contains(&id) {
                continue;
            }
            polled.push(id);
            self.poll_task(id);
        }
    }

    fn poll_task(&self, id: TaskId) {
        let Some(mut future) = self.inner.tasks.borrow_mut().remove(&id) else {
            return;
        };

        let waker = task::task_waker(id, self.inner.events_tx.clone());
        let mut cx = Context::from_waker(&waker);

        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {
                self.inner.tasks.borrow_mut().insert(id, future);
            }
            Ok(Poll::Ready(Ok(()))) => {}
            Ok(Poll::Ready(Err(thrown))) => self.report(thrown),
            Err(payload) => self.report(Thrown::from_panic(payload)),
        }
    }

    fn run_defers(&self) {
        let queue: Vec<WatcherId> = self.inner.table.borrow_mut().defer_queue.drain(..).collect();

        for id in queue {
            let callback = {
                let mut table = self.inner.table.borrow_mut();
                match table.watchers.get(&id) {
                    Some(watcher) if watcher.enabled => {
                        table.watchers.remove(&id).and_then(|w| w.callback)
                    }
                    _ => None,
                }
            };

            if let Some(callback) = callback {
                self.invoke(id, callback);
            }
        }
    }

    fn run_timers(&self) {
        let now = Instant::now();

        loop {
            let Some(entry) = self.inner.table.borrow_mut().pop_due(now) else {
                break;
            };

            let (kind, callback) = {
                let mut table = self.inner.table.borrow_mut();
                match table.watchers.get(&entry.id).map(|w| w.kind) {
                    Some(WatcherKind::Delay) => (
                        WatcherKind::Delay,
                        table.watchers.remove(&entry.id).and_then(|w| w.callback),
                    ),
                    Some(kind) => (
                        kind,
                        table.watchers.get_mut(&entry.id).and_then(|w| w.callback.take()),
                    ),
                    None => continue,
                }
            };

            let Some(callback) = callback else {
                continue;
            };
            let callback = self.invoke(entry.id, callback);

            if kind == WatcherKind::Repeat {
                let mut table = self.inner.table.borrow_mut();
                let rearm = match table.watchers.get_mut(&entry.id) {
                    Some(watcher) => {
                        watcher.callback = Some(callback);
                        // cancelled-then-enabled watchers were re-armed already
                        watcher.enabled && watcher.timer_seq == entry.seq
                    }
                    None => false,
                };
                if rearm {
                    table.activate(entry.id);
                }
            }
        }
    }

    fn dispatch_readiness(&self) {
        let events: Vec<LoopEvent> = self.inner.readiness.borrow_mut().drain(..).collect();

        for event in events {
            let targets: Vec<WatcherId> = {
                let table = self.inner.table.borrow();
                table
                    .watchers
                    .values()
                    .filter(|w| w.enabled && matches_event(w.kind, w.target, event))
                    .map(|w| w.id)
                    .collect()
            };

            for id in targets {
                let callback = self
                    .inner
                    .table
                    .borrow_mut()
                    .watchers
                    .get_mut(&id)
                    .filter(|w| w.enabled)
                    .and_then(|w| w.callback.take());

                if let Some(callback) = callback {
                    let callback = self.invoke(id, callback);
                    if let Some(watcher) = self.inner.table.borrow_mut().watchers.get_mut(&id) {
                        watcher.callback = Some(callback);
                    }
                }
            }
        }
    }

    /// Call a watcher callback with no borrow of the table held
    fn invoke(&self, id: WatcherId, mut callback: Callback) -> Callback {
        match catch_unwind(AssertUnwindSafe(|| callback(self, id))) {
            Ok(Ok(())) => {}
            Ok(Err(thrown)) => self.report(thrown),
            Err(payload) => self.report(Thrown::from_panic(payload)),
        }
        callback
    }

    /// Route an escaped error to the error handler
    fn report(&self, thrown: Thrown) {
        let epoch = self.inner.handler_epoch.get();
        let handler = self.inner.error_handler.borrow_mut().take();

        let Some(mut handler) = handler else {
            log::warn!("Loop {}: uncaught {}", self.inner.id, thrown);
            let mut uncaught = self.inner.uncaught.borrow_mut();
            if uncaught.is_none() {
                *uncaught = Some(thrown);
            }
            self.stop();
            return;
        };

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(thrown))) {
            let thrown = Thrown::from_panic(payload);
            log::warn!("Loop {}: error handler failed with {}", self.inner.id, thrown);
            self.inner.uncaught.borrow_mut().get_or_insert(thrown);
            self.stop();
        }

        // the handler may have replaced itself
        if self.inner.handler_epoch.get() == epoch {
            *self.inner.error_handler.borrow_mut() = Some(handler);
        }
    }
}

impl Remote {
    /// Report `source` as readable
    pub fn notify_readable(&self, source: IoSource) {
        let _ = self.events.send(LoopEvent::Readable(source));
    }

    /// Report `source` as writable
    pub fn notify_writable(&self, source: IoSource) {
        let _ = self.events.send(LoopEvent::Writable(source));
    }

    /// Deliver signal `signo`
    pub fn raise_signal(&self, signo: i32) {
        let _ = self.events.send(LoopEvent::Signal(signo));
    }
}

struct RunningGuard<'a>(&'a Inner);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.set(false);
        self.0.stop_requested.set(false);
    }
}

fn matches_event(kind: WatcherKind, target: Target, event: LoopEvent) -> bool {
    match (kind, target, event) {
        (WatcherKind::OnReadable, Target::Source(s), LoopEvent::Readable(e)) => s == e,
        (WatcherKind::OnWritable, Target::Source(s), LoopEvent::Writable(e)) => s == e,
        (WatcherKind::OnSignal, Target::Signal(s), LoopEvent::Signal(e)) => s == e,
        _ => false,
    }
}

fn once<F>(callback: F) -> Callback
where
    F: FnOnce(&Handle, WatcherId) -> CallbackResult + 'static,
{
    let mut callback = Some(callback);
    Box::new(move |handle: &Handle, id: WatcherId| match callback.take() {
        Some(callback) => callback(handle, id),
        None => Ok(()),
    })
}

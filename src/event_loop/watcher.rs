//! Watcher registrations and the timer heap

use super::Handle;
use crate::thrown::CallbackResult;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::fmt;
use std::panic::Location;
use std::time::{Duration, Instant};

/// Identifier of a watcher registered on an event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WatcherId(u64);

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Kind of a watcher registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherKind {
    /// Runs once on the next tick
    Defer,
    /// Runs once after a delay
    Delay,
    /// Runs every interval until cancelled
    Repeat,
    /// Runs whenever a source is reported readable
    OnReadable,
    /// Runs whenever a source is reported writable
    OnWritable,
    /// Runs whenever a signal is delivered
    OnSignal,
}

impl WatcherKind {
    /// Every kind, in snapshot order
    pub const ALL: [WatcherKind; 6] = [
        WatcherKind::Defer,
        WatcherKind::Delay,
        WatcherKind::Repeat,
        WatcherKind::OnReadable,
        WatcherKind::OnWritable,
        WatcherKind::OnSignal,
    ];

    /// Snake-case name used in snapshots and dumps
    pub fn as_str(self) -> &'static str {
        match self {
            WatcherKind::Defer => "defer",
            WatcherKind::Delay => "delay",
            WatcherKind::Repeat => "repeat",
            WatcherKind::OnReadable => "on_readable",
            WatcherKind::OnWritable => "on_writable",
            WatcherKind::OnSignal => "on_signal",
        }
    }
}

impl fmt::Display for WatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An I/O source that readiness can be reported for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct IoSource(pub u64);

/// Callback invoked when a watcher fires
pub type Callback = Box<dyn FnMut(&Handle, WatcherId) -> CallbackResult>;

/// What a watcher waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Tick,
    Timer { interval: Duration },
    Source(IoSource),
    Signal(i32),
}

pub(crate) struct Watcher {
    pub id: WatcherId,
    pub kind: WatcherKind,
    pub target: Target,
    pub enabled: bool,
    pub referenced: bool,
    /// Sequence number of the live timer heap entry
    pub timer_seq: u64,
    pub callback: Option<Callback>,
    pub created_at: &'static Location<'static>,
}

/// Entry in the timer heap, ordered by (deadline, seq) ascending
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerEntry {
    pub deadline: Instant,
    pub seq: u64,
    pub id: WatcherId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed for the max-heap
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Registration table of one event loop
#[derive(Default)]
pub(crate) struct WatcherTable {
    next_id: u64,
    next_seq: u64,
    pub watchers: BTreeMap<WatcherId, Watcher>,
    pub defer_queue: VecDeque<WatcherId>,
    timers: BinaryHeap<TimerEntry>,
}

impl WatcherTable {
    pub fn insert(
        &mut self,
        kind: WatcherKind,
        target: Target,
        callback: Callback,
        created_at: &'static Location<'static>,
    ) -> WatcherId {
        self.next_id += 1;
        let id = WatcherId(self.next_id);

        self.watchers.insert(
            id,
            Watcher {
                id,
                kind,
                target,
                enabled: true,
                referenced: true,
                timer_seq: 0,
                callback: Some(callback),
                created_at,
            },
        );
        self.activate(id);

        id
    }

    /// Queue or arm an enabled watcher
    pub fn activate(&mut self, id: WatcherId) {
        let Some(watcher) = self.watchers.get_mut(&id) else {
            return;
        };

        match watcher.target {
            Target::Tick => self.defer_queue.push_back(id),
            Target::Timer { interval } => {
                self.next_seq += 1;
                watcher.timer_seq = self.next_seq;
                self.timers.push(TimerEntry {
                    deadline: Instant::now() + interval,
                    seq: self.next_seq,
                    id,
                });
            }
            Target::Source(_) | Target::Signal(_) => {}
        }
    }

    /// Drop heap entries whose watcher was cancelled, disabled or re-armed
    fn prune_timers(&mut self) {
        while let Some(entry) = self.timers.peek() {
            let live = self
                .watchers
                .get(&entry.id)
                .map_or(false, |w| w.enabled && w.timer_seq == entry.seq);
            if live {
                break;
            }
            self.timers.pop();
        }
    }

    /// Earliest live timer deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.prune_timers();
        self.timers.peek().map(|entry| entry.deadline)
    }

    /// Pop the next live timer that is due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerEntry> {
        self.prune_timers();
        match self.timers.peek() {
            Some(entry) if entry.deadline <= now => self.timers.pop(),
            _ => None,
        }
    }

    pub fn has_runnable_defer(&self) -> bool {
        self.defer_queue
            .iter()
            .any(|id| self.watchers.get(id).map_or(false, |w| w.enabled))
    }

    pub fn has_referenced(&self) -> bool {
        self.watchers.values().any(|w| w.enabled && w.referenced)
    }

    /// Remove every registration, handing them back so they drop unborrowed
    pub fn clear(&mut self) -> BTreeMap<WatcherId, Watcher> {
        self.defer_queue.clear();
        self.timers.clear();
        std::mem::take(&mut self.watchers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Box::new(|_: &Handle, _: WatcherId| Ok(()))
    }

    #[test]
    fn test_timer_entries_pop_in_deadline_order() {
        let mut heap = BinaryHeap::new();
        let now = Instant::now();
        heap.push(TimerEntry { deadline: now + Duration::from_millis(20), seq: 1, id: WatcherId(1) });
        heap.push(TimerEntry { deadline: now + Duration::from_millis(10), seq: 2, id: WatcherId(2) });
        heap.push(TimerEntry { deadline: now + Duration::from_millis(10), seq: 3, id: WatcherId(3) });

        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|e| e.id)).collect();
        assert_eq!(order, vec![WatcherId(2), WatcherId(3), WatcherId(1)]);
    }

    #[test]
    fn test_cancelled_timer_is_pruned() {
        let mut table = WatcherTable::default();
        let id = table.insert(
            WatcherKind::Delay,
            Target::Timer { interval: Duration::from_millis(5) },
            noop(),
            Location::caller(),
        );
        assert!(table.next_deadline().is_some());

        table.watchers.remove(&id);
        assert!(table.next_deadline().is_none());
    }

    #[test]
    fn test_defer_is_queued() {
        let mut table = WatcherTable::default();
        let id = table.insert(WatcherKind::Defer, Target::Tick, noop(), Location::caller());
        assert_eq!(table.defer_queue.front(), Some(&id));
        assert!(table.has_runnable_defer());
        assert!(table.has_referenced());
    }
}

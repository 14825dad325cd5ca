//! Snapshots of pending watchers

use super::watcher::{WatcherId, WatcherKind, WatcherTable};
use serde::Serialize;
use std::fmt;

/// Watcher counts for a single kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindInfo {
    /// Enabled watchers keeping the loop alive
    pub referenced: usize,
    /// Enabled watchers that do not keep the loop alive
    pub unreferenced: usize,
    /// Disabled watchers
    pub disabled: usize,
}

/// Totals over all enabled watchers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnabledWatchers {
    /// Enabled watchers keeping the loop alive
    pub referenced: usize,
    /// Enabled watchers that do not keep the loop alive
    pub unreferenced: usize,
}

/// Snapshot of the registrations pending on an event loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopInfo {
    /// Deferred callbacks
    pub defer: KindInfo,
    /// One-shot timers
    pub delay: KindInfo,
    /// Repeating timers
    pub repeat: KindInfo,
    /// Readability watchers
    pub on_readable: KindInfo,
    /// Writability watchers
    pub on_writable: KindInfo,
    /// Signal watchers
    pub on_signal: KindInfo,
    /// Totals over all kinds
    pub enabled_watchers: EnabledWatchers,
    /// Whether the loop was running when the snapshot was taken
    pub running: bool,
}

impl LoopInfo {
    pub(crate) fn capture(table: &WatcherTable, running: bool) -> Self {
        let mut info = LoopInfo {
            running,
            ..LoopInfo::default()
        };

        for watcher in table.watchers.values() {
            let kind = info.kind_mut(watcher.kind);
            match (watcher.enabled, watcher.referenced) {
                (false, _) => kind.disabled += 1,
                (true, true) => {
                    kind.referenced += 1;
                    info.enabled_watchers.referenced += 1;
                }
                (true, false) => {
                    kind.unreferenced += 1;
                    info.enabled_watchers.unreferenced += 1;
                }
            }
        }

        info
    }

    /// Counts for one kind
    pub fn kind(&self, kind: WatcherKind) -> &KindInfo {
        match kind {
            WatcherKind::Defer => &self.defer,
            WatcherKind::Delay => &self.delay,
            WatcherKind::Repeat => &self.repeat,
            WatcherKind::OnReadable => &self.on_readable,
            WatcherKind::OnWritable => &self.on_writable,
            WatcherKind::OnSignal => &self.on_signal,
        }
    }

    fn kind_mut(&mut self, kind: WatcherKind) -> &mut KindInfo {
        match kind {
            WatcherKind::Defer => &mut self.defer,
            WatcherKind::Delay => &mut self.delay,
            WatcherKind::Repeat => &mut self.repeat,
            WatcherKind::OnReadable => &mut self.on_readable,
            WatcherKind::OnWritable => &mut self.on_writable,
            WatcherKind::OnSignal => &mut self.on_signal,
        }
    }

    /// Enabled watchers keeping the loop alive
    pub fn referenced(&self) -> usize {
        self.enabled_watchers.referenced
    }

    /// Enabled watchers that do not keep the loop alive
    pub fn unreferenced(&self) -> usize {
        self.enabled_watchers.unreferenced
    }
}

impl fmt::Display for LoopInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// One line of a watcher trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatcherEntry {
    /// Watcher identifier
    pub id: WatcherId,
    /// Watcher kind
    pub kind: WatcherKind,
    /// Whether the watcher is enabled
    pub enabled: bool,
    /// Whether the watcher keeps the loop alive
    pub referenced: bool,
    /// Source location that registered the watcher
    pub created_at: String,
}

impl WatcherEntry {
    pub(crate) fn list(table: &WatcherTable) -> Vec<WatcherEntry> {
        table
            .watchers
            .values()
            .map(|w| WatcherEntry {
                id: w.id,
                kind: w.kind,
                enabled: w.enabled,
                referenced: w.referenced,
                created_at: w.created_at.to_string(),
            })
            .collect()
    }
}

impl fmt::Display for WatcherEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {} watcher ('{}') {} created at {}",
            if self.enabled { "Enabled" } else { "Disabled" },
            if self.referenced { "referenced" } else { "unreferenced" },
            self.kind,
            self.id,
            self.created_at
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::watcher::Target;
    use crate::event_loop::Handle;
    use std::panic::Location;
    use std::time::Duration;

    #[test]
    fn test_capture_partitions_watchers() {
        let mut table = WatcherTable::default();
        table.insert(WatcherKind::Defer, Target::Tick, Box::new(|_: &Handle, _: WatcherId| Ok(())), Location::caller());
        let delay = table.insert(
            WatcherKind::Delay,
            Target::Timer { interval: Duration::from_secs(1) },
            Box::new(|_: &Handle, _: WatcherId| Ok(())),
            Location::caller(),
        );
        let signal = table.insert(WatcherKind::OnSignal, Target::Signal(2), Box::new(|_: &Handle, _: WatcherId| Ok(())), Location::caller());

        table.watchers.get_mut(&delay).unwrap().referenced = false;
        table.watchers.get_mut(&signal).unwrap().enabled = false;

        let info = LoopInfo::capture(&table, false);
        assert_eq!(info.defer.referenced, 1);
        assert_eq!(info.delay.unreferenced, 1);
        assert_eq!(info.on_signal.disabled, 1);
        assert_eq!(info.referenced(), 1);
        assert_eq!(info.unreferenced(), 1);
    }

    #[test]
    fn test_display_is_json() {
        let info = LoopInfo::default();
        let rendered = info.to_string();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["enabled_watchers"]["referenced"], 0);
        assert_eq!(value["on_readable"]["disabled"], 0);
    }
}

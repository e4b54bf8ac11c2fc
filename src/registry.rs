//! Registry of child processes spawned inside the sandbox.
//!
//! The table is keyed by pid and is the only mutable state shared between
//! the IPC handlers and the reaper thread. A *tracked* entry is a primary
//! application whose exit participates in the auto-shutdown policy;
//! auxiliary children (shells, dbus-monitor, terminal-hosted programs) do
//! not gate shutdown.
//!
//! As PID 1, init is the only process allowed to call `wait`; everything
//! is reaped centrally by the supervisor thread. Handlers that need a
//! helper's exit status (dconf) subscribe through [`ChildRegistry::await_exit`]
//! and the reaper routes the status to them.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::Mutex;

/// How many recently reaped exits are remembered for late subscribers.
/// Covers the window between a helper's spawn and its await registration.
const RECENT_EXIT_CAPACITY: usize = 64;

/// One supervised child.
#[derive(Debug, Clone, Copy)]
pub struct ChildEntry {
    pub pid: i32,
    pub tracked: bool,
}

/// Thread-safe pid-keyed table of children.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    inner: Mutex<HashMap<i32, ChildEntry>>,
    waiters: Mutex<HashMap<i32, mpsc::Sender<i32>>>,
    recent_exits: Mutex<VecDeque<(i32, i32)>>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pid: i32, tracked: bool) {
        let mut table = self.inner.lock().expect("child registry poisoned");
        table.insert(pid, ChildEntry { pid, tracked });
    }

    /// Remove and return the entry for `pid`, if registered.
    pub fn remove(&self, pid: i32) -> Option<ChildEntry> {
        let mut table = self.inner.lock().expect("child registry poisoned");
        table.remove(&pid)
    }

    /// True when any tracked child remains.
    pub fn has_tracked(&self) -> bool {
        let table = self.inner.lock().expect("child registry poisoned");
        table.values().any(|entry| entry.tracked)
    }

    /// Snapshot of all registered pids.
    pub fn pids(&self) -> Vec<i32> {
        let table = self.inner.lock().expect("child registry poisoned");
        table.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        let table = self.inner.lock().expect("child registry poisoned");
        table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to the exit status of `pid`. Returns immediately when the
    /// reaper already processed that pid.
    pub fn await_exit(&self, pid: i32) -> mpsc::Receiver<i32> {
        let (tx, rx) = mpsc::channel();
        {
            let recent = self.recent_exits.lock().expect("recent exits poisoned");
            if let Some(&(_, status)) = recent.iter().find(|(p, _)| *p == pid) {
                let _ = tx.send(status);
                return rx;
            }
        }
        let mut waiters = self.waiters.lock().expect("waiters poisoned");
        waiters.insert(pid, tx);
        rx
    }

    /// Called by the reaper for every reaped child.
    pub fn notify_exit(&self, pid: i32, status: i32) {
        let waiter = {
            let mut waiters = self.waiters.lock().expect("waiters poisoned");
            waiters.remove(&pid)
        };
        if let Some(tx) = waiter {
            let _ = tx.send(status);
            return;
        }
        let mut recent = self.recent_exits.lock().expect("recent exits poisoned");
        if recent.len() == RECENT_EXIT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back((pid, status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let registry = ChildRegistry::new();
        registry.insert(100, true);
        registry.insert(101, false);
        assert_eq!(registry.len(), 2);

        let entry = registry.remove(100).expect("entry");
        assert!(entry.tracked);
        assert_eq!(entry.pid, 100);
        assert!(registry.remove(100).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_has_tracked_ignores_auxiliaries() {
        let registry = ChildRegistry::new();
        registry.insert(200, false);
        registry.insert(201, false);
        assert!(!registry.has_tracked());

        registry.insert(202, true);
        assert!(registry.has_tracked());

        registry.remove(202);
        assert!(!registry.has_tracked());
    }

    #[test]
    fn test_pids_snapshot() {
        let registry = ChildRegistry::new();
        registry.insert(1, true);
        registry.insert(2, false);
        let mut pids = registry.pids();
        pids.sort_unstable();
        assert_eq!(pids, vec![1, 2]);
    }

    #[test]
    fn test_await_before_exit() {
        let registry = ChildRegistry::new();
        let rx = registry.await_exit(321);
        registry.notify_exit(321, 0);
        assert_eq!(rx.recv().expect("status"), 0);
    }

    #[test]
    fn test_await_after_exit_sees_recent() {
        let registry = ChildRegistry::new();
        registry.notify_exit(322, 7);
        let rx = registry.await_exit(322);
        assert_eq!(rx.recv().expect("status"), 7);
    }

    #[test]
    fn test_recent_exits_bounded() {
        let registry = ChildRegistry::new();
        for pid in 0..(RECENT_EXIT_CAPACITY as i32 + 10) {
            registry.notify_exit(pid, 0);
        }
        let recent = registry.recent_exits.lock().expect("lock");
        assert_eq!(recent.len(), RECENT_EXIT_CAPACITY);
        assert_eq!(recent.front().map(|&(p, _)| p), Some(10));
    }
}

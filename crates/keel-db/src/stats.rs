//! Lifecycle counters kept by every manager.

use std::sync::atomic::{AtomicU64, Ordering};

/// A snapshot of a manager's lifecycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Successful `connect` calls.
    pub connects: u64,
    /// Successful `disconnect` calls.
    pub disconnects: u64,
    /// Connection scopes handed out.
    pub acquired: u64,
    /// Connection scopes returned to the pool.
    pub released: u64,
    /// Transaction scopes that committed.
    pub commits: u64,
    /// Transaction scopes that rolled back.
    pub rollbacks: u64,
}

impl ManagerStats {
    /// Connection scopes currently checked out.
    pub fn in_use(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    connects: AtomicU64,
    disconnects: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl Counters {
    pub(crate) fn connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn disconnected(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn committed(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rolled_back(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ManagerStats {
        ManagerStats {
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

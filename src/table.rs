/*!
 * Connection Table
 *
 * Per-worker registry of live connections: an fd-ordered map plus a second
 * map of the same shape holding the monitor-mode subset. A connection is
 * in exactly one of the two. The idle scan resumes after the fd it stopped
 * at last tick, which is why the maps must be ordered; a hash table would
 * break the round-robin coverage.
 *
 * The Worker wraps the whole table in one mutex; nothing here locks.
 */

use crate::conn::Connection;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Per-tick idle-scan budget: bounds lock hold time no matter how many
/// connections a worker carries.
pub const IDLE_SCAN_BUDGET: usize = 50;

#[derive(Default)]
pub struct ConnectionTable {
    conns: BTreeMap<RawFd, Arc<Connection>>,
    monitor_conns: BTreeMap<RawFd, Arc<Connection>>,
    /// fd of the last connection visited by the previous idle scan
    last_scan_fd: RawFd,
}

impl ConnectionTable {
    pub fn new() -> ConnectionTable {
        ConnectionTable::default()
    }

    /// Look up a connection in either map.
    pub fn get(&self, fd: RawFd) -> Option<&Arc<Connection>> {
        self.conns.get(&fd).or_else(|| self.monitor_conns.get(&fd))
    }

    /// Look up a connection in the normal map only.
    pub fn get_normal(&self, fd: RawFd) -> Option<&Arc<Connection>> {
        self.conns.get(&fd)
    }

    pub fn contains_normal(&self, fd: RawFd) -> bool {
        self.conns.contains_key(&fd)
    }

    pub fn insert_normal(&mut self, fd: RawFd, conn: Arc<Connection>) {
        self.conns.insert(fd, conn);
    }

    /// Remove by fd from whichever map holds it.
    ///
    /// Returns the connection and whether it was a monitor.
    pub fn remove(&mut self, fd: RawFd) -> Option<(Arc<Connection>, bool)> {
        if let Some(c) = self.conns.remove(&fd) {
            return Some((c, false));
        }
        self.monitor_conns.remove(&fd).map(|c| (c, true))
    }

    /// Remove by fd only if the stored connection's id matches.
    ///
    /// The id check defends against the fd having been recycled by a newer
    /// connection between scan and removal.
    pub fn remove_by_id(&mut self, fd: RawFd, id: u64) -> Option<(Arc<Connection>, bool)> {
        if self.conns.get(&fd).is_some_and(|c| c.id() == id) {
            return self.conns.remove(&fd).map(|c| (c, false));
        }
        if self.monitor_conns.get(&fd).is_some_and(|c| c.id() == id) {
            return self.monitor_conns.remove(&fd).map(|c| (c, true));
        }
        None
    }

    /// Move a connection from the normal map to the monitor map.
    ///
    /// Returns false when the fd is not in the normal map (unknown, or
    /// already a monitor), in which case nothing changes.
    pub fn promote_to_monitor(&mut self, fd: RawFd) -> bool {
        match self.conns.remove(&fd) {
            Some(c) => {
                self.monitor_conns.insert(fd, c);
                true
            }
            None => false,
        }
    }

    pub fn normal_len(&self) -> usize {
        self.conns.len()
    }

    pub fn len(&self) -> usize {
        self.conns.len() + self.monitor_conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty() && self.monitor_conns.is_empty()
    }

    /// Iterate the normal map in ascending fd order.
    pub fn iter_normal(&self) -> impl Iterator<Item = (&RawFd, &Arc<Connection>)> {
        self.conns.iter()
    }

    /// Iterate the monitor map in ascending fd order.
    pub fn iter_monitors(&self) -> impl Iterator<Item = (&RawFd, &Arc<Connection>)> {
        self.monitor_conns.iter()
    }

    /// Every fd across both maps.
    pub fn all_fds(&self) -> Vec<RawFd> {
        self.conns.keys().chain(self.monitor_conns.keys()).copied().collect()
    }

    /// One idle-scan window over the normal map.
    ///
    /// Visits at most `budget` entries in ascending fd order, starting at
    /// the first fd past the previous window and wrapping at the end.
    /// Returns the `(fd, id)` pairs whose idle time has reached `timeout`;
    /// the caller removes them after releasing the table lock. The cursor
    /// advances to the last entry visited, so consecutive windows cover
    /// the table fairly even under churn.
    pub fn collect_idle(&mut self, timeout: u64, budget: usize) -> Vec<(RawFd, u64)> {
        let window: Vec<(RawFd, u64, u64)> = self
            .conns
            .range((Excluded(self.last_scan_fd), Unbounded))
            .chain(self.conns.range(..=self.last_scan_fd))
            .take(budget)
            .map(|(fd, c)| (*fd, c.id(), c.idle_secs()))
            .collect();

        if let Some((fd, _, _)) = window.last() {
            self.last_scan_fd = *fd;
        }

        window
            .into_iter()
            .filter(|(_, _, idle)| *idle >= timeout)
            .map(|(fd, id, _)| (fd, id))
            .collect()
    }
}

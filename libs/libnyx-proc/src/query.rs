//! Identity queries and the process directory
//!
//! Reads of the caller's own slot go straight to the table; anything else
//! takes the table lock first.

use tracing::{error, warn};

use crate::context::ProcessContext;
use crate::error::{Errno, Result};
use crate::table::{Pid, ProcessRecord, SharedTable, TableGuard};

impl ProcessContext {
    pub fn getpid(&self) -> Pid {
        self.pid()
    }

    /// One execution context per slot, so the thread id is the pid
    pub fn gettid(&self) -> Pid {
        self.pid()
    }

    pub fn getppid(&self) -> Pid {
        self.own_record().map(|r| r.ppid).unwrap_or(0)
    }

    pub fn getsid(&self) -> Pid {
        self.own_record().map(|r| r.sid).unwrap_or(0)
    }

    /// Process group of `pid`; 0 means the caller
    pub fn getpgid(&self, pid: Pid) -> std::result::Result<Pid, Errno> {
        let pid = if pid == 0 { self.pid() } else { pid };
        self.lookup(pid).map(|r| r.pgid)
    }

    pub fn getpgrp(&self) -> std::result::Result<Pid, Errno> {
        self.getpgid(self.pid())
    }

    /// Accepted without effect
    pub fn setpgid(&self, pid: Pid, pgid: Pid) {
        warn!("setpgid({}, {}) not propagated", pid, pgid);
    }

    /// Accepted without effect
    pub fn setsid(&self) {
        warn!("setsid() not implemented");
    }

    /// Whether `pid` names a live process
    pub fn table_exists(&self, pid: Pid) -> bool {
        self.table().exists(pid).unwrap_or_else(|e| {
            error!("Process table unavailable: {}", e);
            false
        })
    }

    /// Copy of the record for `pid`
    pub fn snapshot(&self, pid: Pid) -> std::result::Result<ProcessRecord, Errno> {
        self.lookup(pid)
    }

    fn lookup(&self, pid: Pid) -> std::result::Result<ProcessRecord, Errno> {
        if pid == self.pid() {
            return self.own_record().map_err(|_| Errno::ESRCH);
        }
        let guard = self.table().lock().map_err(|e| {
            error!("Process table unavailable: {}", e);
            Errno::ESRCH
        })?;
        guard.get(pid).ok_or(Errno::ESRCH)
    }
}

/// Kind of a directory entry handed to the virtual filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
}

/// One entry of the process directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcDirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub pid: Pid,
}

/// Enumeration of live pids for a `/proc`-style directory.
///
/// Holds the table lock from [`begin`](Self::begin) until it is dropped or
/// [`end`](Self::end) is called, so keep the iteration short.
pub struct ProcDir<'a> {
    guard: TableGuard<'a>,
    cursor: usize,
}

impl<'a> ProcDir<'a> {
    /// Start an iteration
    pub fn begin(table: &'a SharedTable) -> Result<Self> {
        Ok(Self {
            guard: table.lock()?,
            cursor: 0,
        })
    }

    /// Next live slot at or after `cursor`, with the cursor to resume from.
    /// `None` marks the end of the table.
    pub fn step(&self, cursor: usize) -> Option<(ProcDirEntry, usize)> {
        let pid = self.guard.next_live(cursor)?;
        let entry = ProcDirEntry {
            name: pid.to_string(),
            kind: EntryKind::Directory,
            pid,
        };
        Some((entry, pid as usize + 1))
    }

    /// Record behind an entry, read under the iteration's lock
    pub fn record(&self, pid: Pid) -> Option<ProcessRecord> {
        self.guard.get(pid)
    }

    /// Finish the iteration and release the lock
    pub fn end(self) {}
}

impl Iterator for ProcDir<'_> {
    type Item = ProcDirEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let (entry, next) = self.step(self.cursor)?;
        self.cursor = next;
        Some(entry)
    }
}

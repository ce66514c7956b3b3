//! Shared process table
//!
//! A fixed array of process records in a region mapped by every instance.
//! Slot 0 is never used; a pid is an index into the array.
//!
//! Locking: take [`SharedTable::lock`] before any write to the table and
//! before reading any slot other than your own. Only the owner reads its
//! own slot without the lock.

use std::mem;
use tracing::{error, info};

use crate::config::ProcConfig;
use crate::error::{Errno, ProcError, Result};
use crate::shm::{LockGuard, NamedLock, Plain, SharedRegion};
use crate::signal::SigWrite;

/// Emulated process identifier
pub type Pid = i32;

/// The permanent init process
pub const INIT_PID: Pid = 1;

const TABLE_MAGIC: u32 = 0x5058_594e; // "NYXP"

const STATUS_NOT_EXIST: u32 = 0;
const STATUS_RUNNING: u32 = 1;

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
struct RawHeader {
    magic: u32,
    capacity: u32,
    last_allocated_pid: i32,
    _reserved: u32,
}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
struct RawRecord {
    status: u32,
    native_pid: u32,
    pgid: i32,
    ppid: i32,
    sid: i32,
    _reserved: u32,
    sigwrite: u64,
}

unsafe impl Plain for RawHeader {}
unsafe impl Plain for RawRecord {}

const HEADER_SIZE: usize = mem::size_of::<RawHeader>();
const RECORD_SIZE: usize = mem::size_of::<RawRecord>();

/// Contents of a RUNNING slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessRecord {
    /// Host process identifier (0 for init)
    pub native_pid: u32,
    pub pgid: Pid,
    pub ppid: Pid,
    pub sid: Pid,
    /// Signal delivery handle, if the process has published one
    pub sigwrite: Option<SigWrite>,
}

impl ProcessRecord {
    /// The synthesized init record
    pub fn init() -> Self {
        Self {
            native_pid: 0,
            pgid: INIT_PID,
            ppid: 0,
            sid: INIT_PID,
            sigwrite: None,
        }
    }

    fn from_raw(raw: RawRecord) -> Option<Self> {
        if raw.status == STATUS_NOT_EXIST {
            return None;
        }
        Some(Self {
            native_pid: raw.native_pid,
            pgid: raw.pgid,
            ppid: raw.ppid,
            sid: raw.sid,
            sigwrite: SigWrite::from_raw(raw.sigwrite),
        })
    }

    fn to_raw(self) -> RawRecord {
        RawRecord {
            status: STATUS_RUNNING,
            native_pid: self.native_pid,
            pgid: self.pgid,
            ppid: self.ppid,
            sid: self.sid,
            _reserved: 0,
            sigwrite: self.sigwrite.map(SigWrite::as_raw).unwrap_or(0),
        }
    }
}

/// Handle to the process table shared by all instances
pub struct SharedTable {
    region: SharedRegion,
    lock: NamedLock,
    capacity: usize,
}

impl SharedTable {
    /// Bind to the table named by `config`, creating it on first use
    pub fn open(config: &ProcConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ProcError::Layout(e.to_string()))?;

        let capacity = config.table_capacity;
        let lock = NamedLock::open(&config.lock_path())?;

        let region = {
            let _guard = lock.acquire()?;
            let (region, created) =
                SharedRegion::open_or_create(&config.region_path(), region_len(capacity))?;

            let header: RawHeader = region.read(0);
            if header.magic == 0 {
                region.write(
                    0,
                    RawHeader {
                        magic: TABLE_MAGIC,
                        capacity: capacity as u32,
                        last_allocated_pid: 0,
                        _reserved: 0,
                    },
                );
                info!(
                    "Initialized process table {} ({} slots, created={})",
                    region.path().display(),
                    capacity,
                    created
                );
            } else if header.magic != TABLE_MAGIC || header.capacity as usize != capacity {
                return Err(ProcError::Layout(format!(
                    "{} has magic {:#x} capacity {}, expected {:#x} capacity {}",
                    region.path().display(),
                    header.magic,
                    header.capacity,
                    TABLE_MAGIC,
                    capacity
                )));
            }
            region
        };

        Ok(Self {
            region,
            lock,
            capacity,
        })
    }

    /// Number of slots, including slot 0
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take the cross-process lock
    pub fn lock(&self) -> Result<TableGuard<'_>> {
        let lock = self.lock.acquire()?;
        Ok(TableGuard {
            table: self,
            _lock: lock,
        })
    }

    /// Whether `pid` names a live slot. Out-of-range pids do not exist.
    pub fn exists(&self, pid: Pid) -> Result<bool> {
        Ok(self.lock()?.exists(pid))
    }

    /// Lock-free read of the caller's own slot.
    ///
    /// Only valid for the pid owned by the calling instance; every other
    /// slot must be read through a [`TableGuard`].
    pub(crate) fn own_record(&self, own_pid: Pid) -> Option<ProcessRecord> {
        let offset = self.offset(own_pid)?;
        ProcessRecord::from_raw(self.region.read(offset))
    }

    fn offset(&self, pid: Pid) -> Option<usize> {
        if pid <= 0 || pid as usize >= self.capacity {
            return None;
        }
        Some(HEADER_SIZE + pid as usize * RECORD_SIZE)
    }
}

fn region_len(capacity: usize) -> usize {
    HEADER_SIZE + capacity * RECORD_SIZE
}

/// Exclusive access to the table; the lock is released on drop
pub struct TableGuard<'a> {
    table: &'a SharedTable,
    _lock: LockGuard<'a>,
}

impl TableGuard<'_> {
    /// Reserve a free pid with a rotating scan.
    ///
    /// The scan starts right after the last allocated pid and wraps past the
    /// end of the table back to 1. The slot stays NOT_EXIST until the caller
    /// stores a record in it.
    pub fn alloc(&mut self) -> Result<Pid> {
        let capacity = self.table.capacity;
        let mut header: RawHeader = self.table.region.read(0);
        let last = header.last_allocated_pid as usize;

        for i in 1..capacity {
            let mut cur = last + i;
            if cur >= capacity {
                cur -= capacity - 1;
            }
            let pid = cur as Pid;
            if !self.exists(pid) {
                header.last_allocated_pid = pid;
                self.table.region.write(0, header);
                return Ok(pid);
            }
        }

        error!("Process table full ({} slots)", capacity);
        Err(ProcError::TableFull { capacity })
    }

    /// Record of a live pid
    pub fn get(&self, pid: Pid) -> Option<ProcessRecord> {
        let offset = self.table.offset(pid)?;
        ProcessRecord::from_raw(self.table.region.read(offset))
    }

    /// Whether `pid` names a live slot
    pub fn exists(&self, pid: Pid) -> bool {
        self.get(pid).is_some()
    }

    /// Mark `pid` RUNNING with `record`
    pub fn insert(&mut self, pid: Pid, record: ProcessRecord) -> Result<()> {
        let offset = self.table.offset(pid).ok_or(Errno::ESRCH)?;
        self.table.region.write(offset, record.to_raw());
        Ok(())
    }

    /// Return `pid` to NOT_EXIST
    pub fn release(&mut self, pid: Pid) {
        if let Some(offset) = self.table.offset(pid) {
            self.table.region.write(offset, RawRecord::default());
        }
    }

    /// Attach a signal delivery handle to a live slot
    pub fn set_sigwrite(&mut self, pid: Pid, sigwrite: Option<SigWrite>) -> Result<()> {
        let mut record = self.get(pid).ok_or(Errno::ESRCH)?;
        record.sigwrite = sigwrite;
        self.insert(pid, record)
    }

    /// Move every live record whose parent is `from` under `to`.
    /// Returns how many records changed.
    pub fn reparent(&mut self, from: Pid, to: Pid) -> usize {
        let mut moved = 0;
        for pid in (1..self.table.capacity).map(|i| i as Pid) {
            match self.get(pid) {
                Some(mut record) if record.ppid == from && pid != from => {
                    record.ppid = to;
                    if self.insert(pid, record).is_ok() {
                        moved += 1;
                    }
                }
                _ => {}
            }
        }
        moved
    }

    /// Last pid handed out by [`alloc`](Self::alloc), 0 if none yet
    pub fn last_allocated(&self) -> Pid {
        self.table.region.read::<RawHeader>(0).last_allocated_pid
    }

    /// First live pid at or after `cursor`
    pub fn next_live(&self, cursor: usize) -> Option<Pid> {
        (cursor.max(1)..self.table.capacity)
            .map(|i| i as Pid)
            .find(|&pid| self.exists(pid))
    }

    /// Number of live slots
    pub fn live_count(&self) -> usize {
        (1..self.table.capacity)
            .filter(|&i| self.exists(i as Pid))
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity
    }
}

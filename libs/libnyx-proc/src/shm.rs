//! Cross-process shared memory and locking
//!
//! Every emulated process is its own host process, so the process table
//! cannot live behind an in-process mutex. The region is a file mapped
//! `MAP_SHARED` by every instance, and the lock is an exclusive `flock`
//! on a second file with a well-known name.

use fs2::FileExt;
use memmap2::MmapMut;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// Types that may be copied in and out of the shared region byte-for-byte.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no pointers and accept every
/// bit pattern as a valid value.
pub(crate) unsafe trait Plain: Copy {}

/// A fixed-size memory region visible to every instance
pub struct SharedRegion {
    map: MmapMut,
    base: NonNull<u8>,
    path: PathBuf,
}

// The mapping is owned by the region and only touched through volatile
// accesses made while the table lock is held, or on the caller's own slot.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Map the region at `path`, creating it zero-filled if it does not exist.
    ///
    /// Returns the region and whether this call created it. Creation is
    /// idempotent: later callers map the same file instead of recreating it.
    pub fn open_or_create(path: &Path, len: usize) -> io::Result<(Self, bool)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let current = file.metadata()?.len();
        let created = current == 0;
        if created {
            file.set_len(len as u64)?;
            debug!("Created shared region {} ({} bytes)", path.display(), len);
        } else if current != len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} is {} bytes, expected {}",
                    path.display(),
                    current,
                    len
                ),
            ));
        }

        // SAFETY: the file stays open for the lifetime of the mapping and is
        // never truncated by this crate once it has its final length.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "null mapping"))?;

        Ok((
            Self {
                map,
                base,
                path: path.to_path_buf(),
            },
            created,
        ))
    }

    /// Region size in bytes
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the region is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a value at `offset`
    pub(crate) fn read<T: Plain>(&self, offset: usize) -> T {
        self.check_bounds::<T>(offset);
        // SAFETY: bounds checked above, T is Plain, offsets used by the table
        // are multiples of the record alignment and the mapping is page aligned.
        unsafe { ptr::read_volatile(self.base.as_ptr().add(offset) as *const T) }
    }

    /// Write a value at `offset`
    pub(crate) fn write<T: Plain>(&self, offset: usize, value: T) {
        self.check_bounds::<T>(offset);
        // SAFETY: see `read`.
        unsafe { ptr::write_volatile(self.base.as_ptr().add(offset) as *mut T, value) }
    }

    fn check_bounds<T>(&self, offset: usize) {
        assert!(
            offset % mem::align_of::<T>() == 0 && offset + mem::size_of::<T>() <= self.map.len(),
            "shared region access out of bounds: offset {} len {}",
            offset,
            self.map.len()
        );
    }
}

/// A system-wide mutual exclusion primitive bound by name
pub struct NamedLock {
    file: File,
    path: PathBuf,
    held: AtomicBool,
}

impl NamedLock {
    /// Bind to the lock at `path`, creating the lock file if needed
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            held: AtomicBool::new(false),
        })
    }

    /// Block until the lock is owned by this instance.
    ///
    /// The lock is not reentrant: acquiring it again while a guard is alive
    /// fails instead of silently nesting.
    pub fn acquire(&self) -> io::Result<LockGuard<'_>> {
        if self.held.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{} is already held by this instance", self.path.display()),
            ));
        }

        if let Err(e) = FileExt::lock_exclusive(&self.file) {
            self.held.store(false, Ordering::Release);
            return Err(e);
        }

        trace!("Acquired {}", self.path.display());
        Ok(LockGuard { lock: self })
    }

    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Ownership of a [`NamedLock`]; released on drop
pub struct LockGuard<'a> {
    lock: &'a NamedLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock.file) {
            tracing::error!("Failed to release {}: {}", self.lock.path.display(), e);
        }
        self.lock.held.store(false, Ordering::Release);
        trace!("Released {}", self.lock.path.display());
    }
}

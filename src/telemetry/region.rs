//! Attached shared region
//!
//! Typed view over the memory-mapped backing file. The first process to
//! attach sizes the file and initialises counters and lock; an exclusive
//! `flock` on the backing file serialises that step, and a zero-length file
//! is what marks "not yet initialised".

use std::{
    fs::{File, OpenOptions},
    io,
    ops::{Deref, DerefMut},
    os::unix::{
        fs::{MetadataExt, OpenOptionsExt},
        io::AsRawFd,
    },
    path::Path,
    ptr::{self, NonNull},
};

use memmap2::MmapMut;

use super::error::TelemetryError;
use super::layout::{NexthopTable, SharedTable, SHARED_TABLE_SIZE};
use super::lock::ProcessMutex;

pub(crate) struct SharedRegion {
    // Keeps the mapping alive; all access goes through `base`.
    _map: MmapMut,
    base: NonNull<SharedTable>,
    lock: ProcessMutex,
    identity: (u64, u64),
}

// The region is only touched through the process-shared mutex.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create or attach; returns whether this call initialised the region
    pub(crate) fn open(path: &Path) -> Result<(Self, bool), TelemetryError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .open(path)
            .map_err(|e| TelemetryError::io("open", e))?;

        let _init_guard = FileLock::exclusive(&file).map_err(|e| TelemetryError::io("flock", e))?;

        let meta = file.metadata().map_err(|e| TelemetryError::io("fstat", e))?;
        let created = meta.len() == 0;
        if created {
            file.set_len(SHARED_TABLE_SIZE as u64)
                .map_err(|e| TelemetryError::io("ftruncate", e))?;
        } else if meta.len() != SHARED_TABLE_SIZE as u64 {
            return Err(TelemetryError::SizeMismatch {
                expected: SHARED_TABLE_SIZE as u64,
                found: meta.len(),
            });
        }

        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| TelemetryError::io("mmap", e))?;
        let base = NonNull::new(map.as_mut_ptr() as *mut SharedTable).ok_or_else(|| {
            TelemetryError::io("mmap", io::Error::new(io::ErrorKind::Other, "null mapping"))
        })?;
        let lock = unsafe { ProcessMutex::from_raw(ptr::addr_of_mut!((*base.as_ptr()).lock)) };

        let region = Self {
            _map: map,
            base,
            lock,
            identity: (meta.dev(), meta.ino()),
        };

        if created {
            region.lock.init()?;
            // ftruncate zero-fills; counters are reset explicitly all the same.
            unsafe {
                let table = region.table_ptr();
                (*table).nh_count = 0;
                (*table).sequence = 0;
                (*table).padding = 0;
            }
        }

        Ok((region, created))
    }

    #[inline]
    fn table_ptr(&self) -> *mut NexthopTable {
        unsafe { ptr::addr_of_mut!((*self.base.as_ptr()).table) }
    }

    /// True while `path` still names the object this region maps
    pub(crate) fn is_current(&self, path: &Path) -> bool {
        match std::fs::metadata(path) {
            Ok(meta) => {
                (meta.dev(), meta.ino()) == self.identity
                    && meta.len() == SHARED_TABLE_SIZE as u64
            }
            Err(_) => false,
        }
    }

    /// Take the cross-process lock for the lifetime of the guard
    pub(crate) fn lock(&self) -> Result<TableGuard<'_>, TelemetryError> {
        self.lock.lock()?;
        Ok(TableGuard { region: self })
    }

    /// Destroy the shared mutex; only on teardown
    pub(crate) fn destroy_lock(&self) {
        self.lock.destroy();
    }
}

/// Exclusive access to the table body; unlocks on drop
pub(crate) struct TableGuard<'a> {
    region: &'a SharedRegion,
}

impl Deref for TableGuard<'_> {
    type Target = NexthopTable;

    fn deref(&self) -> &NexthopTable {
        unsafe { &*self.region.table_ptr() }
    }
}

impl DerefMut for TableGuard<'_> {
    fn deref_mut(&mut self) -> &mut NexthopTable {
        unsafe { &mut *self.region.table_ptr() }
    }
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        self.region.lock.unlock();
    }
}

/// Advisory whole-file lock held while a region is being initialised
struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File) -> io::Result<Self> {
        loop {
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                return Ok(Self { file });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

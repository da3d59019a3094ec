// Softcam shared memory region - one memory-mapped file per named frame buffer
use crate::error::{SoftcamError, SoftcamResult};
use crate::memory::platform::{lock_path, region_path};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::time::Duration;

#[cfg(not(unix))]
const LOCK_RETRY: Duration = Duration::from_millis(5);

// A lock file older than this belongs to a process that died holding it
#[cfg(not(unix))]
const LOCK_ABANDONED_AFTER: Duration = Duration::from_secs(2);

/// Named shared memory region backed by a file under the shm base directory
///
/// The creating side is the owner: when an owned region is dropped its name is
/// unlinked, so later `open` calls fail while processes that still map the
/// region keep their mapping.
#[derive(Debug)]
pub struct ShmRegion {
    _mmap: MmapMut,
    base: NonNull<u8>,
    size: usize,
    path: PathBuf,
    lock_path: PathBuf,
    file: File,
    name: String,
    owner: bool,
}

impl ShmRegion {
    /// Create a new region, failing with `AlreadyExists` if the name is taken
    pub fn create_exclusive(dir: &Path, name: &str, size: usize) -> SoftcamResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = region_path(dir, name);

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(SoftcamError::AlreadyExists(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        // A freshly extended file reads back as zeros, so the header starts zeroed
        if let Err(e) = file.set_len(size as u64) {
            let _ = std::fs::remove_file(&path);
            return Err(e.into());
        }

        let mut mmap = match unsafe { MmapOptions::new().len(size).map_mut(&file) } {
            Ok(mmap) => mmap,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }
        };
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| SoftcamError::corrupt("null mapping"))?;

        Ok(Self {
            _mmap: mmap,
            base,
            size,
            path,
            lock_path: lock_path(dir, name),
            file,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Open an existing region (no creation)
    pub fn open(dir: &Path, name: &str) -> SoftcamResult<Self> {
        let path = region_path(dir, name);

        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SoftcamError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let size = file.metadata()?.len() as usize;
        if size == 0 {
            // Creator has not sized the file yet
            return Err(SoftcamError::NotFound(name.to_string()));
        }

        let mut mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| SoftcamError::corrupt("null mapping"))?;

        Ok(Self {
            _mmap: mmap,
            base,
            size,
            path,
            lock_path: lock_path(dir, name),
            file,
            name: name.to_string(),
            owner: false,
        })
    }

    /// Unlink the name `name` under `dir` if present
    pub fn remove(dir: &Path, name: &str) -> SoftcamResult<()> {
        match std::fs::remove_file(region_path(dir, name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Base address of the mapping; valid for `size()` bytes while `self` lives
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Time since the backing file was last modified
    pub fn age(&self) -> Option<Duration> {
        self.file.metadata().ok()?.modified().ok()?.elapsed().ok()
    }

    /// Whether the name still refers to this mapping's file
    pub fn is_linked(&self) -> bool {
        let Ok(current) = std::fs::metadata(&self.path) else {
            return false;
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            match self.file.metadata() {
                Ok(mine) => mine.dev() == current.dev() && mine.ino() == current.ino(),
                Err(_) => false,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = current;
            true
        }
    }

    /// Release the name so that subsequent opens fail. Mappings stay valid.
    ///
    /// Runs under the region lock so a replacement created by another
    /// producer is never unlinked by the stale owner.
    pub fn unlink(&self) {
        let _lock = match RegionLock::at(self.lock_path.clone()) {
            Ok(lock) => Some(lock),
            Err(e) => {
                log::warn!("Unlinking '{}' without the region lock: {}", self.name, e);
                None
            }
        };
        if !self.is_linked() {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Unlinked shared memory region '{}'", self.name),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "Failed to unlink shared memory region '{}': {}",
                self.name,
                e
            ),
        }
    }

    /// Drop a freshly created region without touching the region lock
    ///
    /// Used on construction failures, which may happen while the caller
    /// already holds that lock.
    pub fn discard(mut self) {
        self.owner = false;
        if self.is_linked() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Exclusive advisory lock on one region name
///
/// Held around probe, removal and re-creation of a stale region, and around
/// unlinking by an owner, so those steps never interleave between producers.
/// Unix takes `flock(LOCK_EX)` on a lock file that is never deleted. Other
/// platforms treat exclusive creation of the lock file as the lock.
pub struct RegionLock {
    _file: File,
    #[cfg(not(unix))]
    path: PathBuf,
}

impl RegionLock {
    /// Block until the lock for region `name` under `dir` is held
    pub fn acquire(dir: &Path, name: &str) -> SoftcamResult<Self> {
        std::fs::create_dir_all(dir)?;
        Self::at(lock_path(dir, name))
    }

    #[cfg(unix)]
    fn at(path: PathBuf) -> SoftcamResult<Self> {
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { _file: file });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }

    #[cfg(not(unix))]
    fn at(path: PathBuf) -> SoftcamResult<Self> {
        let mut start = std::time::Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok(Self { _file: file, path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if start.elapsed() >= LOCK_ABANDONED_AFTER {
                        log::warn!("Breaking abandoned region lock {}", path.display());
                        let _ = std::fs::remove_file(&path);
                        start = std::time::Instant::now();
                    } else {
                        std::thread::sleep(LOCK_RETRY);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(not(unix))]
impl Drop for RegionLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owner {
            self.unlink();
        }
    }
}

// The mapping is shared memory; all cross-thread access goes through atomics
// or through the single-writer pixel protocol of the frame buffer.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let created = ShmRegion::create_exclusive(dir.path(), "cam", 4096).unwrap();
        assert!(created.is_owner());
        assert_eq!(created.size(), 4096);

        unsafe { created.as_ptr().add(10).write(42) };

        let opened = ShmRegion::open(dir.path(), "cam").unwrap();
        assert!(!opened.is_owner());
        assert_eq!(opened.size(), 4096);
        assert_eq!(unsafe { opened.as_ptr().add(10).read() }, 42);
    }

    #[test]
    fn test_create_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let _first = ShmRegion::create_exclusive(dir.path(), "cam", 1024).unwrap();
        let second = ShmRegion::create_exclusive(dir.path(), "cam", 1024);
        assert!(matches!(second, Err(SoftcamError::AlreadyExists(_))));
    }

    #[test]
    fn test_open_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShmRegion::open(dir.path(), "missing");
        assert!(matches!(result, Err(SoftcamError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_owner_drop_unlinks_but_mapping_survives() {
        let dir = tempfile::tempdir().unwrap();
        let created = ShmRegion::create_exclusive(dir.path(), "cam", 1024).unwrap();
        let opened = ShmRegion::open(dir.path(), "cam").unwrap();
        unsafe { created.as_ptr().write(7) };

        drop(created);
        assert!(ShmRegion::open(dir.path(), "cam").is_err());
        assert_eq!(unsafe { opened.as_ptr().read() }, 7);

        // Non-owner drop must not unlink anything
        let again = ShmRegion::create_exclusive(dir.path(), "cam", 1024).unwrap();
        drop(opened);
        assert!(again.is_linked());
    }

    #[test]
    fn test_region_lock_is_exclusive() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let held = AtomicBool::new(false);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..20 {
                        let _lock = RegionLock::acquire(dir.path(), "cam").unwrap();
                        assert!(!held.swap(true, Ordering::SeqCst));
                        std::thread::sleep(Duration::from_micros(200));
                        held.store(false, Ordering::SeqCst);
                    }
                });
            }
        });
    }

    #[test]
    fn test_discard_removes_without_lock() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = RegionLock::acquire(dir.path(), "cam").unwrap();

        let created = ShmRegion::create_exclusive(dir.path(), "cam", 1024).unwrap();
        created.discard();
        assert!(matches!(
            ShmRegion::open(dir.path(), "cam"),
            Err(SoftcamError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_unlink_skips_replaced_file() {
        let dir = tempfile::tempdir().unwrap();
        let old = ShmRegion::create_exclusive(dir.path(), "cam", 1024).unwrap();
        ShmRegion::remove(dir.path(), "cam").unwrap();
        let new = ShmRegion::create_exclusive(dir.path(), "cam", 1024).unwrap();

        assert!(!old.is_linked());
        drop(old);
        assert!(new.is_linked());
        assert!(ShmRegion::open(dir.path(), "cam").is_ok());
    }
}

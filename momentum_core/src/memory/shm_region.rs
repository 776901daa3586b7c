// MOMENTUM Shared Memory Region - one memory-mapped file per stream under the data path
use crate::error::{MomentumError, MomentumResult, ResourceKind};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How many times creation retries after racing with a concurrent `destroy`
const MAX_OPEN_ATTEMPTS: usize = 16;

/// How long an attacher waits for the creator to size a freshly created file
const SIZE_WAIT: Duration = Duration::from_secs(1);

/// Shared memory region backing one stream.
///
/// Every mapping holds a shared `flock` on the backing file for as long as it
/// lives. [`ShmRegion::destroy`] takes the exclusive lock without blocking, so
/// a segment can only be unlinked once no process has it mapped. The kernel
/// drops the lock when a process exits, crashed or not.
#[derive(Debug)]
pub struct ShmRegion {
    mmap: MmapMut,
    size: usize,
    path: PathBuf,
    _file: File,
    name: String,
    owner: bool,
}

impl ShmRegion {
    /// Map the segment `name` under `dir`, creating it with `size` bytes if absent.
    ///
    /// A freshly created file reads as zeroes, so the creator does not need to
    /// clear it. `is_owner()` tells whether this call created the segment.
    pub fn open_or_create(dir: &Path, name: &str, size: usize) -> MomentumResult<Self> {
        if size == 0 {
            return Err(MomentumError::invalid_input(
                "shared memory region size must be non-zero",
            ));
        }
        fs::create_dir_all(dir)?;
        let path = dir.join(name);

        for _ in 0..MAX_OPEN_ATTEMPTS {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    lock_shared(&file)?;
                    if !still_linked(&file, &path)? {
                        continue;
                    }
                    file.set_len(size as u64)?;
                    let region = Self::map(file, path, name, size, true)?;
                    log::info!(
                        "SHM: Created segment '{}' ({} bytes) at {}",
                        name,
                        size,
                        region.path.display()
                    );
                    return Ok(region);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match Self::attach(&path, name) {
                        Ok(region) => return Ok(region),
                        // Destroyed between our create attempt and the attach; try again
                        Err(MomentumError::ResourceNotFound { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(MomentumError::busy(format!(
            "segment '{}' is being created and destroyed concurrently",
            name
        )))
    }

    /// Open existing shared memory region (no creation)
    pub fn open(dir: &Path, name: &str) -> MomentumResult<Self> {
        Self::attach(&dir.join(name), name)
    }

    fn attach(path: &Path, name: &str) -> MomentumResult<Self> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MomentumError::not_found(ResourceKind::Stream, name));
            }
            Err(e) => return Err(e.into()),
        };

        lock_shared(&file)?;
        if !still_linked(&file, path)? {
            return Err(MomentumError::not_found(ResourceKind::Stream, name));
        }

        // The creator sizes the file right after creating it
        let deadline = Instant::now() + SIZE_WAIT;
        let size = loop {
            let len = file.metadata()?.len() as usize;
            if len > 0 {
                break len;
            }
            if Instant::now() >= deadline {
                return Err(MomentumError::invalid_segment(name, "segment file is empty"));
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        let region = Self::map(file, path.to_path_buf(), name, size, false)?;
        log::debug!("SHM: Attached to segment '{}' ({} bytes)", name, size);
        Ok(region)
    }

    fn map(file: File, path: PathBuf, name: &str, size: usize, owner: bool) -> MomentumResult<Self> {
        // SAFETY: the file stays open (and locked) for the lifetime of the mapping.
        // Concurrent modification by other processes is the point of the region;
        // all shared fields are accessed through atomics.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };

        Ok(Self {
            mmap,
            size,
            path,
            _file: file,
            name: name.to_string(),
            owner,
        })
    }

    /// Unmap the region for this process only
    pub fn close(self) {
        log::debug!("SHM: Detached from segment '{}'", self.name);
    }

    /// Remove the segment `name` under `dir`.
    ///
    /// Fails with `ResourceBusy` if any process (including this one) still has
    /// it mapped.
    pub fn destroy(dir: &Path, name: &str) -> MomentumResult<()> {
        let path = dir.join(name);
        let file = match OpenOptions::new().read(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MomentumError::not_found(ResourceKind::Stream, name));
            }
            Err(e) => return Err(e.into()),
        };

        if !try_lock_exclusive(&file)? {
            return Err(MomentumError::busy(format!(
                "stream '{}' is still attached by another process",
                name
            )));
        }

        // Unlink while holding the exclusive lock; attachers that opened the
        // old file notice the inode change once they get their shared lock.
        fs::remove_file(&path)?;
        log::info!("SHM: Destroyed segment '{}'", name);
        Ok(())
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Base pointer for writes through shared memory.
    ///
    /// Writes go through raw pointers guarded by slot ownership, so this only
    /// needs `&self`.
    pub fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
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
}

// Thread safety
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor is owned by `file` and valid for the call
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn lock_shared(file: &File) -> io::Result<()> {
    flock(file, libc::LOCK_SH)
}

fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    match flock(file, libc::LOCK_EX | libc::LOCK_NB) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

/// True if `path` still names the file behind `file`
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.ino() == held.ino() && current.dev() == held.dev()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_attach() {
        let dir = tempfile::tempdir().unwrap();

        let created = ShmRegion::open_or_create(dir.path(), "seg", 4096).unwrap();
        assert!(created.is_owner());
        assert_eq!(created.size(), 4096);

        let attached = ShmRegion::open_or_create(dir.path(), "seg", 4096).unwrap();
        assert!(!attached.is_owner());
        assert_eq!(attached.size(), 4096);

        // Both mappings see the same bytes
        unsafe { *created.base_ptr().add(10) = 42 };
        assert_eq!(unsafe { *attached.as_ptr().add(10) }, 42);
    }

    #[test]
    fn test_destroy_fails_while_mapped() {
        let dir = tempfile::tempdir().unwrap();
        let region = ShmRegion::open_or_create(dir.path(), "busy", 128).unwrap();

        let err = ShmRegion::destroy(dir.path(), "busy").unwrap_err();
        assert!(matches!(err, MomentumError::ResourceBusy(_)));

        region.close();
        ShmRegion::destroy(dir.path(), "busy").unwrap();
        assert!(!dir.path().join("busy").exists());
    }

    #[test]
    fn test_open_and_destroy_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ShmRegion::open(dir.path(), "nope").unwrap_err().is_not_found());
        assert!(ShmRegion::destroy(dir.path(), "nope").unwrap_err().is_not_found());
    }
}

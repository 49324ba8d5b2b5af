//! Named shared memory segments.
//!
//! A [`SharedSegment`] is an owned, mapped view of a named POSIX shared
//! memory object. Opening is create-or-attach: the first opener creates and
//! sizes a zero-filled object, later openers attach to the same bytes. The
//! mapping is released on drop; the name outlives the mapping until some
//! process unlinks it.

use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::{close, ftruncate};

use crate::error::Error;

/// Host limit for a shared memory object name (without the leading slash).
pub(crate) const SEGMENT_NAME_MAX: usize = 254;

// An attacher can observe the object between creation and ftruncate; wait
// this long for the creator to size it before giving up.
const SIZE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const SIZE_POLL_ATTEMPTS: u32 = 100;

/// An owned mapping of a named, process-shared byte region.
pub struct SharedSegment {
    name: String,
    ptr: *mut u8,
    len: usize,
    created: bool,
}

// The raw pointer targets a MAP_SHARED region; cross-thread use is guarded
// by the cross-process lock protocol, exactly like cross-process use.
unsafe impl Send for SharedSegment {}

impl SharedSegment {
    /// Create a zero-initialised region of exactly `len` bytes under
    /// `name`, or attach to the existing region of that name.
    ///
    /// The returned `created()` flag is true only when this call performed
    /// the creation.
    pub fn open_or_create(name: &str, len: usize) -> Result<Self, Error> {
        if name.len() > SEGMENT_NAME_MAX {
            return Err(Error::NameTooLong(name.to_string()));
        }
        if len == 0 {
            return Err(Error::SegmentUnavailable {
                name: name.to_string(),
                msg: "refusing to map a zero-length segment".to_string(),
            });
        }

        // POSIX object names carry a leading slash; the wire-level name
        // does not.
        let shm_path = format!("/{}", name);
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;

        let mut attempt = 0;
        let (fd, created) = loop {
            match shm_open(
                shm_path.as_str(),
                OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
                mode,
            ) {
                Ok(fd) => break (fd, true),
                Err(err) if err.as_errno() == Some(Errno::EEXIST) => {
                    match shm_open(shm_path.as_str(), OFlag::O_RDWR, Mode::empty()) {
                        Ok(fd) => break (fd, false),
                        // The object vanished between the two opens; retry
                        // the creation.
                        Err(err) if err.as_errno() == Some(Errno::ENOENT) && attempt < 5 => {
                            attempt += 1;
                        }
                        Err(err) => return Err(map_shm_error(name, err)),
                    }
                }
                Err(err) => return Err(map_shm_error(name, err)),
            }
        };

        let sized = if created {
            ftruncate(fd, len as libc::off_t).map_err(|err| Error::SegmentUnavailable {
                name: name.to_string(),
                msg: format!("ftruncate to {} bytes failed - {}", len, err),
            })
        } else {
            wait_for_size(fd, len, name)
        };
        if let Err(err) = sized {
            let _ = close(fd);
            if created {
                let _ = shm_unlink(shm_path.as_str());
            }
            return Err(err);
        }

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        };
        // The mapping keeps the object alive; the descriptor is no longer
        // needed either way.
        let _ = close(fd);

        let ptr = match ptr {
            Ok(ptr) => ptr as *mut u8,
            Err(err) => {
                if created {
                    let _ = shm_unlink(shm_path.as_str());
                }
                return Err(Error::SegmentUnavailable {
                    name: name.to_string(),
                    msg: format!("mmap of {} bytes failed - {}", len, err),
                });
            }
        };

        if created {
            log::info!("initialized shared segment '{}' ({} bytes)", name, len);
        }

        Ok(Self {
            name: name.to_string(),
            ptr,
            len,
            created,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// True only if this mapping's `open_or_create` created the object.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Remove the object's name. Existing mappings (ours included) stay
    /// valid; the region is reaped once the last mapper exits.
    pub fn unlink(&self) -> Result<(), Error> {
        unlink_segment(&self.name)
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.ptr as *mut libc::c_void, self.len) } {
            log::warn!("munmap of segment '{}' failed - {}", self.name, err);
        }
    }
}

/// Unlink a segment by wire-level name, tolerating a name somebody else
/// already removed.
pub fn unlink_segment(name: &str) -> Result<(), Error> {
    let shm_path = format!("/{}", name);
    match shm_unlink(shm_path.as_str()) {
        Ok(()) => Ok(()),
        Err(err) if err.as_errno() == Some(Errno::ENOENT) => Ok(()),
        Err(err) => Err(map_shm_error(name, err)),
    }
}

fn wait_for_size(fd: std::os::unix::io::RawFd, len: usize, name: &str) -> Result<(), Error> {
    for _ in 0..SIZE_POLL_ATTEMPTS {
        let stat = fstat(fd).map_err(|err| Error::SegmentUnavailable {
            name: name.to_string(),
            msg: format!("fstat failed - {}", err),
        })?;
        if stat.st_size as usize >= len {
            return Ok(());
        }
        std::thread::sleep(SIZE_POLL_INTERVAL);
    }
    Err(Error::SegmentUnavailable {
        name: name.to_string(),
        msg: format!("segment never grew to {} bytes", len),
    })
}

fn map_shm_error(name: &str, err: nix::Error) -> Error {
    if err.as_errno() == Some(Errno::ENAMETOOLONG) {
        Error::NameTooLong(name.to_string())
    } else {
        Error::SegmentUnavailable {
            name: name.to_string(),
            msg: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_name(tag: &str) -> String {
        format!("ipckv_selftest_{}_{}", std::process::id(), tag)
    }

    #[test]
    fn create_then_attach() {
        let name = test_name("create");
        let first = SharedSegment::open_or_create(&name, 4096).unwrap();
        assert!(first.created());
        assert_eq!(first.len(), 4096);

        let second = SharedSegment::open_or_create(&name, 4096).unwrap();
        assert!(!second.created());

        // Both mappings address the same bytes.
        unsafe {
            first.as_ptr().write(0xa5);
            assert_eq!(second.as_ptr().read(), 0xa5);
        }

        first.unlink().unwrap();
    }

    #[test]
    fn creation_zero_fills() {
        let name = test_name("zeroed");
        let seg = SharedSegment::open_or_create(&name, 128).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(seg.as_ptr(), seg.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
        seg.unlink().unwrap();
    }

    #[test]
    fn zero_length_is_rejected() {
        let name = test_name("empty");
        assert!(matches!(
            SharedSegment::open_or_create(&name, 0),
            Err(Error::SegmentUnavailable { .. })
        ));
    }

    #[test]
    fn overlong_name_is_rejected() {
        let name = "s".repeat(SEGMENT_NAME_MAX + 1);
        assert!(matches!(
            SharedSegment::open_or_create(&name, 64),
            Err(Error::NameTooLong(_))
        ));
    }

    #[test]
    fn unlink_is_idempotent() {
        let name = test_name("unlink");
        let seg = SharedSegment::open_or_create(&name, 64).unwrap();
        seg.unlink().unwrap();
        seg.unlink().unwrap();
    }
}

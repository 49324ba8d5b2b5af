//! Cross-process single-writer / multi-reader lock.
//!
//! The lock is addressed purely by name; no per-lock state is shared
//! between processes outside the named objects themselves. It pairs a
//! named counting semaphore of capacity [`MAX_LOCKS`] with a named mutex:
//!
//! - a reader takes one semaphore permit;
//! - a writer serialises on the mutex, then drains every permit, so it
//!   excludes all readers and all other writers.
//!
//! The "named mutex" is an exclusive `flock` on a well-known lock file,
//! which the kernel releases if the holder dies - a crashed writer never
//! wedges later writers. A crashed reader permanently leaks its semaphore
//! permit; that failure mode is accepted.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use nix::fcntl::{flock, FlockArg};

use crate::error::Error;

/// Maximum number of concurrent readers; also the permit count a writer
/// must drain.
pub const MAX_LOCKS: u32 = 24;

/// Host limit for a lock name. Leaves room for the semaphore name prefix
/// and the `_mutex.lck` suffix within the host's 255-byte component limit.
pub(crate) const LOCK_NAME_MAX: usize = 240;

const MUTEX_LOCK_DIR: &str = "/tmp";

/// Acquisition mode, chosen per call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// Thin wrapper over a POSIX named semaphore.
///
/// Raw FFI kept behind a safe surface; `sem_open` with `O_EXCL` first so
/// the caller learns whether this call created the object.
struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
}

impl NamedSemaphore {
    fn open_or_create(name: &str, initial: u32) -> Result<(Self, bool), Error> {
        if name.len() > LOCK_NAME_MAX {
            return Err(Error::NameTooLong(name.to_string()));
        }
        let path = CString::new(format!("/{}", name)).map_err(|_| Error::LockUnavailable {
            name: name.to_string(),
            msg: "name contains an interior NUL".to_string(),
        })?;
        let mode = (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint;

        let mut attempt = 0;
        loop {
            let sem = unsafe {
                libc::sem_open(
                    path.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    mode,
                    initial as libc::c_uint,
                )
            };
            if sem != libc::SEM_FAILED {
                return Ok((
                    Self {
                        sem,
                        name: name.to_string(),
                    },
                    true,
                ));
            }

            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(Error::LockUnavailable {
                    name: name.to_string(),
                    msg: format!("sem_open failed - {}", err),
                });
            }

            let sem = unsafe { libc::sem_open(path.as_ptr(), 0) };
            if sem != libc::SEM_FAILED {
                return Ok((
                    Self {
                        sem,
                        name: name.to_string(),
                    },
                    false,
                ));
            }

            let err = std::io::Error::last_os_error();
            // The semaphore can vanish between the two opens when a
            // resizer abandons a stale generation's lock name.
            if err.raw_os_error() == Some(libc::ENOENT) && attempt < 5 {
                attempt += 1;
                continue;
            }
            return Err(Error::LockUnavailable {
                name: name.to_string(),
                msg: format!("sem_open of existing semaphore failed - {}", err),
            });
        }
    }

    fn wait(&self) -> Result<(), Error> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Error::LockUnavailable {
                name: self.name.clone(),
                msg: format!("sem_wait failed - {}", err),
            });
        }
    }

    fn post(&self) -> Result<(), Error> {
        if unsafe { libc::sem_post(self.sem) } == 0 {
            Ok(())
        } else {
            Err(Error::LockUnavailable {
                name: self.name.clone(),
                msg: format!("sem_post failed - {}", std::io::Error::last_os_error()),
            })
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if unsafe { libc::sem_close(self.sem) } != 0 {
            log::warn!(
                "sem_close of '{}' failed - {}",
                self.name,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Exclusive `flock` on the lock file naming a mutex. Dropping the guard
/// (or the death of the process) releases the lock.
struct NamedMutexGuard {
    file: File,
    name: String,
}

fn mutex_lock_path(mutex_name: &str) -> PathBuf {
    let mut path = PathBuf::from(MUTEX_LOCK_DIR);
    path.push(format!("{}.lck", mutex_name));
    path
}

fn acquire_named_mutex(mutex_name: &str) -> Result<NamedMutexGuard, Error> {
    let path = mutex_lock_path(mutex_name);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| Error::LockUnavailable {
            name: mutex_name.to_string(),
            msg: format!("unable to open lock file {:?} - {}", path, err),
        })?;

    loop {
        match flock(file.as_raw_fd(), FlockArg::LockExclusive) {
            Ok(()) => break,
            Err(err) if err.as_errno() == Some(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                return Err(Error::LockUnavailable {
                    name: mutex_name.to_string(),
                    msg: format!("flock failed - {}", err),
                })
            }
        }
    }

    Ok(NamedMutexGuard {
        file,
        name: mutex_name.to_string(),
    })
}

impl Drop for NamedMutexGuard {
    fn drop(&mut self) {
        if let Err(err) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            log::warn!("unlock of mutex '{}' failed - {}", self.name, err);
        }
    }
}

/// A held read or write lock; released on drop.
pub struct IpcLock {
    sem: NamedSemaphore,
    // Write mode only; dropped after the permits go back.
    mutex: Option<NamedMutexGuard>,
    permits: u32,
}

impl IpcLock {
    /// Acquire the lock named `name` in the given mode, blocking until it
    /// is available.
    pub fn acquire(mode: LockMode, name: &str) -> Result<Self, Error> {
        match mode {
            LockMode::Read => {
                let (sem, _) = NamedSemaphore::open_or_create(name, MAX_LOCKS)?;
                sem.wait()?;
                Ok(Self {
                    sem,
                    mutex: None,
                    permits: 1,
                })
            }
            LockMode::Write => {
                // The mutex serialises writers before any permit draining
                // starts, so two writers never deadlock on partial drains.
                let mutex = acquire_named_mutex(&format!("{}_mutex", name))?;

                let (sem, created) = NamedSemaphore::open_or_create(name, 0)?;
                if !created {
                    // Readers exist or have existed; take every permit.
                    let mut drained = 0;
                    while drained < MAX_LOCKS {
                        if let Err(err) = sem.wait() {
                            for _ in 0..drained {
                                let _ = sem.post();
                            }
                            return Err(err);
                        }
                        drained += 1;
                    }
                }
                // Created fresh at count 0: already fully drained.

                Ok(Self {
                    sem,
                    mutex: Some(mutex),
                    permits: MAX_LOCKS,
                })
            }
        }
    }
}

impl Drop for IpcLock {
    fn drop(&mut self) {
        for _ in 0..self.permits {
            if let Err(err) = self.sem.post() {
                log::warn!("releasing lock '{}' failed - {}", self.sem.name, err);
                break;
            }
        }
        // Release the writer serialisation only once the permits are back.
        drop(self.mutex.take());
    }
}

/// Remove the named objects backing a lock. Existing holders keep their
/// handles; only the names go away.
pub(crate) fn unlink_lock(name: &str) -> Result<(), Error> {
    let path = CString::new(format!("/{}", name)).map_err(|_| Error::LockUnavailable {
        name: name.to_string(),
        msg: "name contains an interior NUL".to_string(),
    })?;
    if unsafe { libc::sem_unlink(path.as_ptr()) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(Error::LockUnavailable {
                name: name.to_string(),
                msg: format!("sem_unlink failed - {}", err),
            });
        }
    }

    let mutex_path = mutex_lock_path(&format!("{}_mutex", name));
    match std::fs::remove_file(&mutex_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::LockUnavailable {
            name: name.to_string(),
            msg: format!("removing lock file {:?} failed - {}", mutex_path, err),
        }),
    }
}

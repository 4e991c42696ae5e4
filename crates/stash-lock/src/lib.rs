//! Cross-process exclusive lock for a shared cache file.
//!
//! Acquisition is two-layered: a cooperative exclusive-create of the lock file
//! (retried on a fixed budget, never fatal), followed by the authoritative OS-level
//! exclusive lock on the same path. Dropping the guard unlocks and removes the file.
//!
//! Holders on the same path never overlap, whether they live in different processes
//! or in different threads of one process. Nesting acquisitions of one path within a
//! single thread is not supported.
//!
//! Because the file is deleted on release, a waiter can end up locking an inode that
//! no longer has a name while a newcomer creates a fresh file at the path. Two rules
//! keep holders apart: a lock only counts once the path still names the locked file,
//! and a releasing holder only unlinks the path after re-taking the lock on the file
//! it names.

use std::{
    env,
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    process, thread,
    time::{Duration, Instant},
};

use fs2::FileExt;
use same_file::Handle;
use thiserror::Error;
use tracing::{debug, warn};

/// Budget for the cooperative lock-file creation step.
pub const DEFAULT_CREATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for taking the OS-level lock once the file is open.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep between attempts in both steps.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("cannot open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("lock on {path} still held by another process after {waited:?}")]
    Timeout { path: PathBuf, waited: Duration },
    #[error("cannot write holder marker to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot unlock {path}: {source}")]
    Unlock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot remove lock file {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Retry budgets for [`CrossProcessLock::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub creation_timeout: Duration,
    pub lock_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            creation_timeout: DEFAULT_CREATION_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A lock scoped to one lock-file path.
#[derive(Debug, Clone)]
pub struct CrossProcessLock {
    path: PathBuf,
    options: LockOptions,
}

impl CrossProcessLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_options(path, LockOptions::default())
    }

    pub fn with_options(path: impl Into<PathBuf>, options: LockOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> LockOptions {
        self.options
    }

    /// Take the lock, returning a guard that releases it on drop.
    ///
    /// Fails only on genuine OS errors or when the OS-level lock stays contended
    /// past `lock_timeout`. A busy lock file during the cooperative step is logged
    /// and tolerated.
    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: self.path.clone(),
                source,
            })?;
        }

        if !self.try_create_lock_file() {
            warn!(path = %self.path.display(), "failed to create lock file");
        }

        let started = Instant::now();
        let file = loop {
            let file = self.open_lock_file()?;
            self.lock_with_retry(&file, started)?;
            let linked = names_file(&self.path, &file).map_err(|source| LockError::Lock {
                path: self.path.clone(),
                source,
            })?;
            if linked {
                break file;
            }
            debug!(
                path = %self.path.display(),
                "lock file was replaced while waiting, trying again"
            );
        };

        let mut guard = LockGuard {
            path: self.path.clone(),
            file: Some(file),
        };
        guard.write_holder()?;
        debug!(path = %self.path.display(), "lock acquired");
        Ok(guard)
    }

    /// Run `f` while holding the lock.
    pub fn with_lock<T>(&self, f: impl FnOnce() -> T) -> Result<T, LockError> {
        let guard = self.acquire()?;
        let out = f();
        guard.release()?;
        Ok(out)
    }

    fn try_create_lock_file(&self) -> bool {
        let deadline = Instant::now() + self.options.creation_timeout;
        while Instant::now() < deadline {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(_) => return true,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(
                        path = %self.path.display(),
                        "lock file exists, trying again after some time"
                    );
                    thread::sleep(self.options.poll_interval);
                }
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        %err,
                        "atomic creation of lock file unavailable"
                    );
                    return false;
                }
            }
        }
        false
    }

    fn open_lock_file(&self) -> Result<File, LockError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| LockError::Open {
                path: self.path.clone(),
                source,
            })
    }

    /// Poll the OS lock until `lock_timeout` has passed since `started`.
    fn lock_with_retry(&self, file: &File, started: Instant) -> Result<(), LockError> {
        loop {
            match FileExt::try_lock_exclusive(file) {
                Ok(()) => return Ok(()),
                Err(err) if is_contended(&err) => {
                    let waited = started.elapsed();
                    if waited >= self.options.lock_timeout {
                        return Err(LockError::Timeout {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                    thread::sleep(self.options.poll_interval);
                }
                Err(source) => {
                    return Err(LockError::Lock {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
    }
}

/// Held lock. Dropping it releases the OS lock and removes the lock file.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    file: Option<File>,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, surfacing errors that drop would only log.
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn write_holder(&mut self) -> Result<(), LockError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let write = |file: &mut File| -> io::Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(holder_marker().as_bytes())?;
            file.flush()
        };
        write(file).map_err(|source| LockError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        FileExt::unlock(&file).map_err(|source| LockError::Unlock {
            path: self.path.clone(),
            source,
        })?;

        // Only a holder may unlink, and only the file it holds.
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if is_contended(&err) => {
                debug!(path = %self.path.display(), "lock already taken by the next holder");
                return Ok(());
            }
            Err(source) => {
                return Err(LockError::Lock {
                    path: self.path.clone(),
                    source,
                })
            }
        }
        let removed = match names_file(&self.path, &file) {
            Ok(true) => fs::remove_file(&self.path),
            Ok(false) => {
                debug!(path = %self.path.display(), "lock file replaced by another process");
                Ok(())
            }
            Err(err) => Err(err),
        };
        drop(file);

        match removed {
            Ok(()) => Ok(()),
            // Another process raced us and removed or re-locked the file.
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                debug!(path = %self.path.display(), %err, "lock file already gone or taken");
                Ok(())
            }
            Err(source) => Err(LockError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(%err, "failed to release lock");
        }
    }
}

/// Whether `path` still names the open `file`. A missing path names nothing.
fn names_file(path: &Path, file: &File) -> io::Result<bool> {
    let held = Handle::from_file(file.try_clone()?)?;
    match Handle::from_path(path) {
        Ok(current) => Ok(current == held),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || (err.raw_os_error().is_some()
            && err.raw_os_error() == fs2::lock_contended_error().raw_os_error())
}

/// `"<pid> <program>"`, informational only.
fn holder_marker() -> String {
    let program = env::args_os()
        .next()
        .map(|arg| arg.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{} {}", process::id(), program)
}

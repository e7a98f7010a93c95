//! Single-instance marker backed by a PID file.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::DaemonError;

/// Whether a process with `pid` exists.
///
/// A process owned by another user still counts as alive.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence and permission.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a portable liveness probe every recorded PID is treated as stale.
#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Exclusive ownership of a PID file.
///
/// Removed again by [`release`](Self::release), or on drop as a fallback.
#[derive(Debug)]
pub struct InstanceMarker {
    path: PathBuf,
    pid: u32,
    held: bool,
}

impl InstanceMarker {
    /// Take the marker at `path` for this process.
    ///
    /// Fails with [`DaemonError::AlreadyRunning`] when the file names a live
    /// process. A file naming a dead process, or holding garbage, is stale
    /// and gets replaced.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, DaemonError> {
        Self::acquire_as(path, std::process::id())
    }

    fn acquire_as(path: impl AsRef<Path>, pid: u32) -> Result<Self, DaemonError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| DaemonError::Marker {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        // Two rounds: the second follows removal of a stale marker.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", pid).map_err(io_err)?;
                    tracing::debug!(path = %path.display(), pid, "instance marker written");
                    return Ok(Self {
                        path: path.clone(),
                        pid,
                        held: true,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match read_pid(&path).map_err(io_err)? {
                        Some(existing) if process_alive(existing) => {
                            return Err(DaemonError::AlreadyRunning { pid: existing });
                        }
                        Some(existing) => {
                            tracing::warn!(path = %path.display(), pid = existing, "removing stale instance marker");
                        }
                        None => {
                            tracing::warn!(path = %path.display(), "removing unreadable instance marker");
                        }
                    }
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(io_err(e)),
                    }
                }
                Err(e) => return Err(io_err(e)),
            }
        }

        // Someone else recreated the file between our removal and retry.
        match read_pid(&path).map_err(io_err)? {
            Some(existing) => Err(DaemonError::AlreadyRunning { pid: existing }),
            None => Err(io_err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "instance marker kept reappearing",
            ))),
        }
    }

    /// PID recorded in the marker.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Location of the marker.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the marker.
    pub fn release(mut self) -> Result<(), DaemonError> {
        self.held = false;
        self.remove().map_err(|source| DaemonError::Marker {
            path: self.path.clone(),
            source,
        })
    }

    fn remove(&self) -> io::Result<()> {
        // Leave the file alone if another process has taken it over.
        if read_pid(&self.path)? != Some(self.pid) {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for InstanceMarker {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        if let Err(e) = self.remove() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove instance marker");
        }
    }
}

/// PID stored at `path`. `None` when the file is missing or unparseable.
pub fn read_pid(path: &Path) -> io::Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

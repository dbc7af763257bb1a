//! Single-instance lock file
//!
//! The file holds the owner's process id. A lock whose owner is no longer
//! alive is taken over; a live owner is a fatal conflict.

use crate::error::{MirrorError, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

/// Signal 0 probe; a process we may not signal still exists
fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn read_owner(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

impl InstanceLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let own_pid = std::process::id();

        if path.exists() {
            match read_owner(&path) {
                Some(pid) if pid as u32 != own_pid && process_alive(pid) => {
                    return Err(MirrorError::LockConflict { path, pid });
                }
                Some(pid) => {
                    warn!(path = %path.display(), pid, "Taking over lock from dead process");
                }
                None => {
                    warn!(path = %path.display(), "Lock file unreadable, taking over");
                }
            }
            std::fs::remove_file(&path)?;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Another instance won the race between our check and create
                let pid = read_owner(&path).unwrap_or(0);
                return Err(MirrorError::LockConflict { path, pid });
            }
            Err(e) => return Err(e.into()),
        };
        write!(file, "{}", own_pid)?;
        file.sync_all()?;

        info!(path = %path.display(), pid = own_pid, "Instance lock acquired");
        Ok(Self { path, pid: own_pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file if it still names this process
    pub fn release(&self) {
        if read_owner(&self.path) != Some(self.pid as i32) {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Instance lock released"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove lock file"),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

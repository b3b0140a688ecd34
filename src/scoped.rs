//! Scoped owners for kernel resources.
//!
//! Both handles acquire on construction and release on drop, with an
//! explicit `release()` to hand ownership across a fork boundary.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::Mode;

use crate::types::{JailError, Result};

/// An owned kernel file descriptor, closed exactly once on drop.
#[derive(Debug)]
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub const INVALID: RawFd = -1;

    pub fn new(fd: RawFd) -> ScopedFd {
        ScopedFd { fd }
    }

    pub fn invalid() -> ScopedFd {
        ScopedFd { fd: Self::INVALID }
    }

    pub fn get(&self) -> RawFd {
        self.fd
    }

    pub fn is_valid(&self) -> bool {
        self.fd != Self::INVALID
    }

    /// Returns the raw descriptor and marks the handle empty. The caller
    /// becomes responsible for closing it.
    pub fn release(&mut self) -> RawFd {
        std::mem::replace(&mut self.fd, Self::INVALID)
    }

    /// Closes the current descriptor, if any, and adopts `fd`.
    pub fn reset(&mut self, fd: RawFd) {
        let old = std::mem::replace(&mut self.fd, fd);
        if old != Self::INVALID {
            let _ = nix::unistd::close(old);
        }
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.reset(Self::INVALID);
    }
}

/// A created cgroup directory. The directory exists between construction and
/// `release()` or drop; dropping without releasing removes it.
#[derive(Debug)]
pub struct ScopedCgroup {
    path: Option<PathBuf>,
}

impl ScopedCgroup {
    /// Creates a uniquely named `omegajail_<n>` directory under `parent`.
    /// Retries on EEXIST so concurrent invocations sharing a parent never
    /// collide.
    pub fn create(parent: &Path) -> Result<ScopedCgroup> {
        for attempt in 0..=1000 {
            let path = parent.join(format!("omegajail_{}", attempt));
            match nix::unistd::mkdir(&path, Mode::from_bits_truncate(0o755)) {
                Ok(()) => return Ok(ScopedCgroup { path: Some(path) }),
                Err(Errno::EEXIST) => continue,
                Err(err) => {
                    return Err(JailError::Cgroup(format!(
                        "failed to create cgroup under {}: {}",
                        parent.display(),
                        err
                    )));
                }
            }
        }
        Err(JailError::Cgroup(format!(
            "no free cgroup slot under {}",
            parent.display()
        )))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Forgets the path. The directory is left for the kernel to reclaim
    /// once it is empty.
    pub fn release(&mut self) {
        self.path = None;
    }
}

impl Drop for ScopedCgroup {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(err) = std::fs::remove_dir(&path) {
                log::warn!("failed to remove cgroup {}: {}", path.display(), err);
            }
        }
    }
}

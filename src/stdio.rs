//! Stdio redirection for the jailed program.
//!
//! A destination may be a regular file or a UNIX `SOCK_SEQPACKET` endpoint
//! multiplexing several streams; the socket case is detected by `ENXIO` from
//! a plain open. In sandboxed mode the host files are staged under
//! `/mnt/stdio` by bind mounts, opened from inside the container, and the
//! staging mount is detached so the origin paths never show up in
//! `/proc/self/mountinfo`.

use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::socket::{
    connect, shutdown, socket, AddressFamily, Shutdown, SockFlag, SockType, UnixAddr,
};
use nix::sys::stat::Mode;

use crate::scoped::ScopedFd;
use crate::types::{JailError, Policy, Result};

/// Mount point of the redirection staging tmpfs.
pub const STDIO_STAGE: &str = "/mnt/stdio";

const SANDBOX_OFF_BANNER: &[u8] = b"WARNING: Running with --disable-sandboxing\n";

/// Opens a redirection destination, falling back to a `SOCK_SEQPACKET`
/// connection when the path names a socket. The unused half of a socket is
/// shut down so each stream stays unidirectional.
pub fn open_file(path: &Path, writable: bool) -> Result<ScopedFd> {
    let flags = OFlag::O_NOFOLLOW
        | if writable {
            OFlag::O_WRONLY
        } else {
            OFlag::O_RDONLY
        };
    match nix::fcntl::open(path, flags, Mode::empty()) {
        Ok(fd) => Ok(ScopedFd::new(fd)),
        Err(Errno::ENXIO) => open_seqpacket(path, writable),
        Err(err) => Err(JailError::Process(format!(
            "failed to open {}: {}",
            path.display(),
            err
        ))),
    }
}

fn open_seqpacket(path: &Path, writable: bool) -> Result<ScopedFd> {
    let sock = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::empty(),
        None,
    )
    .map_err(|err| JailError::Process(format!("failed to create a stdio socket: {}", err)))?;
    let fd = ScopedFd::new(sock.into_raw_fd());

    let addr = UnixAddr::new(path).map_err(|err| {
        JailError::Config(format!("bad socket path {}: {}", path.display(), err))
    })?;
    connect(fd.get(), &addr).map_err(|err| {
        JailError::Process(format!("failed to connect to {}: {}", path.display(), err))
    })?;

    let unused_half = if writable {
        Shutdown::Read
    } else {
        Shutdown::Write
    };
    shutdown(fd.get(), unused_half).map_err(|err| {
        JailError::Process(format!(
            "failed to shut down the unused half of {}: {}",
            path.display(),
            err
        ))
    })?;
    Ok(fd)
}

/// Opens `path` and moves it onto `expected_fd`.
pub fn open_stdio(path: &Path, expected_fd: RawFd, writable: bool) -> Result<()> {
    let mut fd = open_file(path, writable)?;
    if fd.get() == expected_fd {
        fd.release();
        return Ok(());
    }
    nix::unistd::dup2(fd.get(), expected_fd).map_err(|err| {
        JailError::Process(format!(
            "failed to dup2 {} as fd {}: {}",
            path.display(),
            expected_fd,
            err
        ))
    })?;
    Ok(())
}

/// Validates and, for writable targets, creates a redirection destination.
/// Runs in the supervisor before privileges change so the file carries the
/// invoking user's credentials. Socket endpoints pass through untouched.
pub fn create_redirect_target(path: &Path, writable: bool) -> Result<()> {
    let flags = if writable {
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_NOFOLLOW | OFlag::O_TRUNC
    } else {
        OFlag::O_RDONLY | OFlag::O_NOFOLLOW
    };
    match nix::fcntl::open(path, flags, Mode::from_bits_truncate(0o644)) {
        Ok(fd) => {
            drop(ScopedFd::new(fd));
            Ok(())
        }
        Err(Errno::ENXIO) => Ok(()),
        Err(err) => Err(JailError::Setup(format!(
            "failed to open {}: {}",
            path.display(),
            err
        ))),
    }
}

/// Attaches the standard descriptors to the configured destinations. Runs in
/// the child just before privileges are dropped.
pub fn redirect(policy: &Policy) -> Result<()> {
    if policy.disable_sandboxing {
        if let Some(path) = &policy.stdin_redirect {
            open_stdio(path, libc::STDIN_FILENO, false)?;
        }
        if let Some(path) = &policy.stdout_redirect {
            open_stdio(path, libc::STDOUT_FILENO, true)?;
        }
        if let Some(path) = &policy.stderr_redirect {
            open_stdio(path, libc::STDERR_FILENO, true)?;
            // Best effort; the banner must not fail the run.
            unsafe {
                libc::write(
                    libc::STDERR_FILENO,
                    SANDBOX_OFF_BANNER.as_ptr().cast(),
                    SANDBOX_OFF_BANNER.len(),
                );
            }
        }
        return Ok(());
    }

    let stage = Path::new(STDIO_STAGE);
    if policy.stdin_redirect.is_some() {
        open_stdio(&stage.join("stdin"), libc::STDIN_FILENO, false)?;
    }
    if policy.stdout_redirect.is_some() {
        open_stdio(&stage.join("stdout"), libc::STDOUT_FILENO, true)?;
    }
    if policy.stderr_redirect.is_some() {
        open_stdio(&stage.join("stderr"), libc::STDERR_FILENO, true)?;
    }

    // The descriptors now point at the right files; drop the staging mount
    // so the origin paths are no longer visible.
    nix::mount::umount2(stage, nix::mount::MntFlags::MNT_DETACH).map_err(|err| {
        JailError::Mount(format!("failed to detach {}: {}", STDIO_STAGE, err))
    })?;
    Ok(())
}

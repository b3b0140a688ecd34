//! SIGSYS classification.
//!
//! A seccomp-bpf denial can surface either as a ptrace SIGSYS stop or, when
//! the filter was installed with a listener, as an event on the kernel's
//! user-notification descriptor. The two channels race; the classifier
//! thread bridges the notification descriptor to the container init over a
//! socketpair, and the init reconciles both kinds of evidence after the
//! reap, preferring the notification because it carries the precise syscall
//! even when the tracee died before `PTRACE_GETSIGINFO` could be served.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::thread;

use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};

use crate::scoped::ScopedFd;
use crate::types::{JailError, Result};

/// Where a denied-syscall number came from. The reconciler keeps the
/// strongest evidence: UserNotify beats Ptrace beats None.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenialEvidence {
    None,
    Ptrace(i32),
    UserNotify(i32),
}

impl DenialEvidence {
    pub fn merge(self, other: DenialEvidence) -> DenialEvidence {
        match (self, other) {
            (_, DenialEvidence::None) => self,
            (DenialEvidence::UserNotify(_), DenialEvidence::Ptrace(_)) => self,
            _ => other,
        }
    }

    pub fn syscall(self) -> Option<i32> {
        match self {
            DenialEvidence::None => None,
            DenialEvidence::Ptrace(nr) | DenialEvidence::UserNotify(nr) => Some(nr),
        }
    }
}

const SECCOMP_GET_NOTIF_SIZES: libc::c_uint = 3;

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct SeccompData {
    nr: i32,
    arch: u32,
    instruction_pointer: u64,
    args: [u64; 6],
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct SeccompNotif {
    id: u64,
    pid: u32,
    flags: u32,
    data: SeccompData,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct SeccompNotifSizes {
    seccomp_notif: u16,
    seccomp_notif_resp: u16,
    seccomp_data: u16,
}

const fn ioc(dir: u64, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    ((dir << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | nr as u64) as libc::c_ulong
}

const SECCOMP_IOCTL_NOTIF_RECV: libc::c_ulong =
    ioc(3, b'!', 0, std::mem::size_of::<SeccompNotif>());

fn retry_eintr<F: FnMut() -> libc::ssize_t>(mut op: F) -> libc::ssize_t {
    loop {
        let rc = op();
        if rc != -1 || Errno::last() != Errno::EINTR {
            return rc;
        }
    }
}

/// Creates a connected `AF_UNIX/SOCK_STREAM` pair, close-on-exec.
pub fn stream_socket_pair() -> Result<(ScopedFd, ScopedFd)> {
    let (first, second) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|err| JailError::Setup(format!("failed to create a socket pair: {}", err)))?;
    Ok((
        ScopedFd::new(first.into_raw_fd()),
        ScopedFd::new(second.into_raw_fd()),
    ))
}

/// Passes `fd` over the socket as an SCM_RIGHTS message.
pub fn send_fd(sock: RawFd, fd: RawFd) -> Result<()> {
    let iov = [IoSlice::new(&[0u8])];
    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    loop {
        match sendmsg::<()>(sock, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(err) => {
                return Err(JailError::Process(format!("failed to send fd: {}", err)));
            }
        }
    }
}

/// Receives one descriptor from the socket. Fails on EOF or a truncated
/// control message.
pub fn receive_fd(sock: RawFd) -> Result<ScopedFd> {
    let mut data = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut data)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let msg = loop {
        match recvmsg::<()>(
            sock,
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => break msg,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                return Err(JailError::Process(format!("failed to receive fd: {}", err)));
            }
        }
    };

    if msg.bytes == 0 {
        return Err(JailError::Process(
            "socket closed before an fd arrived".to_string(),
        ));
    }
    if msg
        .flags
        .intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC)
    {
        return Err(JailError::Process("truncated fd message".to_string()));
    }

    let cmsgs = msg
        .cmsgs()
        .map_err(|err| JailError::Process(format!("failed to parse the fd message: {}", err)))?;
    for cmsg in cmsgs {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            if let Some(fd) = received.first() {
                return Ok(ScopedFd::new(*fd));
            }
        }
    }
    Err(JailError::Process("malformed fd message".to_string()))
}

/// Opens a pidfd for `pid`, stable across PID reuse.
pub fn pidfd_open(pid: libc::pid_t) -> Result<ScopedFd> {
    let rc = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0 as libc::c_uint) };
    if rc < 0 {
        return Err(JailError::Process(format!(
            "failed to open a pidfd for {}: {}",
            pid,
            std::io::Error::last_os_error()
        )));
    }
    Ok(ScopedFd::new(rc as RawFd))
}

fn pidfd_send_sigkill(pidfd: RawFd) -> std::io::Result<()> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd,
            libc::SIGKILL,
            std::ptr::null::<libc::siginfo_t>(),
            0 as libc::c_uint,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn epoll_create() -> std::io::Result<ScopedFd> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(ScopedFd::new(fd))
}

fn epoll_add(epoll_fd: RawFd, fd: RawFd) -> std::io::Result<()> {
    let mut event = libc::epoll_event {
        events: libc::EPOLLIN as u32,
        u64: fd as u64,
    };
    let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn epoll_wait_intr(
    epoll_fd: RawFd,
    events: &mut [libc::epoll_event],
    timeout_msec: libc::c_int,
) -> libc::c_int {
    loop {
        let rc = unsafe {
            libc::epoll_wait(
                epoll_fd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_msec,
            )
        };
        if rc != -1 || Errno::last() != Errno::EINTR {
            return rc;
        }
    }
}

/// The classifier thread. Spawned by the supervisor once the jail is
/// running; exits when the child is gone or one denial has been relayed.
pub struct SigsysClassifier {
    thread: thread::JoinHandle<()>,
}

impl SigsysClassifier {
    pub fn spawn(mut socket_fd: ScopedFd, mut notification_fd: ScopedFd) -> SigsysClassifier {
        let raw_socket = socket_fd.release();
        let raw_notification = notification_fd.release();
        let thread = thread::spawn(move || {
            classify(ScopedFd::new(raw_socket), ScopedFd::new(raw_notification));
        });
        SigsysClassifier { thread }
    }

    pub fn join(self) {
        let _ = self.thread.join();
    }
}

fn classify(socket_fd: ScopedFd, notification_fd: ScopedFd) {
    let child_pidfd = match receive_fd(socket_fd.get()) {
        Ok(fd) => fd,
        Err(err) => {
            log::error!("failed to receive the child pidfd: {}", err);
            return;
        }
    };

    let epoll_fd = match epoll_create() {
        Ok(fd) => fd,
        Err(err) => {
            log::error!("failed to create an epoll fd: {}", err);
            return;
        }
    };
    for fd in [notification_fd.get(), child_pidfd.get()] {
        if let Err(err) = epoll_add(epoll_fd.get(), fd) {
            log::error!("failed to watch fd {}: {}", fd, err);
            return;
        }
    }

    // The notification struct may grow; size the receive buffer from the
    // kernel rather than the compiled-in layout.
    let mut sizes = SeccompNotifSizes::default();
    let rc = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_GET_NOTIF_SIZES,
            0 as libc::c_uint,
            &mut sizes as *mut SeccompNotifSizes,
        )
    };
    if rc != 0 {
        log::error!(
            "failed to query seccomp notification sizes: {}",
            std::io::Error::last_os_error()
        );
        return;
    }
    let buf_len = (sizes.seccomp_notif as usize).max(std::mem::size_of::<SeccompNotif>());
    let mut buf = vec![0u8; buf_len];

    loop {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 2];
        let nfds = epoll_wait_intr(epoll_fd.get(), &mut events, -1);
        if nfds == -1 {
            log::error!("epoll_wait failed: {}", std::io::Error::last_os_error());
            return;
        }

        let mut notification_ready = false;
        for event in &events[..nfds as usize] {
            if event.u64 == child_pidfd.get() as u64 {
                // The child is gone; nothing more will arrive.
                return;
            }
            if event.u64 == notification_fd.get() as u64 {
                notification_ready = true;
            }
        }
        if !notification_ready {
            log::error!("the user notification fd was not ready");
            return;
        }

        buf.fill(0);
        let rc = unsafe {
            libc::ioctl(
                notification_fd.get(),
                SECCOMP_IOCTL_NOTIF_RECV,
                buf.as_mut_ptr(),
            )
        };
        if rc == -1 {
            log::error!(
                "failed to receive a seccomp notification: {}",
                std::io::Error::last_os_error()
            );
            return;
        }

        let exit_syscall = unsafe { (*buf.as_ptr().cast::<SeccompNotif>()).data.nr };
        let sent = retry_eintr(|| unsafe {
            libc::send(
                socket_fd.get(),
                (&exit_syscall as *const i32).cast(),
                std::mem::size_of::<i32>(),
                libc::MSG_NOSIGNAL,
            )
        });
        if sent < 0 {
            log::error!(
                "failed to publish the denied syscall: {}",
                std::io::Error::last_os_error()
            );
        }
        if let Err(err) = pidfd_send_sigkill(child_pidfd.get()) {
            log::error!("failed to kill the child through its pidfd: {}", err);
        }
        return;
    }
}

/// Reads the classified syscall number published by the classifier, bounded
/// by a one second poll so the init can never hang here.
pub fn receive_exit_syscall(socket_fd: RawFd) -> Option<i32> {
    let epoll_fd = match epoll_create() {
        Ok(fd) => fd,
        Err(err) => {
            log::error!("failed to create an epoll fd: {}", err);
            return None;
        }
    };
    if let Err(err) = epoll_add(epoll_fd.get(), socket_fd) {
        log::error!("failed to watch the sigsys socket: {}", err);
        return None;
    }

    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 1];
    let nfds = epoll_wait_intr(epoll_fd.get(), &mut events, 1000);
    if nfds == -1 {
        log::error!("epoll_wait failed: {}", std::io::Error::last_os_error());
        return None;
    }
    if nfds == 0 {
        log::error!("no classified syscall arrived in time");
        return None;
    }
    if events[0].u64 != socket_fd as u64 {
        log::error!("an unexpected fd became ready");
        return None;
    }

    let mut exit_syscall: i32 = 0;
    let len = retry_eintr(|| unsafe {
        libc::recv(
            socket_fd,
            (&mut exit_syscall as *mut i32).cast(),
            std::mem::size_of::<i32>(),
            libc::MSG_DONTWAIT,
        )
    });
    if len < 0 {
        log::error!(
            "failed to read the classified syscall: {}",
            std::io::Error::last_os_error()
        );
        return None;
    }
    if len == 0 {
        return None;
    }
    if len as usize != std::mem::size_of::<i32>() {
        log::error!("short read on the sigsys socket");
        return None;
    }
    Some(exit_syscall)
}

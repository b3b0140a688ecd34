//! The process cloned into the new namespaces.
//!
//! With a metadata path configured it becomes the container init (PID 1):
//! it applies the mount plan, installs the cgroups, forks the jailed child,
//! bounds the child's lifetime against the wall-clock deadline under
//! ptrace, and writes the metadata record. Once the init is running its own
//! failures are only logged; the metadata file is the source of truth and
//! the supervisor's exit status is whatever the init exits with.
//!
//! Without a metadata path the cloned process applies the resource limits
//! and execs the program directly.

use std::convert::Infallible;
use std::ffi::CString;
use std::fs;
use std::io::Write as _;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::{ForkResult, Gid, Pid, Uid};

use crate::cgroup::{self, CgroupSet};
use crate::meta::{resolve_terminal, MetaRecord};
use crate::scoped::ScopedFd;
use crate::seccomp;
use crate::sigsys::{self, DenialEvidence};
use crate::stdio;
use crate::types::{
    JailError, Policy, Result, SigsysDetector, JAIL_HOSTNAME, LOGGING_FD, META_FD, SIGSYS_FD,
};

/// Credentials the supervisor decided on before the clone.
#[derive(Clone, Copy, Debug)]
pub struct LaunchIds {
    pub from_sudo: bool,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// Uid/gid the jailed program runs as when no sudo mapping applies.
pub const TARGET_UID: libc::uid_t = 1000;
pub const TARGET_GID: libc::gid_t = 1000;

/// Entry point of the cloned process. The policy is the supervisor's own,
/// inherited read-only across the clone. `sync_fd` first delivers the
/// setup-done byte from the supervisor and later carries the seccomp
/// listener from the child back out.
pub fn run_container(policy: &Policy, ids: LaunchIds, sync_fd: RawFd) -> isize {
    let mut byte = 0u8;
    let rc = loop {
        let rc = unsafe { libc::read(sync_fd, (&mut byte as *mut u8).cast(), 1) };
        if rc != -1 || Errno::last() != Errno::EINTR {
            break rc;
        }
    };
    if rc != 1 {
        log::error!(
            "the supervisor went away before finishing setup: {}",
            std::io::Error::last_os_error()
        );
        return 1;
    }

    if !policy.disable_sandboxing {
        if let Err(err) = setup_container(policy) {
            log::error!("failed to set up the container: {}", err);
            return 1;
        }
    }

    if policy.meta.is_some() {
        meta_init(policy, &ids, sync_fd)
    } else {
        match exec_jailed_program(policy, &ids, sync_fd, false) {
            Ok(never) => match never {},
            Err(err) => {
                log::error!("failed to exec the program: {}", err);
                1
            }
        }
    }
}

const NONE: Option<&'static str> = None;

/// Applies the in-container mount plan. Runs before anything else so every
/// later stage sees the final filesystem.
fn setup_container(policy: &Policy) -> Result<()> {
    use nix::mount::{mount, MsFlags};

    let mount_err = |what: &str, err: nix::errno::Errno| {
        JailError::Mount(format!("failed to mount {}: {}", what, err))
    };

    // Nothing done in here may leak back into the host namespace.
    mount(NONE, "/", NONE, MsFlags::MS_REC | MsFlags::MS_PRIVATE, NONE)
        .map_err(|e| mount_err("/ as private", e))?;

    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        NONE,
    )
    .map_err(|e| mount_err("/proc", e))?;

    mount(
        Some("none"),
        "/tmp",
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        Some("size=64M,mode=1777"),
    )
    .map_err(|e| mount_err("/tmp", e))?;
    // Compiled binaries land in /tmp, so it has to stay executable.
    mount(
        NONE,
        "/tmp",
        NONE,
        MsFlags::MS_REMOUNT | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        NONE,
    )
    .map_err(|e| mount_err("/tmp without noexec", e))?;

    let stage = Path::new(stdio::STDIO_STAGE);
    let _ = fs::create_dir_all(stage);
    mount(
        Some("none"),
        stage,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        Some("size=4096,mode=555"),
    )
    .map_err(|e| mount_err(stdio::STDIO_STAGE, e))?;

    for bind in &policy.binds {
        bind_mount(&bind.source, &bind.target, bind.writable)?;
    }

    if let Some(path) = &policy.stdin_redirect {
        stage_stdio_file(path, "stdin", false)?;
    }
    if let Some(path) = &policy.stdout_redirect {
        stage_stdio_file(path, "stdout", true)?;
    }
    if let Some(path) = &policy.stderr_redirect {
        stage_stdio_file(path, "stderr", true)?;
    }

    for path in &policy.cgroup_binds {
        bind_mount(path, path, true)?;
    }

    nix::unistd::sethostname(JAIL_HOSTNAME)
        .map_err(|err| JailError::Setup(format!("failed to set the hostname: {}", err)))?;

    // Root goes read-only last so the mounts above could still modify it.
    mount(
        NONE,
        "/",
        NONE,
        MsFlags::MS_RDONLY | MsFlags::MS_REMOUNT | MsFlags::MS_BIND,
        NONE,
    )
    .map_err(|e| mount_err("/ read-only", e))?;

    if let Some(dir) = &policy.chdir {
        nix::unistd::chdir(dir).map_err(|err| {
            JailError::Setup(format!("failed to chdir to {}: {}", dir.display(), err))
        })?;
    }

    Ok(())
}

fn bind_mount(source: &Path, target: &Path, writable: bool) -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(Some(source), target, NONE, MsFlags::MS_BIND, NONE).map_err(|err| {
        JailError::Mount(format!(
            "failed to bind {} onto {}: {}",
            source.display(),
            target.display(),
            err
        ))
    })?;
    if !writable {
        mount(
            NONE,
            target,
            NONE,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            NONE,
        )
        .map_err(|err| {
            JailError::Mount(format!(
                "failed to make {} read-only: {}",
                target.display(),
                err
            ))
        })?;
    }
    Ok(())
}

fn stage_stdio_file(host_path: &Path, name: &str, writable: bool) -> Result<()> {
    let target = Path::new(stdio::STDIO_STAGE).join(name);
    fs::File::create(&target).map_err(|err| {
        JailError::Mount(format!("failed to create {}: {}", target.display(), err))
    })?;
    bind_mount(host_path, &target, writable)
}

/// The init body: install cgroups, fork the child, wait it out, report.
fn meta_init(policy: &Policy, ids: &LaunchIds, sync_fd: RawFd) -> isize {
    let mut cgroups = match cgroup::install(
        policy.cgroup_path.as_deref(),
        policy.memory_limit_bytes,
        !policy.disable_sandboxing,
    ) {
        Ok(set) => set,
        Err(err) => {
            log::error!("failed to install the cgroups: {}", err);
            return 1;
        }
    };

    if policy.disable_sandboxing {
        // Without a PID namespace, descendants of the session leader still
        // have to be reapable after it dies.
        if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } == -1 {
            log::error!(
                "failed to become a child subreaper: {}",
                std::io::Error::last_os_error()
            );
            return 1;
        }
    }

    let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    let mut orig_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGCHLD);
    }
    if unsafe { libc::sigprocmask(libc::SIG_BLOCK, &mask, &mut orig_mask) } != 0 {
        log::error!(
            "failed to block SIGCHLD: {}",
            std::io::Error::last_os_error()
        );
        return 1;
    }

    // The deadline is absolute and computed exactly once.
    let t0 = now();
    let deadline = ts_add(&t0, &duration_to_timespec(policy.wall_time_limit));

    let child_pid = match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Parent { child }) => child.as_raw(),
        Ok(ForkResult::Child) => {
            let err = match child_after_fork(policy, ids, sync_fd, &mut cgroups, &orig_mask) {
                Ok(never) => match never {},
                Err(err) => err,
            };
            log::error!("child setup failed: {}", err);
            unsafe { libc::_exit(127) }
        }
        Err(err) => {
            log::error!("failed to fork the child: {}", err);
            return 1;
        }
    };

    // From here on errors stop meaning anything; keep going so the record
    // gets written no matter what.

    let title = b"minijail-init\0";
    unsafe { libc::prctl(libc::PR_SET_NAME, title.as_ptr()) };

    let mut sigsys_sock = ScopedFd::new(SIGSYS_FD);
    match sigsys::pidfd_open(child_pid) {
        Ok(child_pidfd) => {
            if let Err(err) = sigsys::send_fd(sigsys_sock.get(), child_pidfd.get()) {
                log::error!("failed to send the child pidfd: {}", err);
                sigsys_sock.reset(ScopedFd::INVALID);
            }
        }
        Err(err) => log::error!("{}", err),
    }
    if sigsys_sock.is_valid() {
        unsafe { libc::shutdown(sigsys_sock.get(), libc::SHUT_WR) };
    }
    let _ = nix::unistd::close(sync_fd);

    enter_reduced_jail(policy, ids);

    let (mut evidence, mut exit_signal, mut init_status, mut init_usage, mut init_exited, mut t) =
        wait_for_child(child_pid, &mask, &t0, &deadline);

    if ts_cmp(&t, &deadline) != std::cmp::Ordering::Less {
        // A wall-clock timeout is reported the same way as CPU exhaustion.
        exit_signal = Some(libc::SIGXCPU);
    }

    // Inside the PID namespace -1 sweeps every descendant; without one only
    // the child's session is fair game.
    let kill_target = if policy.disable_sandboxing {
        -child_pid
    } else {
        -1
    };
    unsafe { libc::kill(kill_target, libc::SIGKILL) };

    let mut status = 0;
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let pid = unsafe { libc::wait4(-1, &mut status, 0, &mut usage) };
        if pid <= 0 {
            break;
        }
        if init_exited || pid != child_pid {
            continue;
        }
        init_status = status;
        init_usage = usage;
        init_exited = true;
    }

    t = now();
    let wall = ts_sub(&t, &t0);

    // The user-notification channel knows the true syscall even when the
    // tracee died before GETSIGINFO could run; let it override ptrace.
    if sigsys_sock.is_valid() {
        if let Some(nr) = sigsys::receive_exit_syscall(sigsys_sock.get()) {
            evidence = evidence.merge(DenialEvidence::UserNotify(nr));
        }
    }
    drop(sigsys_sock);

    let mut mem_bytes = (init_usage.ru_maxrss as i64)
        .saturating_mul(1024)
        .saturating_sub(policy.vm_memory_bytes as i64)
        .max(0);
    if cgroups.has_memory_cgroup() {
        // Max RSS can come in far under the limit when the kernel kept the
        // cgroup at its cap; the fail counter disambiguates.
        if cgroups.memory_failcnt().unwrap_or(0) > 0 {
            mem_bytes = policy.memory_limit_bytes.max(0);
        }
    }
    drop(cgroups);

    let record = MetaRecord {
        user_usec: init_usage.ru_utime.tv_sec * 1_000_000 + init_usage.ru_utime.tv_usec,
        sys_usec: init_usage.ru_stime.tv_sec * 1_000_000 + init_usage.ru_stime.tv_usec,
        wall_usec: (wall.tv_sec * 1_000_000_000 + wall.tv_nsec) / 1_000,
        mem_bytes,
        terminal: resolve_terminal(evidence.syscall(), exit_signal, init_status),
    };

    let mut meta_file = unsafe { fs::File::from_raw_fd(META_FD) };
    if let Err(err) = record
        .write_to(&mut meta_file)
        .and_then(|()| meta_file.flush())
    {
        log::error!("failed to write the metadata record: {}", err);
    }
    drop(meta_file);

    record.exit_code() as isize
}

/// The wait/deadline loop. Returns the denial evidence, any synthesized
/// signal, the child's wait status and rusage, whether it was reaped, and
/// the current time.
fn wait_for_child(
    child_pid: libc::pid_t,
    mask: &libc::sigset_t,
    t0: &libc::timespec,
    deadline: &libc::timespec,
) -> (
    DenialEvidence,
    Option<i32>,
    i32,
    libc::rusage,
    bool,
    libc::timespec,
) {
    let mut evidence = DenialEvidence::None;
    let mut exit_signal = None;
    let mut init_status = 0;
    let mut init_usage: libc::rusage = unsafe { std::mem::zeroed() };
    let mut init_exited = false;
    let mut attached = false;
    let mut t = *t0;

    while !init_exited && ts_cmp(&t, deadline) == std::cmp::Ordering::Less {
        let timeout = ts_sub(deadline, &t);
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = loop {
            let rc = unsafe { libc::sigtimedwait(mask, &mut info, &timeout) };
            if rc != -1 || Errno::last() != Errno::EINTR {
                break rc;
            }
        };
        if rc == -1 {
            t = now();
            break;
        }

        let mut status = 0;
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        loop {
            let pid = unsafe {
                libc::wait4(-1, &mut status, libc::__WALL | libc::WNOHANG, &mut usage)
            };
            if pid <= 0 {
                break;
            }

            if libc::WIFSTOPPED(status) {
                if !attached {
                    if let Err(err) = ptrace::setoptions(
                        Pid::from_raw(pid),
                        ptrace::Options::PTRACE_O_TRACESECCOMP
                            | ptrace::Options::PTRACE_O_EXITKILL,
                    ) {
                        log::error!("failed to set the ptrace options: {}", err);
                    }
                    attached = true;
                }
                dispatch_stop(pid, status, &mut evidence, &mut exit_signal);
                continue;
            }

            if pid == child_pid {
                init_status = status;
                init_usage = usage;
                init_exited = true;
            }
        }
        t = now();
    }

    (evidence, exit_signal, init_status, init_usage, init_exited, t)
}

/// Handles one ptrace stop of the traced child.
fn dispatch_stop(
    pid: libc::pid_t,
    status: i32,
    evidence: &mut DenialEvidence,
    exit_signal: &mut Option<i32>,
) {
    let stop_signal = libc::WSTOPSIG(status);
    match stop_signal {
        libc::SIGSYS => {
            match ptrace::getsiginfo(Pid::from_raw(pid)) {
                Ok(info) => {
                    *evidence = evidence.merge(DenialEvidence::Ptrace(siginfo_syscall(&info)));
                }
                Err(err) => log::error!("failed to read the SIGSYS siginfo: {}", err),
            }
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
        // Exceeding a resource limit terminates the run.
        libc::SIGXCPU | libc::SIGXFSZ => {
            *exit_signal = Some(stop_signal);
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
        // The initial self-stop and ptrace-injected traps are suppressed.
        libc::SIGSTOP | libc::SIGTRAP => {
            if unsafe { libc::ptrace(libc::PTRACE_CONT, pid, 0usize, 0usize) } == -1 {
                log::error!(
                    "failed to continue the child: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
        // Everything else is delivered normally.
        _ => {
            if unsafe { libc::ptrace(libc::PTRACE_CONT, pid, 0usize, stop_signal as usize) } == -1
            {
                log::error!(
                    "failed to forward signal {} to the child: {}",
                    stop_signal,
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

/// Layout of the SIGSYS portion of `siginfo_t` on 64-bit Linux.
#[repr(C)]
#[allow(dead_code)]
struct SigsysInfo {
    si_signo: i32,
    si_errno: i32,
    si_code: i32,
    _pad: i32,
    call_addr: usize,
    syscall: i32,
    arch: u32,
}

fn siginfo_syscall(info: &libc::siginfo_t) -> i32 {
    unsafe { (*(info as *const libc::siginfo_t).cast::<SigsysInfo>()).syscall }
}

/// Child-side continuation of the fork, through to execve.
fn child_after_fork(
    policy: &Policy,
    ids: &LaunchIds,
    sync_fd: RawFd,
    cgroups: &mut CgroupSet,
    orig_mask: &libc::sigset_t,
) -> Result<Infallible> {
    if policy.disable_sandboxing {
        // A fresh session makes the whole group killable later.
        nix::unistd::setsid()
            .map_err(|err| JailError::Process(format!("failed to create a session: {}", err)))?;
    }

    if let Some(comm) = &policy.comm {
        if let Ok(title) = CString::new(comm.as_str()) {
            unsafe { libc::prctl(libc::PR_SET_NAME, title.as_ptr()) };
        }
    }

    // Cgroup membership must be settled before the signal mask comes back,
    // so the init's later sweep kill only ever hits accounted processes.
    cgroups.join_child_task()?;

    if unsafe { libc::sigprocmask(libc::SIG_SETMASK, orig_mask, std::ptr::null_mut()) } != 0 {
        return Err(JailError::Process(format!(
            "failed to restore the signal mask: {}",
            std::io::Error::last_os_error()
        )));
    }

    // The untrusted program must not retain the plumbing descriptors.
    nix::unistd::close(SIGSYS_FD)
        .map_err(|err| JailError::Process(format!("failed to close the sigsys fd: {}", err)))?;
    nix::unistd::close(META_FD)
        .map_err(|err| JailError::Process(format!("failed to close the meta fd: {}", err)))?;

    let traced = !policy.disable_sandboxing
        && !policy.seccomp_filter.is_empty()
        && policy.sigsys_detector != SigsysDetector::Disabled;
    exec_jailed_program(policy, ids, sync_fd, traced)
}

/// Final stretch before execve: rlimits, redirection, privilege drop,
/// tracing, seccomp.
fn exec_jailed_program(
    policy: &Policy,
    ids: &LaunchIds,
    sync_fd: RawFd,
    traced: bool,
) -> Result<Infallible> {
    apply_rlimits(&policy.rlimits)?;

    if policy.stdin_redirect.is_some()
        || policy.stdout_redirect.is_some()
        || policy.stderr_redirect.is_some()
    {
        stdio::redirect(policy)?;
    }

    drop_child_privileges(policy, ids)?;

    nix::unistd::close(LOGGING_FD)
        .map_err(|err| JailError::Process(format!("failed to close the logging fd: {}", err)))?;

    if traced {
        ptrace::traceme()
            .map_err(|err| JailError::Process(format!("failed to request tracing: {}", err)))?;
        unsafe { libc::raise(libc::SIGSTOP) };
    }

    if !policy.seccomp_filter.is_empty() && !policy.disable_sandboxing {
        let new_listener = traced && policy.sigsys_detector == SigsysDetector::SigsysTracer;
        if let Some(listener) = seccomp::install(&policy.seccomp_filter, new_listener)? {
            // If the handoff fails the supervisor simply never starts the
            // classifier; the ptrace evidence still stands.
            let _ = sigsys::send_fd(sync_fd, listener.get());
        }
    }

    let program = path_to_cstring(&policy.program)?;
    let mut args = Vec::with_capacity(policy.args.len());
    for arg in &policy.args {
        args.push(CString::new(arg.as_str()).map_err(|_| {
            JailError::Config(format!("argument contains a NUL byte: {:?}", arg))
        })?);
    }
    let mut env = Vec::new();
    for (key, value) in std::env::vars() {
        if let Ok(entry) = CString::new(format!("{}={}", key, value)) {
            env.push(entry);
        }
    }

    let err = nix::unistd::execve(&program, &args, &env).unwrap_err();
    Err(JailError::Process(format!(
        "failed to exec {}: {}",
        policy.program.display(),
        err
    )))
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| JailError::Config(format!("path contains a NUL byte: {:?}", path)))
}

fn apply_rlimits(rlimits: &[crate::types::RlimitSpec]) -> Result<()> {
    for spec in rlimits {
        let limit = libc::rlimit {
            rlim_cur: spec.soft,
            rlim_max: spec.hard,
        };
        let rc = unsafe { libc::prlimit(0, spec.resource, &limit, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(JailError::Process(format!(
                "failed to set resource limit {}: {}",
                spec.resource,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Drops the child to its target credentials and locks privileges down.
fn drop_child_privileges(policy: &Policy, ids: &LaunchIds) -> Result<()> {
    if policy.disable_sandboxing {
        return Ok(());
    }

    let (uid, gid) = if ids.from_sudo {
        (ids.uid, ids.gid)
    } else {
        (TARGET_UID, TARGET_GID)
    };
    // May be refused when setgroups is disabled in the user namespace.
    let _ = nix::unistd::setgroups(&[]);
    nix::unistd::setgid(Gid::from_raw(gid))
        .map_err(|err| JailError::Process(format!("failed to setgid({}): {}", gid, err)))?;
    nix::unistd::setuid(Uid::from_raw(uid))
        .map_err(|err| JailError::Process(format!("failed to setuid({}): {}", uid, err)))?;

    drop_capabilities();
    set_no_new_privs()?;
    Ok(())
}

/// The reduced confinement the init applies to itself after the fork.
fn enter_reduced_jail(policy: &Policy, ids: &LaunchIds) {
    if ids.from_sudo {
        if let Err(err) = nix::unistd::setgid(Gid::from_raw(ids.gid)) {
            log::error!("failed to setgid({}): {}", ids.gid, err);
        }
        if let Err(err) = nix::unistd::setuid(Uid::from_raw(ids.uid)) {
            log::error!("failed to setuid({}): {}", ids.uid, err);
        }
    }
    if !policy.disable_sandboxing {
        drop_capabilities();
        if let Err(err) = set_no_new_privs() {
            log::error!("{}", err);
        }
    }
}

const CAP_LAST_CAP: libc::c_ulong = 63;
const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Empties the bounding, ambient, and process capability sets. Invalid
/// capability numbers and already-empty sets are ignored.
fn drop_capabilities() {
    for cap in 0..=CAP_LAST_CAP {
        unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
    }
    if unsafe { libc::prctl(libc::PR_CAP_AMBIENT, libc::PR_CAP_AMBIENT_CLEAR_ALL, 0, 0, 0) } != 0
    {
        log::warn!("failed to clear the ambient capability set");
    }

    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: i32,
    }
    #[repr(C)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [
        CapUserData {
            effective: 0,
            permitted: 0,
            inheritable: 0,
        },
        CapUserData {
            effective: 0,
            permitted: 0,
            inheritable: 0,
        },
    ];
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        log::warn!(
            "failed to clear the capability sets: {}",
            std::io::Error::last_os_error()
        );
    }
}

fn set_no_new_privs() -> Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(JailError::Process(format!(
            "failed to set no_new_privs: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn now() -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts
}

fn duration_to_timespec(duration: std::time::Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs().min(i64::MAX as u64) as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

fn ts_add(a: &libc::timespec, b: &libc::timespec) -> libc::timespec {
    let mut result = libc::timespec {
        tv_sec: a.tv_sec.saturating_add(b.tv_sec),
        tv_nsec: a.tv_nsec + b.tv_nsec,
    };
    if result.tv_nsec >= 1_000_000_000 {
        result.tv_nsec -= 1_000_000_000;
        result.tv_sec = result.tv_sec.saturating_add(1);
    }
    result
}

fn ts_sub(a: &libc::timespec, b: &libc::timespec) -> libc::timespec {
    let mut result = libc::timespec {
        tv_sec: a.tv_sec - b.tv_sec,
        tv_nsec: a.tv_nsec - b.tv_nsec,
    };
    if result.tv_nsec < 0 {
        result.tv_nsec += 1_000_000_000;
        result.tv_sec -= 1;
    }
    result
}

fn ts_cmp(a: &libc::timespec, b: &libc::timespec) -> std::cmp::Ordering {
    (a.tv_sec, a.tv_nsec).cmp(&(b.tv_sec, b.tv_nsec))
}

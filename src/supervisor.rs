//! The top-level driver.
//!
//! Translates a [`Policy`] into a running jail: resolves the credentials to
//! run as (including the sudo dance), pins affinity, arranges the
//! well-known descriptors, clones the container init into the namespace
//! set, writes the uid/gid maps, feeds the SIGSYS classifier, and waits for
//! the outcome. Every failure before the jail is running is a setup error;
//! afterwards the init owns the result.

use std::fs;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::errno::Errno;
use nix::sched::{sched_getaffinity, sched_setaffinity, CloneFlags, CpuSet};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{Gid, Pid, Uid, User};

use crate::cgroup;
use crate::init::{self, LaunchIds, TARGET_GID, TARGET_UID};
use crate::scoped::ScopedFd;
use crate::sigsys::{self, SigsysClassifier};
use crate::stdio;
use crate::types::{JailError, Policy, Result, SigsysDetector, META_FD, SIGSYS_FD};

const INIT_STACK_SIZE: usize = 2 * 1024 * 1024;

pub struct Supervisor {
    policy: Policy,
    ids: LaunchIds,
    /// Supervisor end of the sigsys socketpair, fed to the classifier.
    sigsys_sup: ScopedFd,
    /// Supervisor end of the setup/seccomp handoff socketpair.
    sync_sup: ScopedFd,
    init_pid: libc::pid_t,
}

/// Runs a policy to completion and returns the process exit code.
pub fn run(policy: Policy) -> Result<i32> {
    let mut supervisor = Supervisor::configure(policy)?;
    supervisor.launch()?;
    supervisor.wait()
}

impl Supervisor {
    /// Resolves credentials, scrubs the environment, pins affinity, and
    /// settles the cgroup layout and redirection targets.
    pub fn configure(mut policy: Policy) -> Result<Supervisor> {
        let ids = resolve_ids()?;
        if ids.from_sudo {
            // Caller-named files must be opened as the invoking user, never
            // as root.
            nix::unistd::setegid(Gid::from_raw(ids.gid))
                .map_err(|err| JailError::Setup(format!("setegid failed: {}", err)))?;
            nix::unistd::seteuid(Uid::from_raw(ids.uid))
                .map_err(|err| JailError::Setup(format!("seteuid failed: {}", err)))?;
        }

        scrub_environment();
        pin_cpu_affinity()?;

        if policy.disable_sandboxing {
            log::warn!("running with --disable-sandboxing");
        }

        let plan = cgroup::prepare(
            policy.script_basename.as_deref(),
            policy.memory_limit_bytes,
            !policy.disable_sandboxing,
        )?;
        policy.cgroup_path = plan.cgroup_path;
        policy.cgroup_binds = plan.binds;

        if !policy.disable_sandboxing {
            if let Some(path) = &policy.stdin_redirect {
                stdio::create_redirect_target(path, false)?;
            }
        }
        if let Some(path) = &policy.stdout_redirect {
            stdio::create_redirect_target(path, true)?;
        }
        if let Some(path) = &policy.stderr_redirect {
            stdio::create_redirect_target(path, true)?;
        }

        Ok(Supervisor {
            policy,
            ids,
            sigsys_sup: ScopedFd::invalid(),
            sync_sup: ScopedFd::invalid(),
            init_pid: 0,
        })
    }

    /// Arranges the well-known descriptors and starts the container init.
    pub fn launch(&mut self) -> Result<()> {
        if let Some(meta_path) = &self.policy.meta {
            let meta_fd = open_meta_file(meta_path)?;
            move_to_well_known_fd(meta_fd, META_FD)?;

            let (jail_end, supervisor_end) = sigsys::stream_socket_pair()?;
            move_to_well_known_fd(jail_end, SIGSYS_FD)?;
            self.sigsys_sup = supervisor_end;
        }

        let (sync_sup, jail_sync) = sigsys::stream_socket_pair()?;

        if self.ids.from_sudo {
            // Root again, for the namespaces and the id maps.
            nix::unistd::seteuid(Uid::from_raw(0))
                .map_err(|err| JailError::Setup(format!("seteuid(0) failed: {}", err)))?;
            nix::unistd::setegid(Gid::from_raw(0))
                .map_err(|err| JailError::Setup(format!("setegid(0) failed: {}", err)))?;
        }

        let policy = &self.policy;
        let ids = self.ids;
        let jail_sync_fd = jail_sync.get();

        let init_pid = if policy.disable_sandboxing {
            // The namespace clone is blocked under Docker's own seccomp
            // policy, which is the main consumer of this mode.
            match unsafe { nix::unistd::fork() }
                .map_err(|err| JailError::Setup(format!("fork failed: {}", err)))?
            {
                nix::unistd::ForkResult::Parent { child } => child.as_raw(),
                nix::unistd::ForkResult::Child => {
                    let code = init::run_container(policy, ids, jail_sync_fd);
                    unsafe { libc::_exit(code as libc::c_int) }
                }
            }
        } else {
            let mut stack = vec![0u8; INIT_STACK_SIZE];
            let flags = CloneFlags::CLONE_NEWUSER
                | CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWIPC
                | CloneFlags::CLONE_NEWUTS
                | CloneFlags::CLONE_NEWCGROUP
                | CloneFlags::CLONE_NEWNET
                | CloneFlags::CLONE_NEWNS;
            unsafe {
                nix::sched::clone(
                    Box::new(move || init::run_container(policy, ids, jail_sync_fd)),
                    &mut stack,
                    flags,
                    Some(libc::SIGCHLD),
                )
            }
            .map_err(|err| JailError::Setup(format!("clone failed: {}", err)))?
            .as_raw()
        };
        drop(jail_sync);
        self.init_pid = init_pid;

        if !self.policy.disable_sandboxing {
            write_id_maps(init_pid, &self.ids)?;
        }

        // Setup-done byte; the init blocks on this before touching anything
        // that depends on the id maps.
        let byte = 1u8;
        let rc = unsafe { libc::write(sync_sup.get(), (&byte as *const u8).cast(), 1) };
        if rc != 1 {
            return Err(JailError::Setup(format!(
                "failed to signal the init: {}",
                std::io::Error::last_os_error()
            )));
        }
        self.sync_sup = sync_sup;
        Ok(())
    }

    /// Drives the SIGSYS classifier, then awaits the jail.
    pub fn wait(mut self) -> Result<i32> {
        let wants_classifier = self.policy.meta.is_some()
            && !self.policy.disable_sandboxing
            && self.policy.sigsys_detector == SigsysDetector::SigsysTracer
            && !self.policy.seccomp_filter.is_empty();
        if wants_classifier {
            // The child ships the listener just before execve; EOF means it
            // died first and there is nothing to classify.
            match sigsys::receive_fd(self.sync_sup.get()) {
                Ok(notification_fd) => {
                    let mut supervisor_end = ScopedFd::invalid();
                    std::mem::swap(&mut supervisor_end, &mut self.sigsys_sup);
                    SigsysClassifier::spawn(supervisor_end, notification_fd).join();
                }
                Err(err) => log::error!("user notification fd missing: {}", err),
            }
        }

        let status = loop {
            match waitpid(Pid::from_raw(self.init_pid), None) {
                Ok(status) => break status,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    return Err(JailError::Process(format!(
                        "waitpid({}) failed: {}",
                        self.init_pid, err
                    )));
                }
            }
        };

        Ok(match status {
            WaitStatus::Exited(_, code) => code,
            WaitStatus::Signaled(_, signal, _) => signal as i32,
            other => {
                log::error!("unexpected wait status: {:?}", other);
                1
            }
        })
    }
}

fn resolve_ids() -> Result<LaunchIds> {
    match std::env::var("SUDO_USER") {
        Ok(name) if !name.is_empty() => {
            let user = User::from_name(&name)
                .map_err(|err| JailError::Setup(format!("user lookup failed: {}", err)))?
                .ok_or_else(|| JailError::Setup(format!("user {} not found", name)))?;
            Ok(LaunchIds {
                from_sudo: true,
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
            })
        }
        _ => Ok(LaunchIds {
            from_sudo: false,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }),
    }
}

/// Clears the environment and installs the minimal set the jailed program
/// is allowed to see.
fn scrub_environment() {
    let keys: Vec<_> = std::env::vars_os().map(|(key, _)| key).collect();
    for key in keys {
        std::env::remove_var(key);
    }
    std::env::set_var("HOME", "/home");
    std::env::set_var("LANG", "en_US.UTF-8");
    std::env::set_var("PATH", "/usr/bin");
    std::env::set_var("DOTNET_CLI_TELEMETRY_OPTOUT", "1");
}

/// Pins the process to the first allowed core so scheduling noise does not
/// leak into the timing measurements.
fn pin_cpu_affinity() -> Result<()> {
    let pid = Pid::from_raw(0);
    let current = sched_getaffinity(pid)
        .map_err(|err| JailError::Setup(format!("sched_getaffinity failed: {}", err)))?;

    let mut first = None;
    let mut count = 0;
    for cpu in 0..CpuSet::count() {
        if current.is_set(cpu).unwrap_or(false) {
            count += 1;
            if first.is_none() {
                first = Some(cpu);
            }
        }
    }
    if count <= 1 {
        return Ok(());
    }

    let mut pinned = CpuSet::new();
    pinned
        .set(first.expect("count > 1 implies a set bit"))
        .map_err(|err| JailError::Setup(format!("cpu set failed: {}", err)))?;
    sched_setaffinity(pid, &pinned)
        .map_err(|err| JailError::Setup(format!("sched_setaffinity failed: {}", err)))?;
    Ok(())
}

fn open_meta_file(path: &Path) -> Result<ScopedFd> {
    use nix::fcntl::OFlag;
    let fd = nix::fcntl::open(
        path,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_CLOEXEC,
        nix::sys::stat::Mode::from_bits_truncate(0o644),
    )
    .map_err(|err| {
        JailError::Setup(format!("failed to open {}: {}", path.display(), err))
    })?;
    Ok(ScopedFd::new(fd))
}

/// Moves `fd` onto the given well-known slot. `dup2` clears close-on-exec,
/// so the slot survives into the container.
fn move_to_well_known_fd(mut fd: ScopedFd, target: RawFd) -> Result<()> {
    if fd.get() == target {
        fd.release();
        return Ok(());
    }
    nix::unistd::dup2(fd.get(), target)
        .map_err(|err| JailError::Setup(format!("dup2 to fd {} failed: {}", target, err)))?;
    Ok(())
}

/// Writes the uid/gid maps for the freshly cloned init. Under sudo the
/// invoking user maps to itself; otherwise the calling user becomes the
/// fixed unprivileged identity in a single-entry map with setgroups
/// disabled.
fn write_id_maps(pid: libc::pid_t, ids: &LaunchIds) -> Result<()> {
    let map_err = |name: &str, err: std::io::Error| {
        JailError::Setup(format!("failed to write {} for {}: {}", name, pid, err))
    };
    let proc_dir = format!("/proc/{}", pid);

    if ids.from_sudo {
        fs::write(
            format!("{}/uid_map", proc_dir),
            format!("{0} {0} 1\n", ids.uid),
        )
        .map_err(|err| map_err("uid_map", err))?;
        fs::write(
            format!("{}/gid_map", proc_dir),
            format!("{0} {0} 1\n", ids.gid),
        )
        .map_err(|err| map_err("gid_map", err))?;
    } else {
        fs::write(format!("{}/setgroups", proc_dir), "deny")
            .map_err(|err| map_err("setgroups", err))?;
        fs::write(
            format!("{}/uid_map", proc_dir),
            format!("{} {} 1\n", TARGET_UID, ids.uid),
        )
        .map_err(|err| map_err("uid_map", err))?;
        fs::write(
            format!("{}/gid_map", proc_dir),
            format!("{} {} 1\n", TARGET_GID, ids.gid),
        )
        .map_err(|err| map_err("gid_map", err))?;
    }
    Ok(())
}

//! End-to-end runs of the omegajail binary.
//!
//! The unprivileged tests run with --disable-sandboxing, which keeps the
//! init/metadata machinery (fork, wait loop, deadline, rusage, record) while
//! skipping the namespace work that needs privileges. The fully sandboxed
//! scenarios need root plus user-namespace support and are ignored by
//! default.

use std::path::Path;
use std::process::Command;

use omegajail::meta::{MetaRecord, Terminal};

struct RunOutcome {
    exit_code: i32,
    record: MetaRecord,
    raw_meta: String,
}

fn run_unsandboxed(extra_args: &[&str], program: &[&str]) -> RunOutcome {
    run_jail(true, extra_args, program)
}

fn run_jail(disable_sandboxing: bool, extra_args: &[&str], program: &[&str]) -> RunOutcome {
    let tmp = tempfile::tempdir().unwrap();
    let meta_path = tmp.path().join("meta");

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_omegajail"));
    if disable_sandboxing {
        cmd.arg("--disable-sandboxing");
    }
    cmd.arg("--meta").arg(&meta_path);
    cmd.args(extra_args);
    cmd.arg("--");
    cmd.args(program);

    let status = cmd.status().expect("failed to spawn omegajail");
    let raw_meta = std::fs::read_to_string(&meta_path).expect("metadata file missing");
    let record = MetaRecord::parse(&raw_meta).expect("metadata record did not parse");

    RunOutcome {
        exit_code: status.code().expect("supervisor was killed by a signal"),
        record,
        raw_meta,
    }
}

#[test]
fn test_true_reports_status_zero() {
    let outcome = run_unsandboxed(&[], &["/bin/true"]);
    assert_eq!(outcome.record.terminal, Terminal::Status(0));
    assert_eq!(outcome.exit_code, 0);
}

#[test]
fn test_exit_status_is_propagated() {
    let outcome = run_unsandboxed(&[], &["/bin/sh", "-c", "exit 42"]);
    assert_eq!(outcome.record.terminal, Terminal::Status(42));
    assert_eq!(outcome.exit_code, 42);
}

#[test]
fn test_abort_reports_sigabrt_without_syscall() {
    let outcome = run_unsandboxed(&[], &["/bin/sh", "-c", "kill -ABRT $$"]);
    assert_eq!(outcome.record.terminal, Terminal::Signal(libc::SIGABRT));
    assert_eq!(outcome.exit_code, libc::SIGABRT);
    assert!(!outcome.raw_meta.contains("syscall:"));
}

#[test]
fn test_wall_clock_timeout_reports_sigxcpu() {
    let outcome = run_unsandboxed(
        &["--time-limit", "100", "--extra-wall-time-limit", "400"],
        &["/bin/sh", "-c", "sleep 10"],
    );
    assert_eq!(outcome.record.terminal, Terminal::Signal(libc::SIGXCPU));
    assert_eq!(outcome.exit_code, libc::SIGXCPU);
    // The deadline was 500 msec; the record has to show at least that much
    // wall time and nearly no CPU time.
    assert!(outcome.record.wall_usec >= 400_000, "{:?}", outcome.raw_meta);
    assert!(outcome.record.user_usec + outcome.record.sys_usec < 400_000);
}

#[test]
fn test_output_limit_reports_sigxfsz() {
    let tmp = tempfile::tempdir().unwrap();
    let sink = tmp.path().join("sink");
    let outcome = run_unsandboxed(
        &["--output-limit", "1024", "--time-limit", "2000"],
        &[
            "/bin/sh",
            "-c",
            &format!("yes overflow > {}", sink.display()),
        ],
    );
    assert_eq!(outcome.record.terminal, Terminal::Signal(libc::SIGXFSZ));
    assert_eq!(outcome.exit_code, libc::SIGXFSZ);
    assert!(std::fs::metadata(&sink).unwrap().len() <= 1024);
}

#[test]
fn test_metadata_key_order_is_fixed() {
    let outcome = run_unsandboxed(&[], &["/bin/true"]);
    let keys: Vec<&str> = outcome
        .raw_meta
        .lines()
        .map(|line| line.split(':').next().unwrap())
        .collect();
    assert_eq!(keys, ["time", "time-sys", "time-wall", "mem", "status"]);
}

#[test]
fn test_deterministic_outcome_across_runs() {
    let first = run_unsandboxed(&[], &["/bin/sh", "-c", "exit 7"]);
    let second = run_unsandboxed(&[], &["/bin/sh", "-c", "exit 7"]);
    assert_eq!(first.record.terminal, second.record.terminal);
    assert_eq!(first.exit_code, second.exit_code);
}

#[test]
fn test_stdio_redirection_through_host_paths() {
    let tmp = tempfile::tempdir().unwrap();
    let stdin_path = tmp.path().join("stdin");
    let stdout_path = tmp.path().join("stdout");
    std::fs::write(&stdin_path, "read me\n").unwrap();

    let outcome = run_unsandboxed(
        &[
            "--stdin",
            stdin_path.to_str().unwrap(),
            "--stdout",
            stdout_path.to_str().unwrap(),
        ],
        &["/bin/cat"],
    );
    assert_eq!(outcome.record.terminal, Terminal::Status(0));
    assert_eq!(std::fs::read_to_string(&stdout_path).unwrap(), "read me\n");
}

#[test]
fn test_stderr_redirection_carries_warning_banner() {
    let tmp = tempfile::tempdir().unwrap();
    let stderr_path = tmp.path().join("stderr");

    let outcome = run_unsandboxed(
        &["--stderr", stderr_path.to_str().unwrap()],
        &["/bin/sh", "-c", "echo oops >&2"],
    );
    assert_eq!(outcome.record.terminal, Terminal::Status(0));
    let captured = std::fs::read_to_string(&stderr_path).unwrap();
    assert!(captured.contains("WARNING: Running with --disable-sandboxing"));
    assert!(captured.contains("oops"));
}

#[test]
fn test_setup_failure_writes_no_metadata() {
    let tmp = tempfile::tempdir().unwrap();
    let meta_path = tmp.path().join("meta");

    let status = Command::new(env!("CARGO_BIN_EXE_omegajail"))
        .arg("--disable-sandboxing")
        .arg("--meta")
        .arg(&meta_path)
        .arg("--seccomp-program")
        .arg(tmp.path().join("missing.bpf"))
        .arg("--")
        .arg("/bin/true")
        .status()
        .unwrap();
    assert_ne!(status.code(), Some(0));
    assert!(!meta_path.exists());
}

// An x86-64 filter that allows everything except mount(2), which raises a
// user notification.
fn mount_deny_filter() -> Vec<u8> {
    const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;
    const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
    const SECCOMP_RET_USER_NOTIF: u32 = 0x7fc0_0000;

    let insns: [(u16, u8, u8, u32); 7] = [
        (0x20, 0, 0, 4),                          // load arch
        (0x15, 1, 0, AUDIT_ARCH_X86_64),          // matches this machine?
        (0x06, 0, 0, 0),                          // no: kill
        (0x20, 0, 0, 0),                          // load syscall number
        (0x15, 1, 0, libc::SYS_mount as u32),     // mount?
        (0x06, 0, 0, SECCOMP_RET_ALLOW),          // no: allow
        (0x06, 0, 0, SECCOMP_RET_USER_NOTIF),     // yes: notify
    ];
    let mut bytes = Vec::with_capacity(insns.len() * 8);
    for (code, jt, jf, k) in insns {
        bytes.extend_from_slice(&code.to_ne_bytes());
        bytes.push(jt);
        bytes.push(jf);
        bytes.extend_from_slice(&k.to_ne_bytes());
    }
    bytes
}

fn can_run_sandboxed() -> bool {
    nix::unistd::Uid::effective().is_root() && Path::new("/proc/self/ns/user").exists()
}

/// Needs root and working user/pid namespace support.
#[test]
#[ignore]
fn test_sandboxed_true_reports_status_zero() {
    if !can_run_sandboxed() {
        eprintln!("skipping: requires root and namespace support");
        return;
    }
    let outcome = run_jail(false, &[], &["/bin/true"]);
    assert_eq!(outcome.record.terminal, Terminal::Status(0));
    assert_eq!(outcome.exit_code, 0);
}

/// Needs root and working user/pid namespace support.
#[test]
#[ignore]
fn test_sandboxed_forbidden_syscall_reports_sigsys_and_name() {
    if !can_run_sandboxed() {
        eprintln!("skipping: requires root and namespace support");
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let filter_path = tmp.path().join("deny-mount.bpf");
    std::fs::write(&filter_path, mount_deny_filter()).unwrap();

    let outcome = run_jail(
        false,
        &[
            "--seccomp-program",
            filter_path.to_str().unwrap(),
            "--time-limit",
            "2000",
        ],
        &["/bin/sh", "-c", "mount -t tmpfs none /mnt"],
    );
    assert_eq!(
        outcome.record.terminal,
        Terminal::Syscall(libc::SYS_mount as i32)
    );
    assert_eq!(outcome.exit_code, libc::SIGSYS);
    assert!(outcome.raw_meta.contains("signal:SIGSYS"));
    assert!(outcome.raw_meta.contains("syscall:mount"));
}

/// Needs root, namespace support, and a writable v1 memory cgroup layout.
#[test]
#[ignore]
fn test_sandboxed_memory_limit_pins_reported_memory() {
    if !can_run_sandboxed() {
        eprintln!("skipping: requires root and namespace support");
        return;
    }
    let limit = 64 * 1024 * 1024i64;
    let outcome = run_jail(
        false,
        &[
            "--cgroup-memory-limit",
            &limit.to_string(),
            "--time-limit",
            "5000",
        ],
        &[
            "/bin/sh",
            "-c",
            "head -c 200M /dev/zero | tail -c 1 > /dev/null",
        ],
    );
    assert!(outcome.record.mem_bytes <= limit, "{:?}", outcome.raw_meta);
}

/// Core types and structures for the omegajail supervisor
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Well-known file descriptors reserved across the clone boundary. The
/// supervisor guarantees the right descriptor occupies each slot before the
/// container init starts; everything inside consumes them by number.
pub const LOGGING_FD: RawFd = 3;
pub const META_FD: RawFd = 4;
pub const SIGSYS_FD: RawFd = 5;

/// Hostname set inside the UTS namespace.
pub const JAIL_HOSTNAME: &str = "omegajail";

/// How seccomp-bpf denials are classified into a syscall number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigsysDetector {
    /// Classifier thread fed by the seccomp user-notification fd (default).
    SigsysTracer,
    /// Ptrace SIGSYS interception only.
    Ptrace,
    /// No classification; a denial is reported as a bare SIGSYS.
    Disabled,
}

/// One rlimit to apply in the child, in policy order.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RlimitSpec {
    pub resource: libc::__rlimit_resource_t,
    pub soft: u64,
    pub hard: u64,
}

/// An extra bind mount applied before the root is remounted read-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub writable: bool,
}

/// Immutable description of a single jailed run. Built once by the caller,
/// then shared read-only with the container init across the clone.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Policy {
    pub disable_sandboxing: bool,
    /// Reported process title of the jailed program.
    pub comm: Option<String>,
    pub chdir: Option<PathBuf>,
    pub stdin_redirect: Option<PathBuf>,
    pub stdout_redirect: Option<PathBuf>,
    pub stderr_redirect: Option<PathBuf>,
    /// Metadata output path. `None` disables the in-container init entirely.
    pub meta: Option<PathBuf>,
    /// Basename of the seccomp program, used to derive the cgroup path.
    pub script_basename: Option<String>,
    /// Parent directory for the per-run scoped cgroup, filled in during
    /// supervisor configuration when the layout is usable.
    pub cgroup_path: Option<PathBuf>,
    /// Cgroup directories that must be bind-mounted into the container so
    /// the init can reach them once the root is read-only.
    pub cgroup_binds: Vec<PathBuf>,
    /// Cgroup-enforced memory limit in bytes. Negative disables it.
    pub memory_limit_bytes: i64,
    /// Constant subtracted from the measured RSS to discount VM overhead.
    pub vm_memory_bytes: u64,
    pub rlimits: Vec<RlimitSpec>,
    pub wall_time_limit: Duration,
    pub sigsys_detector: SigsysDetector,
    /// Raw seccomp-bpf program, 8 bytes per instruction. Empty disables
    /// syscall filtering.
    pub seccomp_filter: Vec<u8>,
    pub binds: Vec<BindMount>,
    pub program: PathBuf,
    /// Full argument vector, including `argv[0]`.
    pub args: Vec<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            disable_sandboxing: false,
            comm: None,
            chdir: None,
            stdin_redirect: None,
            stdout_redirect: None,
            stderr_redirect: None,
            meta: None,
            script_basename: None,
            cgroup_path: None,
            cgroup_binds: Vec::new(),
            memory_limit_bytes: -1,
            vm_memory_bytes: 0,
            rlimits: Vec::new(),
            wall_time_limit: Duration::from_millis(u64::MAX),
            sigsys_detector: SigsysDetector::SigsysTracer,
            seccomp_filter: Vec::new(),
            binds: Vec::new(),
            program: PathBuf::new(),
            args: Vec::new(),
        }
    }
}

/// Custom error types for omegajail
#[derive(Error, Debug)]
pub enum JailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("setup error: {0}")]
    Setup(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cgroup error: {0}")]
    Cgroup(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("seccomp error: {0}")]
    Seccomp(String),
}

impl From<nix::errno::Errno> for JailError {
    fn from(err: nix::errno::Errno) -> Self {
        JailError::Process(err.to_string())
    }
}

/// Result type alias for omegajail operations
pub type Result<T> = std::result::Result<T, JailError>;

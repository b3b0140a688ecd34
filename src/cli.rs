//! Command-line interface, translated into a [`Policy`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::seccomp;
use crate::types::{BindMount, JailError, Policy, Result, RlimitSpec, SigsysDetector};

#[derive(Parser, Debug)]
#[command(name = "omegajail", about = "The omegaUp sandbox", version)]
struct Cli {
    /// Reported name of the program
    #[arg(long, value_name = "name")]
    comm: Option<String>,

    /// Change directory to |path| before running the program
    #[arg(short = 'd', long, value_name = "path")]
    chdir: Option<PathBuf>,

    /// Bind a directory into the jail (src,dest[,1] for writable)
    #[arg(short = 'b', long = "bind", value_name = "src,dest[,1]")]
    binds: Vec<String>,

    /// Redirect stdin
    #[arg(short = '0', long, value_name = "filename")]
    stdin: Option<PathBuf>,

    /// Redirect stdout
    #[arg(short = '1', long, value_name = "filename")]
    stdout: Option<PathBuf>,

    /// Redirect stderr
    #[arg(short = '2', long, value_name = "filename")]
    stderr: Option<PathBuf>,

    /// Write the metadata record to this file
    #[arg(short = 'M', long, value_name = "filename")]
    meta: Option<PathBuf>,

    /// CPU time limit in milliseconds
    #[arg(short = 't', long, value_name = "msec")]
    time_limit: Option<u64>,

    /// Additional wall time allowed on top of the time limit, in milliseconds
    #[arg(short = 'w', long, value_name = "msec", default_value_t = 1000)]
    extra_wall_time_limit: u64,

    /// Stack size limit in bytes
    #[arg(short = 'k', long, value_name = "bytes")]
    stack_limit: Option<u64>,

    /// Output (file size) limit in bytes
    #[arg(short = 'O', long, value_name = "bytes")]
    output_limit: Option<u64>,

    /// Address space limit in bytes, -1 to disable
    #[arg(short = 'm', long, value_name = "bytes", default_value_t = -1)]
    memory_limit: i64,

    /// Memory limit enforced through cgroups, in bytes
    #[arg(long, value_name = "bytes")]
    cgroup_memory_limit: Option<i64>,

    /// Runtime overhead subtracted from the measured memory, in bytes
    #[arg(long, value_name = "bytes", default_value_t = 0)]
    vm_memory_size: u64,

    /// Compiled seccomp-bpf program to load
    #[arg(short = 'S', long, value_name = "filename")]
    seccomp_program: Option<PathBuf>,

    /// One of 'sigsys_tracer' (default), 'ptrace', 'none'
    #[arg(long, value_name = "detector", default_value = "sigsys_tracer")]
    sigsys_detector: String,

    /// Run without namespaces, cgroups, or seccomp
    #[arg(long)]
    disable_sandboxing: bool,

    /// Program to run, followed by its arguments
    #[arg(value_name = "program [args...]", trailing_var_arg = true, required = true)]
    program: Vec<String>,
}

/// Parses the process arguments into a policy.
pub fn parse() -> Result<Policy> {
    from_args(std::env::args())
}

fn from_args<I, T>(args: I) -> Result<Policy>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::try_parse_from(args).map_err(|err| JailError::Config(err.to_string()))?;
    build_policy(cli)
}

fn build_policy(cli: Cli) -> Result<Policy> {
    let mut policy = Policy {
        disable_sandboxing: cli.disable_sandboxing,
        comm: cli.comm,
        chdir: cli.chdir,
        stdin_redirect: cli.stdin.map(absolute),
        stdout_redirect: cli.stdout.map(absolute),
        stderr_redirect: cli.stderr.map(absolute),
        meta: cli.meta,
        memory_limit_bytes: cli.cgroup_memory_limit.unwrap_or(-1),
        vm_memory_bytes: cli.vm_memory_size,
        ..Policy::default()
    };

    for description in &cli.binds {
        policy.binds.push(parse_bind(description)?);
    }

    policy.sigsys_detector = match cli.sigsys_detector.as_str() {
        "sigsys_tracer" => SigsysDetector::SigsysTracer,
        "ptrace" => SigsysDetector::Ptrace,
        "none" => SigsysDetector::Disabled,
        other => {
            return Err(JailError::Config(format!(
                "invalid value for --sigsys-detector: {:?}",
                other
            )));
        }
    };

    if let Some(path) = &cli.seccomp_program {
        policy.seccomp_filter = seccomp::load_program(path)?;
        // The filter's name minus its 4-byte ".bpf" extension names the
        // cgroup.
        policy.script_basename = path.file_name().map(|name| {
            let mut name = name.to_string_lossy().into_owned();
            name.truncate(name.len().saturating_sub(4));
            name
        });
    }

    if let Some(raw_limit_msec) = cli.time_limit {
        // The rlimit is in whole seconds; round up and give the hard limit
        // one extra second so SIGKILL backs SIGXCPU up.
        let limit_sec = (raw_limit_msec + 999) / 1000;
        policy.rlimits.push(RlimitSpec {
            resource: libc::RLIMIT_CPU,
            soft: limit_sec,
            hard: limit_sec + 1,
        });
        policy.wall_time_limit =
            Duration::from_millis(raw_limit_msec.saturating_add(cli.extra_wall_time_limit));
    }

    if let Some(limit) = cli.stack_limit {
        policy.rlimits.push(RlimitSpec {
            resource: libc::RLIMIT_STACK,
            soft: limit,
            hard: limit,
        });
    }

    if let Some(limit) = cli.output_limit {
        policy.rlimits.push(RlimitSpec {
            resource: libc::RLIMIT_FSIZE,
            soft: limit,
            hard: limit,
        });
        // An output limit also rules out core dumps.
        policy.rlimits.push(RlimitSpec {
            resource: libc::RLIMIT_CORE,
            soft: 0,
            hard: 0,
        });
    }

    if cli.memory_limit >= 0 {
        policy.rlimits.push(RlimitSpec {
            resource: libc::RLIMIT_AS,
            soft: cli.memory_limit as u64,
            hard: cli.memory_limit as u64,
        });
    }

    policy.program = PathBuf::from(&cli.program[0]);
    policy.args = cli.program;

    Ok(policy)
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

fn parse_bind(description: &str) -> Result<BindMount> {
    let parts: Vec<&str> = description.split(',').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(JailError::Config(format!(
            "invalid bind description: {:?}",
            description
        )));
    }
    Ok(BindMount {
        source: Path::new(parts[0]).to_path_buf(),
        target: Path::new(parts[1]).to_path_buf(),
        writable: parts.len() == 3 && parts[2] == "1",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_line(args: &[&str]) -> Result<Policy> {
        from_args(std::iter::once("omegajail").chain(args.iter().copied()))
    }

    #[test]
    fn test_minimal_invocation() {
        let policy = parse_line(&["--", "/bin/true"]).unwrap();
        assert_eq!(policy.program, PathBuf::from("/bin/true"));
        assert_eq!(policy.args, vec!["/bin/true"]);
        assert!(policy.rlimits.is_empty());
    }

    #[test]
    fn test_program_arguments_pass_through() {
        let policy = parse_line(&["--", "/bin/sh", "-c", "exit 42"]).unwrap();
        assert_eq!(policy.args, vec!["/bin/sh", "-c", "exit 42"]);
    }

    #[test]
    fn test_missing_program_is_an_error() {
        assert!(parse_line(&["--meta", "/tmp/meta"]).is_err());
    }

    #[test]
    fn test_time_limit_derives_cpu_rlimit_and_wall_deadline() {
        let policy = parse_line(&["--time-limit", "2500", "--", "/bin/true"]).unwrap();
        let cpu = policy
            .rlimits
            .iter()
            .find(|spec| spec.resource == libc::RLIMIT_CPU)
            .unwrap();
        assert_eq!((cpu.soft, cpu.hard), (3, 4));
        assert_eq!(policy.wall_time_limit, Duration::from_millis(3500));
    }

    #[test]
    fn test_extra_wall_time_is_configurable() {
        let policy = parse_line(&[
            "--time-limit",
            "100",
            "--extra-wall-time-limit",
            "400",
            "--",
            "/bin/sh",
        ])
        .unwrap();
        assert_eq!(policy.wall_time_limit, Duration::from_millis(500));
    }

    #[test]
    fn test_no_time_limit_means_no_deadline() {
        let policy = parse_line(&["--", "/bin/true"]).unwrap();
        assert!(policy.wall_time_limit >= Duration::from_secs(60 * 60 * 24 * 365));
    }

    #[test]
    fn test_output_limit_also_disables_core_dumps() {
        let policy = parse_line(&["--output-limit", "1024", "--", "/bin/true"]).unwrap();
        let fsize = policy
            .rlimits
            .iter()
            .find(|spec| spec.resource == libc::RLIMIT_FSIZE)
            .unwrap();
        assert_eq!((fsize.soft, fsize.hard), (1024, 1024));
        let core = policy
            .rlimits
            .iter()
            .find(|spec| spec.resource == libc::RLIMIT_CORE)
            .unwrap();
        assert_eq!((core.soft, core.hard), (0, 0));
    }

    #[test]
    fn test_memory_limit_becomes_address_space_rlimit() {
        let policy = parse_line(&["--memory-limit", "268435456", "--", "/bin/true"]).unwrap();
        let address_space = policy
            .rlimits
            .iter()
            .find(|spec| spec.resource == libc::RLIMIT_AS)
            .unwrap();
        assert_eq!(address_space.soft, 268435456);
    }

    #[test]
    fn test_cgroup_memory_limit_is_separate() {
        let policy = parse_line(&[
            "--cgroup-memory-limit",
            "67108864",
            "--",
            "/bin/true",
        ])
        .unwrap();
        assert_eq!(policy.memory_limit_bytes, 67108864);
        assert!(policy.rlimits.is_empty());
    }

    #[test]
    fn test_bind_parsing() {
        let policy = parse_line(&[
            "--bind",
            "/src,/dst",
            "--bind",
            "/a,/b,1",
            "--",
            "/bin/true",
        ])
        .unwrap();
        assert_eq!(policy.binds.len(), 2);
        assert!(!policy.binds[0].writable);
        assert!(policy.binds[1].writable);
    }

    #[test]
    fn test_bind_rejects_malformed_descriptions() {
        assert!(parse_line(&["--bind", "/only-source", "--", "/bin/true"]).is_err());
        assert!(parse_line(&["--bind", "/a,/b,1,extra", "--", "/bin/true"]).is_err());
    }

    #[test]
    fn test_sigsys_detector_values() {
        for (value, expected) in [
            ("sigsys_tracer", SigsysDetector::SigsysTracer),
            ("ptrace", SigsysDetector::Ptrace),
            ("none", SigsysDetector::Disabled),
        ] {
            let policy =
                parse_line(&["--sigsys-detector", value, "--", "/bin/true"]).unwrap();
            assert_eq!(policy.sigsys_detector, expected);
        }
        assert!(parse_line(&["--sigsys-detector", "bogus", "--", "/bin/true"]).is_err());
    }

    #[test]
    fn test_seccomp_program_sets_script_basename() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cpp17-run.bpf");
        std::fs::write(&path, [0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x7f]).unwrap();

        let policy = parse_line(&[
            "--seccomp-program",
            path.to_str().unwrap(),
            "--",
            "/bin/true",
        ])
        .unwrap();
        assert_eq!(policy.script_basename.as_deref(), Some("cpp17-run"));
        assert_eq!(policy.seccomp_filter.len(), 8);
    }

    #[test]
    fn test_relative_redirects_become_absolute() {
        let policy = parse_line(&["--stdout", "out.txt", "--", "/bin/true"]).unwrap();
        assert!(policy.stdout_redirect.unwrap().is_absolute());
    }
}

//! The metadata record written for every supervised run.
//!
//! The record is a sequence of `key:value` lines in a fixed order: `time`,
//! `time-sys`, `time-wall` (all microseconds), `mem` (bytes), then exactly
//! one terminal block describing how the program ended. `syscall` appears
//! only alongside `signal:SIGSYS`.

use std::io::Write;

use crate::types::{JailError, Result};

/// Signals reported by name; anything else becomes `signal_number`.
const SIGNAL_NAMES: &[(i32, &str)] = &[
    (libc::SIGHUP, "SIGHUP"),
    (libc::SIGINT, "SIGINT"),
    (libc::SIGQUIT, "SIGQUIT"),
    (libc::SIGILL, "SIGILL"),
    (libc::SIGTRAP, "SIGTRAP"),
    (libc::SIGABRT, "SIGABRT"),
    (libc::SIGBUS, "SIGBUS"),
    (libc::SIGFPE, "SIGFPE"),
    (libc::SIGKILL, "SIGKILL"),
    (libc::SIGUSR1, "SIGUSR1"),
    (libc::SIGSEGV, "SIGSEGV"),
    (libc::SIGUSR2, "SIGUSR2"),
    (libc::SIGPIPE, "SIGPIPE"),
    (libc::SIGALRM, "SIGALRM"),
    (libc::SIGTERM, "SIGTERM"),
    (libc::SIGSTKFLT, "SIGSTKFLT"),
    (libc::SIGCHLD, "SIGCHLD"),
    (libc::SIGCONT, "SIGCONT"),
    (libc::SIGSTOP, "SIGSTOP"),
    (libc::SIGTSTP, "SIGTSTP"),
    (libc::SIGTTIN, "SIGTTIN"),
    (libc::SIGTTOU, "SIGTTOU"),
    (libc::SIGURG, "SIGURG"),
    (libc::SIGXCPU, "SIGXCPU"),
    (libc::SIGXFSZ, "SIGXFSZ"),
    (libc::SIGVTALRM, "SIGVTALRM"),
    (libc::SIGPROF, "SIGPROF"),
    (libc::SIGWINCH, "SIGWINCH"),
    (libc::SIGIO, "SIGIO"),
    (libc::SIGPWR, "SIGPWR"),
    (libc::SIGSYS, "SIGSYS"),
];

pub fn signal_name(signo: i32) -> Option<&'static str> {
    SIGNAL_NAMES
        .iter()
        .find(|(number, _)| *number == signo)
        .map(|(_, name)| *name)
}

pub fn signal_number(name: &str) -> Option<i32> {
    SIGNAL_NAMES
        .iter()
        .find(|(_, known)| *known == name)
        .map(|(number, _)| *number)
}

/// Renders a syscall number as its name, or `#<nr>` when unknown.
pub fn syscall_name(nr: i32) -> String {
    usize::try_from(nr)
        .ok()
        .and_then(syscalls::Sysno::new)
        .map_or_else(|| format!("#{}", nr), |sysno| sysno.name().to_string())
}

fn syscall_number(name: &str) -> Option<i32> {
    if let Some(raw) = name.strip_prefix('#') {
        return raw.parse().ok();
    }
    name.parse::<syscalls::Sysno>().ok().map(|sysno| sysno.id())
}

/// How the jailed program ended, in reporting precedence order: a denied
/// syscall beats a signal, which beats a plain exit status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminal {
    /// Killed for attempting a forbidden syscall.
    Syscall(i32),
    /// Terminated by (or charged with) a signal.
    Signal(i32),
    /// Exited normally with a status code.
    Status(i32),
}

/// One fully collected run outcome, ready to serialize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaRecord {
    pub user_usec: i64,
    pub sys_usec: i64,
    pub wall_usec: i64,
    pub mem_bytes: i64,
    pub terminal: Terminal,
}

impl MetaRecord {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        write!(
            writer,
            "time:{}\ntime-sys:{}\ntime-wall:{}\nmem:{}\n",
            self.user_usec, self.sys_usec, self.wall_usec, self.mem_bytes
        )?;
        match self.terminal {
            Terminal::Syscall(nr) => {
                write!(writer, "signal:SIGSYS\nsyscall:{}\n", syscall_name(nr))?;
            }
            Terminal::Signal(signo) => match signal_name(signo) {
                Some(name) => write!(writer, "signal:{}\n", name)?,
                None => write!(writer, "signal_number:{}\n", signo)?,
            },
            Terminal::Status(code) => write!(writer, "status:{}\n", code)?,
        }
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        self.write_to(&mut buf).expect("write to Vec cannot fail");
        String::from_utf8(buf).expect("metadata is ASCII")
    }

    /// Parses a record previously produced by [`MetaRecord::write_to`].
    pub fn parse(input: &str) -> Result<MetaRecord> {
        let mut user_usec = None;
        let mut sys_usec = None;
        let mut wall_usec = None;
        let mut mem_bytes = None;
        let mut terminal = None;
        let mut sigsys = false;

        for line in input.lines() {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| JailError::Config(format!("malformed metadata line: {line:?}")))?;
            let parse_int = || {
                value
                    .parse::<i64>()
                    .map_err(|_| JailError::Config(format!("bad integer in metadata: {line:?}")))
            };
            match key {
                "time" => user_usec = Some(parse_int()?),
                "time-sys" => sys_usec = Some(parse_int()?),
                "time-wall" => wall_usec = Some(parse_int()?),
                "mem" => mem_bytes = Some(parse_int()?),
                "status" => terminal = Some(Terminal::Status(parse_int()? as i32)),
                "signal" => {
                    if value == "SIGSYS" {
                        sigsys = true;
                        terminal = Some(Terminal::Signal(libc::SIGSYS));
                    } else {
                        let signo = signal_number(value).ok_or_else(|| {
                            JailError::Config(format!("unknown signal in metadata: {value:?}"))
                        })?;
                        terminal = Some(Terminal::Signal(signo));
                    }
                }
                "signal_number" => terminal = Some(Terminal::Signal(parse_int()? as i32)),
                "syscall" => {
                    if !sigsys {
                        return Err(JailError::Config(
                            "syscall key without signal:SIGSYS".to_string(),
                        ));
                    }
                    let nr = syscall_number(value).ok_or_else(|| {
                        JailError::Config(format!("unknown syscall in metadata: {value:?}"))
                    })?;
                    terminal = Some(Terminal::Syscall(nr));
                }
                _ => {
                    return Err(JailError::Config(format!(
                        "unknown metadata key: {key:?}"
                    )));
                }
            }
        }

        let missing = |name: &str| JailError::Config(format!("metadata missing {name}"));
        Ok(MetaRecord {
            user_usec: user_usec.ok_or_else(|| missing("time"))?,
            sys_usec: sys_usec.ok_or_else(|| missing("time-sys"))?,
            wall_usec: wall_usec.ok_or_else(|| missing("time-wall"))?,
            mem_bytes: mem_bytes.ok_or_else(|| missing("mem"))?,
            terminal: terminal.ok_or_else(|| missing("a terminal block"))?,
        })
    }

    /// The supervisor's process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self.terminal {
            Terminal::Syscall(_) => libc::SIGSYS,
            Terminal::Signal(signo) => signo,
            Terminal::Status(code) => code,
        }
    }
}

/// Maps the collected wait state to the terminal block, top-down: denied
/// syscall, then signal (either synthesized or from the wait status), then
/// plain exit.
pub fn resolve_terminal(
    exit_syscall: Option<i32>,
    exit_signal: Option<i32>,
    wait_status: i32,
) -> Terminal {
    if let Some(nr) = exit_syscall {
        return Terminal::Syscall(nr);
    }
    if libc::WIFSIGNALED(wait_status) || exit_signal.is_some() {
        return Terminal::Signal(exit_signal.unwrap_or_else(|| libc::WTERMSIG(wait_status)));
    }
    Terminal::Status(if libc::WIFEXITED(wait_status) {
        libc::WEXITSTATUS(wait_status)
    } else {
        0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(terminal: Terminal) -> MetaRecord {
        MetaRecord {
            user_usec: 1500,
            sys_usec: 200,
            wall_usec: 2048,
            mem_bytes: 4096,
            terminal,
        }
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            record(Terminal::Status(42)).render(),
            "time:1500\ntime-sys:200\ntime-wall:2048\nmem:4096\nstatus:42\n"
        );
    }

    #[test]
    fn test_signal_serialization_known_and_unknown() {
        assert!(record(Terminal::Signal(libc::SIGABRT))
            .render()
            .ends_with("signal:SIGABRT\n"));
        assert!(record(Terminal::Signal(63))
            .render()
            .ends_with("signal_number:63\n"));
    }

    #[test]
    fn test_sigsys_serialization_carries_syscall() {
        let rendered = record(Terminal::Syscall(libc::SYS_mount as i32)).render();
        assert!(rendered.ends_with("signal:SIGSYS\nsyscall:mount\n"));
    }

    #[test]
    fn test_unknown_syscall_renders_number() {
        let rendered = record(Terminal::Syscall(100_000)).render();
        assert!(rendered.ends_with("syscall:#100000\n"));
    }

    #[test]
    fn test_parse_round_trip_preserves_bytes() {
        for terminal in [
            Terminal::Status(0),
            Terminal::Status(42),
            Terminal::Signal(libc::SIGXCPU),
            Terminal::Signal(63),
            Terminal::Syscall(libc::SYS_mount as i32),
            Terminal::Syscall(100_000),
        ] {
            let original = record(terminal).render();
            let reparsed = MetaRecord::parse(&original).unwrap().render();
            assert_eq!(original, reparsed);
        }
    }

    #[test]
    fn test_parse_rejects_stray_syscall() {
        let err = MetaRecord::parse(
            "time:0\ntime-sys:0\ntime-wall:0\nmem:0\nstatus:0\nsyscall:mount\n",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_record() {
        assert!(MetaRecord::parse("time:0\ntime-sys:0\n").is_err());
    }

    #[test]
    fn test_key_order_is_fixed() {
        let rendered = record(Terminal::Signal(libc::SIGSEGV)).render();
        let keys: Vec<&str> = rendered
            .lines()
            .map(|line| line.split(':').next().unwrap())
            .collect();
        assert_eq!(keys, ["time", "time-sys", "time-wall", "mem", "signal"]);
    }

    #[test]
    fn test_resolve_terminal_precedence() {
        let exited_42 = 42 << 8;
        let signaled_abrt = libc::SIGABRT;

        // A classified syscall wins over everything.
        assert_eq!(
            resolve_terminal(Some(165), Some(libc::SIGXCPU), exited_42),
            Terminal::Syscall(165)
        );
        // A synthesized signal wins over the wait status.
        assert_eq!(
            resolve_terminal(None, Some(libc::SIGXCPU), exited_42),
            Terminal::Signal(libc::SIGXCPU)
        );
        // A real death signal is reported as-is.
        assert_eq!(
            resolve_terminal(None, None, signaled_abrt),
            Terminal::Signal(libc::SIGABRT)
        );
        // Otherwise the exit status is the outcome.
        assert_eq!(resolve_terminal(None, None, exited_42), Terminal::Status(42));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(record(Terminal::Syscall(165)).exit_code(), libc::SIGSYS);
        assert_eq!(
            record(Terminal::Signal(libc::SIGXCPU)).exit_code(),
            libc::SIGXCPU
        );
        assert_eq!(record(Terminal::Status(42)).exit_code(), 42);
    }
}

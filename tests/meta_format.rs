//! Round-trip properties of the metadata record as written to disk.

use std::io::Write as _;

use omegajail::meta::{signal_name, MetaRecord, Terminal};

fn sample_records() -> Vec<MetaRecord> {
    let mut records = Vec::new();
    for terminal in [
        Terminal::Status(0),
        Terminal::Status(42),
        Terminal::Status(255),
        Terminal::Signal(libc::SIGABRT),
        Terminal::Signal(libc::SIGXCPU),
        Terminal::Signal(libc::SIGXFSZ),
        Terminal::Signal(libc::SIGKILL),
        Terminal::Signal(63),
        Terminal::Syscall(libc::SYS_mount as i32),
        Terminal::Syscall(libc::SYS_ptrace as i32),
        Terminal::Syscall(98765),
    ] {
        records.push(MetaRecord {
            user_usec: 123_456,
            sys_usec: 7_890,
            wall_usec: 131_415,
            mem_bytes: 8 << 20,
            terminal,
        });
    }
    records
}

#[test]
fn test_file_round_trip_is_byte_identical() {
    let tmp = tempfile::tempdir().unwrap();
    for (index, record) in sample_records().iter().enumerate() {
        let path = tmp.path().join(format!("meta-{}", index));
        let mut file = std::fs::File::create(&path).unwrap();
        record.write_to(&mut file).unwrap();
        file.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let reparsed = MetaRecord::parse(&contents).unwrap();
        assert_eq!(*record, reparsed);
        assert_eq!(contents, reparsed.render());
    }
}

#[test]
fn test_exactly_one_terminal_key() {
    for record in sample_records() {
        let rendered = record.render();
        let terminal_keys = rendered
            .lines()
            .filter(|line| {
                line.starts_with("status:")
                    || line.starts_with("signal:")
                    || line.starts_with("signal_number:")
            })
            .count();
        assert_eq!(terminal_keys, 1, "in {:?}", rendered);

        let has_syscall = rendered.lines().any(|line| line.starts_with("syscall:"));
        let is_sigsys = rendered.lines().any(|line| line == "signal:SIGSYS");
        assert_eq!(has_syscall, is_sigsys, "in {:?}", rendered);
    }
}

#[test]
fn test_records_end_without_blank_line() {
    for record in sample_records() {
        let rendered = record.render();
        assert!(rendered.ends_with('\n'));
        assert!(!rendered.ends_with("\n\n"));
    }
}

#[test]
fn test_all_fixed_signals_have_names() {
    for signo in [
        libc::SIGHUP,
        libc::SIGABRT,
        libc::SIGKILL,
        libc::SIGSEGV,
        libc::SIGXCPU,
        libc::SIGXFSZ,
        libc::SIGSYS,
    ] {
        assert!(signal_name(signo).is_some(), "signal {}", signo);
    }
    // Realtime signals are outside the fixed set.
    assert!(signal_name(libc::SIGSYS + 32).is_none());
}

//! Loading and installing compiled seccomp-bpf programs.

use std::os::unix::io::RawFd;
use std::path::Path;

use crate::scoped::ScopedFd;
use crate::types::{JailError, Result};

const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;
const SECCOMP_FILTER_FLAG_NEW_LISTENER: libc::c_ulong = 1 << 3;

const BPF_INSTRUCTION_LEN: usize = 8;

/// Reads a compiled BPF program from disk.
pub fn load_program(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).map_err(|err| {
        JailError::Seccomp(format!("failed to read {}: {}", path.display(), err))
    })?;
    validate(&bytes)?;
    Ok(bytes)
}

fn validate(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() || bytes.len() % BPF_INSTRUCTION_LEN != 0 {
        return Err(JailError::Seccomp(format!(
            "filter length {} is not a whole number of BPF instructions",
            bytes.len()
        )));
    }
    if bytes.len() / BPF_INSTRUCTION_LEN > u16::MAX as usize {
        return Err(JailError::Seccomp("filter has too many instructions".to_string()));
    }
    Ok(())
}

fn to_instructions(filter: &[u8]) -> Vec<libc::sock_filter> {
    filter
        .chunks_exact(BPF_INSTRUCTION_LEN)
        .map(|chunk| libc::sock_filter {
            code: u16::from_ne_bytes([chunk[0], chunk[1]]),
            jt: chunk[2],
            jf: chunk[3],
            k: u32::from_ne_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
        })
        .collect()
}

/// Installs the filter on the calling process. Requires `no_new_privs` to
/// already be set. With `new_listener`, the returned descriptor receives
/// user notifications for denied syscalls.
pub fn install(filter: &[u8], new_listener: bool) -> Result<Option<ScopedFd>> {
    validate(filter)?;
    let instructions = to_instructions(filter);
    let program = libc::sock_fprog {
        len: instructions.len() as libc::c_ushort,
        filter: instructions.as_ptr() as *mut libc::sock_filter,
    };
    let flags = if new_listener {
        SECCOMP_FILTER_FLAG_NEW_LISTENER
    } else {
        0
    };
    let rc = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            flags,
            &program as *const libc::sock_fprog,
        )
    };
    if rc < 0 {
        return Err(JailError::Seccomp(format!(
            "failed to install the seccomp filter: {}",
            std::io::Error::last_os_error()
        )));
    }
    if new_listener {
        Ok(Some(ScopedFd::new(rc as RawFd)))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // BPF_RET | BPF_K with SECCOMP_RET_ALLOW, little endian.
    const ALLOW_ALL: [u8; 8] = [0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x7f];

    #[test]
    fn test_load_program_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("policy.bpf");
        std::fs::write(&path, ALLOW_ALL).unwrap();
        assert_eq!(load_program(&path).unwrap(), ALLOW_ALL);
    }

    #[test]
    fn test_load_program_rejects_partial_instruction() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.bpf");
        std::fs::write(&path, [0u8; 7]).unwrap();
        assert!(load_program(&path).is_err());
    }

    #[test]
    fn test_load_program_rejects_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.bpf");
        std::fs::write(&path, []).unwrap();
        assert!(load_program(&path).is_err());
    }

    #[test]
    fn test_instruction_decoding() {
        let instructions = to_instructions(&ALLOW_ALL);
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].code, 0x06);
        assert_eq!(instructions[0].k, 0x7fff_0000);
    }
}

use std::fs::File;
use std::os::unix::io::FromRawFd;

use anyhow::{Context, Result};

use omegajail::types::{LOGGING_FD, SIGSYS_FD};
use omegajail::{cli, supervisor};

/// Reserves fd 3 as the log sink (a dup of stderr) and points the logger at
/// a close-on-exec duplicate of it, clear of the well-known slots.
fn setup_logging() -> Result<()> {
    nix::unistd::dup2(libc::STDERR_FILENO, LOGGING_FD).context("failed to set up the log fd")?;
    let logger_fd = nix::fcntl::fcntl(
        LOGGING_FD,
        nix::fcntl::FcntlArg::F_DUPFD_CLOEXEC(SIGSYS_FD + 1),
    )
    .context("failed to duplicate the log fd")?;
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(unsafe {
            File::from_raw_fd(logger_fd)
        })))
        .init();
    Ok(())
}

fn main() -> Result<()> {
    setup_logging()?;

    let policy = cli::parse().context("failed to parse the arguments")?;
    let exit_code = supervisor::run(policy)?;
    std::process::exit(exit_code);
}

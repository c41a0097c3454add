//! Moves the worker's control channel off the standard fds.
//!
//! The worker talks to its controller over the stdin/stdout it was started
//! with. Target code runs in the same process: a `println!`, a test runner's
//! progress output or a subprocess inheriting fd 1 would write straight into
//! the framed channel and corrupt it.
//!
//! Before any target code runs, the channel is duplicated onto private
//! close-on-exec fds, fd 1 is pointed at stderr and fd 0 at `/dev/null`.
//!
//! ## Safety contracts
//!
//! The `unsafe` blocks rely on:
//! 1. fds 0, 1 and 2 being open, which the OS guarantees at process start
//! 2. nothing else reading or writing fds 0/1 while they are swapped (called
//!    before the target is created)
//! 3. `forget` on the `OwnedFd`s wrapping 0 and 1, so they are never closed

#[cfg(unix)]
use std::io;
#[cfg(unix)]
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

#[cfg(unix)]
use nix::unistd::dup2;

/// The controller connection after redirection.
#[cfg(unix)]
pub(crate) struct ControlChannel {
    pub reader: tokio::fs::File,
    pub writer: tokio::fs::File,
}

#[cfg(unix)]
pub(crate) fn isolate_control_channel() -> io::Result<ControlChannel> {
    // Safety: the standard fds are open for the life of the process.
    let (stdin, stdout, stderr) = unsafe {
        (
            BorrowedFd::borrow_raw(0),
            BorrowedFd::borrow_raw(1),
            BorrowedFd::borrow_raw(2),
        )
    };

    // F_DUPFD_CLOEXEC: subprocesses of target code never hold the channel open.
    let control_in = stdin.try_clone_to_owned()?;
    let control_out = stdout.try_clone_to_owned()?;
    tracing::debug!(
        control_in = control_in.as_raw_fd(),
        control_out = control_out.as_raw_fd(),
        "Moved control channel off stdio"
    );

    let null = std::fs::File::open("/dev/null")?;
    replace_fd(0, &null).map_err(|e| io::Error::other(format!("dup2(stdin) failed: {e}")))?;
    replace_fd(1, &stderr).map_err(|e| io::Error::other(format!("dup2(stdout) failed: {e}")))?;
    tracing::trace!("Pointed fd 0 at /dev/null and fd 1 at stderr");

    Ok(ControlChannel {
        reader: tokio::fs::File::from_std(std::fs::File::from(control_in)),
        writer: tokio::fs::File::from_std(std::fs::File::from(control_out)),
    })
}

/// `dup2(source, fd)` without ever closing `fd`, even on failure.
#[cfg(unix)]
fn replace_fd(fd: i32, source: &impl std::os::fd::AsFd) -> nix::Result<()> {
    // Safety: `fd` is a standard fd (open), and is forgotten below rather than closed.
    let mut target = unsafe { OwnedFd::from_raw_fd(fd) };
    let result = dup2(source, &mut target);
    std::mem::forget(target);
    result
}

#[cfg(not(unix))]
pub(crate) struct ControlChannel {
    pub reader: tokio::io::Stdin,
    pub writer: tokio::io::Stdout,
}

/// No redirection off Unix: target output still shares the channel.
#[cfg(not(unix))]
pub(crate) fn isolate_control_channel() -> std::io::Result<ControlChannel> {
    Ok(ControlChannel {
        reader: tokio::io::stdin(),
        writer: tokio::io::stdout(),
    })
}

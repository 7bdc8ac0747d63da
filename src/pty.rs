//! PTY creation and management.
//!
//! Provides helpers for spawning a process in a fresh pseudo-terminal.
//!
//! # Safety
//!
//! This module uses unsafe code for PTY operations (fork, ioctl, dup2).
//! These are fundamental operations that cannot be done safely.

#![allow(unsafe_code)]

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execve, fork, pipe2, setsid, ForkResult, Pid};
use std::ffi::{CString, NulError};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("failed to create exec status pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to create session: {0}")]
    Setsid(#[source] nix::Error),

    #[error("failed to set controlling terminal: {0}")]
    SetControllingTerminal(#[source] nix::Error),

    #[error("failed to redirect stdio to the terminal: {0}")]
    Redirect(#[source] nix::Error),

    #[error("failed to change directory: {0}")]
    Chdir(#[source] nix::Error),

    #[error("failed to exec: {0}")]
    Exec(#[source] nix::Error),

    #[error("invalid command string: {0}")]
    InvalidCommand(#[source] NulError),

    #[error("failed to resize terminal: {0}")]
    Resize(#[source] nix::Error),

    #[error("failed to send signal: {0}")]
    Signal(#[source] nix::Error),

    #[error("failed to wait: {0}")]
    Wait(#[source] nix::Error),
}

// Stage markers written by the child to the status pipe before `_exit`.
const STAGE_SETSID: u8 = 1;
const STAGE_CTTY: u8 = 2;
const STAGE_REDIRECT: u8 = 3;
const STAGE_CHDIR: u8 = 4;
const STAGE_EXEC: u8 = 5;

/// What to run and where.
#[derive(Debug, Clone, Copy)]
pub struct SpawnOptions<'a> {
    /// Resolved path of the program to exec.
    pub program: &'a Path,
    /// Arguments after argv[0].
    pub args: &'a [String],
    /// Working directory of the child.
    pub cwd: &'a Path,
    /// Complete environment of the child (KEY, VALUE).
    pub env: &'a [(String, String)],
    /// Terminal height in rows.
    pub rows: u16,
    /// Terminal width in columns.
    pub cols: u16,
}

/// Result of spawning a process in a PTY.
pub struct PtyProcess {
    /// The master side of the PTY (non-blocking, close-on-exec).
    pub master: OwnedFd,
    /// The child process ID. The child leads its own session and process group.
    pub pid: Pid,
    /// Terminal size.
    pub size: Winsize,
}

impl PtyProcess {
    /// Send a signal to the child process.
    pub fn signal(&self, sig: Signal) -> Result<(), PtyError> {
        signal::kill(self.pid, sig).map_err(PtyError::Signal)
    }

    /// Check if the child process has exited without blocking.
    pub fn try_wait(&self) -> Result<Option<i32>, PtyError> {
        try_wait(self.pid)
    }

    /// Wait for the child process to exit (blocking).
    pub fn wait(&self) -> Result<i32, PtyError> {
        wait(self.pid)
    }

    /// Resize the PTY.
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.size = set_window_size(&self.master, rows, cols)?;
        Ok(())
    }
}

/// Check if a child has exited without blocking.
/// Returns `Some(exit_code)` if exited, None if still running.
pub fn try_wait(pid: Pid) -> Result<Option<i32>, PtyError> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)).map_err(PtyError::Wait)? {
        WaitStatus::Exited(_, code) => Ok(Some(code)),
        WaitStatus::Signaled(_, sig, _) => Ok(Some(128 + sig as i32)),
        // All other states (StillAlive, Stopped, Continued, etc.) mean not exited yet
        _ => Ok(None),
    }
}

/// Wait for a child to exit (blocking).
pub fn wait(pid: Pid) -> Result<i32, PtyError> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
            Ok(status) => {
                tracing::debug!(?status, "child not exited yet, waiting again");
            }
            Err(Errno::EINTR) => {}
            Err(e) => return Err(PtyError::Wait(e)),
        }
    }
}

/// Set the window size of the terminal behind `fd` (TIOCSWINSZ).
pub fn set_window_size(fd: &impl AsRawFd, rows: u16, cols: u16) -> Result<Winsize, PtyError> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // TIOCSWINSZ ioctl
    unsafe {
        let ret = libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &winsize);
        if ret < 0 {
            return Err(PtyError::Resize(Errno::last()));
        }
    }
    Ok(winsize)
}

/// Everything the child needs, converted before fork so the child
/// does not allocate.
struct PreparedExec {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: CString,
}

impl PreparedExec {
    fn new(opts: &SpawnOptions<'_>) -> Result<Self, PtyError> {
        let program =
            CString::new(opts.program.as_os_str().as_bytes()).map_err(PtyError::InvalidCommand)?;
        let mut argv = Vec::with_capacity(opts.args.len() + 1);
        argv.push(program.clone());
        for arg in opts.args {
            argv.push(CString::new(arg.as_str()).map_err(PtyError::InvalidCommand)?);
        }
        let envp = opts
            .env
            .iter()
            .map(|(key, value)| CString::new(format!("{key}={value}")))
            .collect::<Result<Vec<_>, _>>()
            .map_err(PtyError::InvalidCommand)?;
        let cwd = CString::new(opts.cwd.as_os_str().as_bytes()).map_err(PtyError::InvalidCommand)?;
        Ok(Self {
            program,
            argv,
            envp,
            cwd,
        })
    }
}

/// Spawn a program in a new PTY.
///
/// Returns once the child has successfully exec'd. A failure anywhere in
/// the child before exec (session setup, chdir, exec itself) is reported
/// back through a close-on-exec pipe and returned as an error, with the
/// child already reaped.
pub fn spawn(opts: &SpawnOptions<'_>) -> Result<PtyProcess, PtyError> {
    let prepared = PreparedExec::new(opts)?;

    let winsize = Winsize {
        ws_row: opts.rows,
        ws_col: opts.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // Open a new PTY pair
    let OpenptyResult { master, slave } = openpty(&winsize, None).map_err(PtyError::OpenPty)?;

    // Master is non-blocking for async I/O and must not leak into other shells
    let flags = fcntl(&master, FcntlArg::F_GETFL).map_err(PtyError::OpenPty)?;
    let mut flags = OFlag::from_bits_retain(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(&master, FcntlArg::F_SETFL(flags)).map_err(PtyError::OpenPty)?;
    fcntl(&master, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(PtyError::OpenPty)?;

    let (status_rx, status_tx) = pipe2(OFlag::O_CLOEXEC).map_err(PtyError::Pipe)?;

    // Fork the process
    match unsafe { fork() }.map_err(PtyError::Fork)? {
        ForkResult::Parent { child } => {
            // Parent: close slave and the write end, keep master
            drop(slave);
            drop(status_tx);

            match read_exec_status(&status_rx) {
                Ok(None) => Ok(PtyProcess {
                    master,
                    pid: child,
                    size: winsize,
                }),
                Ok(Some((stage, errno))) => {
                    let _ = wait(child);
                    Err(stage_error(stage, errno))
                }
                Err(e) => {
                    let _ = signal::kill(child, Signal::SIGKILL);
                    let _ = wait(child);
                    Err(PtyError::Pipe(e))
                }
            }
        }
        ForkResult::Child => {
            drop(master);
            drop(status_rx);
            exec_child(&slave, &prepared, &status_tx)
        }
    }
}

/// Child side of the fork: attach to the terminal and exec.
///
/// Only async-signal-safe calls happen here; everything else was
/// prepared before the fork.
fn exec_child(slave: &OwnedFd, prepared: &PreparedExec, status: &OwnedFd) -> ! {
    // Create a new session
    if setsid().is_err() {
        report_and_exit(status, STAGE_SETSID);
    }

    let slave_fd = slave.as_raw_fd();
    unsafe {
        // Set the slave as the controlling terminal
        if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) < 0 {
            report_and_exit(status, STAGE_CTTY);
        }

        // Redirect stdin/stdout/stderr to the slave using libc directly
        // (nix's dup2 API is awkward for this use case)
        if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
            || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
            || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
        {
            report_and_exit(status, STAGE_REDIRECT);
        }

        // Close the original slave fd if it's not one of 0, 1, 2
        if slave_fd > 2 {
            libc::close(slave_fd);
        }

        // The runtime ignores SIGPIPE; the shell should not inherit that
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);

        if libc::chdir(prepared.cwd.as_ptr()) < 0 {
            report_and_exit(status, STAGE_CHDIR);
        }
    }

    // execve only returns on error
    let _ = execve(&prepared.program, &prepared.argv, &prepared.envp);
    report_and_exit(status, STAGE_EXEC)
}

/// Write `[stage, errno]` to the status pipe and exit without running
/// any destructors or atexit handlers.
fn report_and_exit(status: &OwnedFd, stage: u8) -> ! {
    let errno = Errno::last_raw();
    let mut msg = [0u8; 5];
    msg[0] = stage;
    msg[1..].copy_from_slice(&errno.to_ne_bytes());
    unsafe {
        libc::write(status.as_raw_fd(), msg.as_ptr().cast(), msg.len());
        libc::_exit(127)
    }
}

/// Read the child's exec report. EOF without data means exec succeeded.
fn read_exec_status(status: &OwnedFd) -> Result<Option<(u8, i32)>, nix::Error> {
    let mut buf = [0u8; 5];
    let mut filled = 0;
    while filled < buf.len() {
        match nix::unistd::read(status, &mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(Errno::EINTR) => {}
            Err(e) => return Err(e),
        }
    }

    match filled {
        0 => Ok(None),
        5 => {
            let errno = i32::from_ne_bytes([buf[1], buf[2], buf[3], buf[4]]);
            Ok(Some((buf[0], errno)))
        }
        _ => Err(Errno::EIO),
    }
}

fn stage_error(stage: u8, errno: i32) -> PtyError {
    let errno = Errno::from_raw(errno);
    match stage {
        STAGE_SETSID => PtyError::Setsid(errno),
        STAGE_CTTY => PtyError::SetControllingTerminal(errno),
        STAGE_REDIRECT => PtyError::Redirect(errno),
        STAGE_CHDIR => PtyError::Chdir(errno),
        _ => PtyError::Exec(errno),
    }
}

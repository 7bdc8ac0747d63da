//! PTY supervisor.
//!
//! Spawns shells on fresh pseudo-terminals and owns everything that
//! touches the device or the child process afterwards: reads, writes,
//! resizes, liveness checks and termination.

use crate::pty::{self, PtyError, SpawnOptions};
use crate::session::{ChildProcess, Session, SessionId, SessionState};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Bytes read from the device per poll.
const READ_CHUNK: usize = 4096;

/// How often to check for exit while waiting on a child.
const REAP_POLL: Duration = Duration::from_millis(10);

/// Errors from supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("shell not found: {}", shell.display())]
    ShellNotFound {
        shell: PathBuf,
        #[source]
        source: which::Error,
    },

    #[error("working directory is not a directory: {}", .0.display())]
    InvalidCwd(PathBuf),

    #[error("failed to spawn shell: {0}")]
    Spawn(#[source] PtyError),

    #[error("spawn task failed: {0}")]
    SpawnTask(#[source] tokio::task::JoinError),

    #[error("failed to register terminal with the runtime: {0}")]
    Attach(#[source] io::Error),

    #[error("terminal I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("failed to resize terminal: {0}")]
    Resize(#[source] PtyError),

    #[error("terminal device is closed")]
    Closed,
}

impl SupervisorError {
    /// Whether this error happened while creating a session.
    #[must_use]
    pub const fn is_spawn(&self) -> bool {
        matches!(
            self,
            Self::ShellNotFound { .. }
                | Self::InvalidCwd(_)
                | Self::Spawn(_)
                | Self::SpawnTask(_)
                | Self::Attach(_)
        )
    }
}

/// Outcome of one bounded wait on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readable {
    /// Bytes read from the shell, in order.
    Data(Vec<u8>),
    /// Nothing arrived before the timeout.
    Idle,
    /// The shell is gone and its output is fully drained.
    EndOfStream,
}

/// Spawns and supervises shells on pseudo-terminals.
#[derive(Debug, Clone, Copy)]
pub struct Supervisor {
    cols: u16,
    rows: u16,
}

impl Supervisor {
    /// Create a supervisor that opens terminals of the given initial size.
    #[must_use]
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Spawn `shell` on a new PTY and return the session, already active.
    ///
    /// Nothing is left behind on failure: if the child was forked it has
    /// been reaped by the time this returns an error.
    pub async fn spawn(
        &self,
        id: SessionId,
        shell: &Path,
        args: &[String],
        cwd: &Path,
        env: Vec<(String, String)>,
    ) -> Result<Session, SupervisorError> {
        let program = which::which(shell).map_err(|source| SupervisorError::ShellNotFound {
            shell: shell.to_path_buf(),
            source,
        })?;

        if !cwd.is_dir() {
            return Err(SupervisorError::InvalidCwd(cwd.to_path_buf()));
        }

        // fork/exec and the exec-status read block until the child has exec'd
        let args = args.to_vec();
        let cwd = cwd.to_path_buf();
        let (rows, cols) = (self.rows, self.cols);
        let (program, args, cwd, env, spawned) = tokio::task::spawn_blocking(move || {
            let spawned = pty::spawn(&SpawnOptions {
                program: &program,
                args: &args,
                cwd: &cwd,
                env: &env,
                rows,
                cols,
            });
            (program, args, cwd, env, spawned)
        })
        .await
        .map_err(SupervisorError::SpawnTask)?;
        let process = spawned.map_err(SupervisorError::Spawn)?;

        let pid = process.pid;
        let size = (process.size.ws_col, process.size.ws_row);
        let device = match AsyncFd::new(process.master) {
            Ok(device) => device,
            Err(e) => {
                let child = ChildProcess::new(pid);
                let _ = child.signal(Signal::SIGKILL);
                let _ = child.reap(REAP_POLL).await;
                return Err(SupervisorError::Attach(e));
            }
        };

        let session = Session::new(id, program, args, cwd, env, device, pid, size);
        session.advance(SessionState::Active);

        info!(
            session_id = %session.id(),
            pid = session.pid(),
            shell = %session.shell().display(),
            cwd = %session.cwd().display(),
            "Session spawned"
        );
        Ok(session)
    }

    /// Write `bytes` verbatim to the shell. Returns the number written,
    /// which is always all of them on success.
    pub async fn write(&self, session: &Session, bytes: &[u8]) -> Result<usize, SupervisorError> {
        let device = session.device.read().await;
        let fd = device.as_ref().ok_or(SupervisorError::Closed)?;

        let mut written = 0;
        while written < bytes.len() {
            let mut guard = fd.writable().await.map_err(SupervisorError::Io)?;
            match guard.try_io(|inner| {
                nix::unistd::write(inner.get_ref(), &bytes[written..]).map_err(io::Error::from)
            }) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Err(SupervisorError::Io(e)),
                Err(_would_block) => {}
            }
        }
        Ok(written)
    }

    /// Wait up to `timeout` for output from the shell.
    pub async fn poll_readable(
        &self,
        session: &Session,
        timeout: Duration,
    ) -> Result<Readable, SupervisorError> {
        let device = session.device.read().await;
        let Some(fd) = device.as_ref() else {
            return Ok(Readable::EndOfStream);
        };

        let mut buf = [0u8; READ_CHUNK];
        let read = tokio::time::timeout(timeout, async {
            loop {
                let mut guard = fd.readable().await?;
                match guard.try_io(|inner| {
                    nix::unistd::read(inner.get_ref(), &mut buf).map_err(io::Error::from)
                }) {
                    Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                    Ok(result) => return result,
                    Err(_would_block) => {}
                }
            }
        })
        .await;

        match read {
            // Readiness can lag behind a shell that wrote and exited in the
            // same tick, so look at the device once more before giving up
            Err(_elapsed) => {
                if self.is_alive(session) {
                    Ok(Readable::Idle)
                } else {
                    read_remaining(fd, &mut buf)
                }
            }
            // Zero-length read: slave closed (BSD behaviour)
            Ok(Ok(0)) => Ok(Readable::EndOfStream),
            Ok(Ok(n)) => Ok(Readable::Data(buf[..n].to_vec())),
            // EIO: slave closed and buffer drained (Linux behaviour)
            Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => Ok(Readable::EndOfStream),
            Ok(Err(e)) => Err(SupervisorError::Io(e)),
        }
    }

    /// Stop the shell and close the device.
    ///
    /// Sends SIGHUP to the shell's process group and SIGTERM to the shell,
    /// waits up to `grace`, then escalates to SIGKILL. Always reaps the
    /// child and closes the device before marking the session closed.
    /// Calling it again is a no-op that returns the same exit code.
    pub async fn terminate(&self, session: &Session, grace: Duration) -> Option<i32> {
        if session.state() == SessionState::Closed {
            return session.exit_code();
        }

        let exit_code = match session.child.try_wait() {
            Ok(Some(code)) => Some(code),
            Ok(None) => stop(session, grace).await,
            Err(e) => {
                warn!(session_id = %session.id(), "Failed to check shell status: {e}");
                None
            }
        };

        // Close the device
        drop(session.device.write().await.take());
        if session.advance(SessionState::Closed) {
            debug!(session_id = %session.id(), ?exit_code, "Session closed");
        }
        exit_code
    }

    /// Non-blocking liveness check.
    #[must_use]
    pub fn is_alive(&self, session: &Session) -> bool {
        matches!(session.child.try_wait(), Ok(None))
    }

    /// Change the terminal geometry. A no-op on a closed device.
    pub async fn resize(
        &self,
        session: &Session,
        cols: u16,
        rows: u16,
    ) -> Result<(), SupervisorError> {
        let device = session.device.read().await;
        let Some(fd) = device.as_ref() else {
            return Ok(());
        };
        pty::set_window_size(fd.get_ref(), rows, cols).map_err(SupervisorError::Resize)?;
        session.set_size(cols, rows);
        debug!(session_id = %session.id(), cols, rows, "Terminal resized");
        Ok(())
    }
}

/// Non-blocking read that ignores readiness, for a shell that has exited.
/// Yields whatever is still buffered, then end of stream.
fn read_remaining(fd: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> Result<Readable, SupervisorError> {
    loop {
        match nix::unistd::read(fd.get_ref(), buf) {
            Ok(0) | Err(Errno::EAGAIN | Errno::EIO) => return Ok(Readable::EndOfStream),
            Ok(n) => return Ok(Readable::Data(buf[..n].to_vec())),
            Err(Errno::EINTR) => {}
            Err(e) => return Err(SupervisorError::Io(e.into())),
        }
    }
}

/// Graceful stop with escalation.
async fn stop(session: &Session, grace: Duration) -> Option<i32> {
    let child = &session.child;
    let _ = child.signal_group(Signal::SIGHUP);
    let _ = child.signal(Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(code)) => return Some(code),
            Ok(None) => {}
            Err(e) => {
                warn!(session_id = %session.id(), "Failed to wait for shell: {e}");
                return None;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(REAP_POLL.min(deadline - now)).await;
    }

    debug!(session_id = %session.id(), "Grace period expired, sending SIGKILL");
    let _ = child.signal_group(Signal::SIGKILL);
    let _ = child.signal(Signal::SIGKILL);
    match child.reap(REAP_POLL).await {
        Ok(code) => Some(code),
        Err(e) => {
            warn!(session_id = %session.id(), "Failed to reap shell: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Vec<(String, String)> {
        std::env::vars().collect()
    }

    async fn spawn_sh(script: &str) -> Session {
        Supervisor::new(80, 24)
            .spawn(
                "test-session".to_string(),
                Path::new("/bin/sh"),
                &["-c".to_string(), script.to_string()],
                &std::env::temp_dir(),
                env(),
            )
            .await
            .unwrap()
    }

    /// Read until end of stream, collecting everything.
    async fn drain(supervisor: &Supervisor, session: &Session) -> Vec<u8> {
        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match supervisor
                .poll_readable(session, Duration::from_millis(50))
                .await
                .unwrap()
            {
                Readable::Data(data) => out.extend_from_slice(&data),
                Readable::Idle => {}
                Readable::EndOfStream => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn test_spawn_is_active() {
        let supervisor = Supervisor::new(80, 24);
        let session = spawn_sh("sleep 5").await;
        assert_eq!(session.state(), SessionState::Active);
        assert!(supervisor.is_alive(&session));
        assert_eq!(session.size(), (80, 24));

        supervisor.terminate(&session, Duration::from_millis(500)).await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!supervisor.is_alive(&session));
    }

    #[tokio::test]
    async fn test_spawn_missing_shell() {
        let result = Supervisor::new(80, 24)
            .spawn(
                "missing".to_string(),
                Path::new("/nonexistent/bin/shell"),
                &[],
                &std::env::temp_dir(),
                env(),
            )
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, SupervisorError::ShellNotFound { .. }));
        assert!(err.is_spawn());
    }

    #[tokio::test]
    async fn test_spawn_exec_failure_is_reported() {
        use std::os::unix::fs::PermissionsExt;

        // Executable, so `which` accepts it, but the interpreter is missing
        let dir = tempfile::tempdir().unwrap();
        let shell = dir.path().join("broken-shell");
        std::fs::write(&shell, "#!/nonexistent/interpreter\n").unwrap();
        std::fs::set_permissions(&shell, std::fs::Permissions::from_mode(0o755)).unwrap();

        let result = Supervisor::new(80, 24)
            .spawn(
                "broken".to_string(),
                &shell,
                &[],
                &std::env::temp_dir(),
                env(),
            )
            .await;
        assert!(matches!(
            result,
            Err(SupervisorError::Spawn(PtyError::Exec(_)))
        ));
    }

    #[tokio::test]
    async fn test_spawn_invalid_cwd() {
        let result = Supervisor::new(80, 24)
            .spawn(
                "bad-cwd".to_string(),
                Path::new("/bin/sh"),
                &[],
                Path::new("/nonexistent/workspace"),
                env(),
            )
            .await;
        assert!(matches!(result, Err(SupervisorError::InvalidCwd(_))));
    }

    #[tokio::test]
    async fn test_output_then_end_of_stream() {
        let supervisor = Supervisor::new(80, 24);
        let session = spawn_sh("printf 'one\\ntwo\\n'").await;

        let out = drain(&supervisor, &session).await;
        assert_eq!(out, b"one\r\ntwo\r\n");

        supervisor.terminate(&session, Duration::from_millis(100)).await;
        assert_eq!(session.exit_code(), Some(0));
    }

    /// Wait for the shell to exit without touching the device.
    async fn wait_exited(supervisor: &Supervisor, session: &Session) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.is_alive(session) {
            assert!(Instant::now() < deadline, "shell did not exit");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_read_remaining_after_exit() {
        let supervisor = Supervisor::new(80, 24);
        let session = spawn_sh("printf 'tail'").await;
        wait_exited(&supervisor, &session).await;

        // Bypasses readiness entirely, as after a timeout
        let device = session.device.read().await;
        let fd = device.as_ref().unwrap();
        let mut buf = [0u8; READ_CHUNK];
        assert_eq!(
            read_remaining(fd, &mut buf).unwrap(),
            Readable::Data(b"tail".to_vec())
        );
        assert_eq!(read_remaining(fd, &mut buf).unwrap(), Readable::EndOfStream);
        drop(device);

        supervisor.terminate(&session, Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_output_survives_exit_before_poll() {
        let supervisor = Supervisor::new(80, 24);
        let session = spawn_sh("printf 'late bytes'").await;
        // The shell writes and is reaped before the device is ever polled
        wait_exited(&supervisor, &session).await;

        let out = drain(&supervisor, &session).await;
        assert_eq!(out, b"late bytes");

        supervisor.terminate(&session, Duration::from_millis(100)).await;
        assert_eq!(session.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_write_reaches_shell() {
        let supervisor = Supervisor::new(80, 24);
        let session = spawn_sh("read line; echo \"got:$line\"").await;

        let n = supervisor.write(&session, b"ping\n").await.unwrap();
        assert_eq!(n, 5);

        let out = String::from_utf8_lossy(&drain(&supervisor, &session).await).into_owned();
        assert!(out.contains("got:ping"), "unexpected output: {out:?}");

        supervisor.terminate(&session, Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let supervisor = Supervisor::new(80, 24);
        let session = spawn_sh("sleep 30").await;

        let first = supervisor.terminate(&session, Duration::from_millis(200)).await;
        let second = supervisor.terminate(&session, Duration::from_millis(200)).await;
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.device.read().await.is_none());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let supervisor = Supervisor::new(80, 24);
        let session = spawn_sh("trap '' HUP TERM; while :; do sleep 1; done").await;
        // Let the trap install
        tokio::time::sleep(Duration::from_millis(200)).await;

        let code = supervisor.terminate(&session, Duration::from_millis(100)).await;
        assert_eq!(code, Some(128 + Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_write_after_terminate_fails() {
        let supervisor = Supervisor::new(80, 24);
        let session = spawn_sh("sleep 30").await;
        supervisor.terminate(&session, Duration::from_millis(200)).await;

        let result = supervisor.write(&session, b"echo\n").await;
        assert!(matches!(result, Err(SupervisorError::Closed)));
        assert_eq!(
            supervisor
                .poll_readable(&session, Duration::from_millis(10))
                .await
                .unwrap(),
            Readable::EndOfStream
        );
    }

    #[tokio::test]
    async fn test_resize() {
        let supervisor = Supervisor::new(80, 24);
        let session = spawn_sh("sleep 0.3; stty size").await;

        supervisor.resize(&session, 132, 50).await.unwrap();
        assert_eq!(session.size(), (132, 50));

        let out = String::from_utf8_lossy(&drain(&supervisor, &session).await).into_owned();
        assert!(out.contains("50 132"), "unexpected output: {out:?}");

        supervisor.terminate(&session, Duration::from_millis(100)).await;
        // Closed device: resize becomes a no-op
        supervisor.resize(&session, 10, 10).await.unwrap();
    }
}

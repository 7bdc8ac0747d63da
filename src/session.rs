//! Session representation.
//!
//! A [`Session`] is one live terminal: a shell process attached to the
//! slave side of a PTY, with the master side held here. The session owns
//! both handles; relay flows only ever borrow it.

// Timestamps won't overflow u64 until year 584942417355
#![allow(clippy::cast_possible_truncation)]

use crate::pty::{self, PtyError};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::unix::AsyncFd;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

/// Opaque session identifier (e.g., "rusty-nail").
pub type SessionId = String;

/// Session lifecycle state. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Process forked, not yet confirmed running.
    Starting,
    /// Shell running, relay moving bytes.
    Active,
    /// Shell output ended or teardown has begun.
    Draining,
    /// Process reaped and device closed.
    Closed,
}

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TeardownReason {
    /// The shell exited and its output was drained.
    ProcessExit,
    /// The client disconnected.
    TransportClosed,
    /// Reading or writing the terminal failed.
    IoError,
    /// The server is shutting down.
    Shutdown,
    /// An explicit teardown request.
    Requested,
}

impl TeardownReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProcessExit => "process-exit",
            Self::TransportClosed => "transport-closed",
            Self::IoError => "io-error",
            Self::Shutdown => "shutdown",
            Self::Requested => "requested",
        }
    }
}

impl std::fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of a session for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub pid: u32,
    pub shell: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// `TERM` the shell was started with.
    pub term: Option<String>,
    pub state: SessionState,
    /// Unix timestamp when the session was created (millis).
    pub created_at: u64,
    /// Terminal size (cols, rows).
    pub size: (u16, u16),
    pub exit_code: Option<i32>,
}

/// The shell process of a session.
///
/// Caches the exit status once reaped so that later liveness checks
/// never call `waitpid` on a pid that no longer belongs to us.
#[derive(Debug)]
pub(crate) struct ChildProcess {
    pid: Pid,
    exit_code: Mutex<Option<i32>>,
}

impl ChildProcess {
    pub(crate) const fn new(pid: Pid) -> Self {
        Self {
            pid,
            exit_code: Mutex::new(None),
        }
    }

    pub(crate) const fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<i32>> {
        self.exit_code
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Non-blocking reap. Returns the exit code if the child is gone.
    pub(crate) fn try_wait(&self) -> Result<Option<i32>, PtyError> {
        let mut exit_code = self.lock();
        if exit_code.is_none() {
            *exit_code = pty::try_wait(self.pid)?;
        }
        Ok(*exit_code)
    }

    /// Poll until the child has been reaped.
    pub(crate) async fn reap(&self, interval: Duration) -> Result<i32, PtyError> {
        loop {
            if let Some(code) = self.try_wait()? {
                return Ok(code);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Signal the shell itself.
    pub(crate) fn signal(&self, sig: Signal) -> Result<(), PtyError> {
        signal::kill(self.pid, sig).map_err(PtyError::Signal)
    }

    /// Signal the shell's whole process group (it leads its own session).
    pub(crate) fn signal_group(&self, sig: Signal) -> Result<(), PtyError> {
        signal::killpg(self.pid, sig).map_err(PtyError::Signal)
    }
}

/// One live terminal.
pub struct Session {
    id: SessionId,
    shell: PathBuf,
    args: Vec<String>,
    cwd: PathBuf,
    env: Vec<(String, String)>,
    created_at: SystemTime,
    /// Master side of the PTY; `None` once closed.
    pub(crate) device: RwLock<Option<AsyncFd<OwnedFd>>>,
    pub(crate) child: ChildProcess,
    size: Mutex<(u16, u16)>,
    state: watch::Sender<SessionState>,
    teardown_reason: OnceLock<TeardownReason>,
    cancel: CancellationToken,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        shell: PathBuf,
        args: Vec<String>,
        cwd: PathBuf,
        env: Vec<(String, String)>,
        device: AsyncFd<OwnedFd>,
        pid: Pid,
        size: (u16, u16),
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            id,
            shell,
            args,
            cwd,
            env,
            created_at: SystemTime::now(),
            device: RwLock::new(Some(device)),
            child: ChildProcess::new(pid),
            size: Mutex::new(size),
            state,
            teardown_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process ID of the shell.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // PIDs are always positive
    pub fn pid(&self) -> u32 {
        self.child.pid().as_raw() as u32
    }

    #[must_use]
    pub fn shell(&self) -> &Path {
        &self.shell
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Environment the shell was started with.
    #[must_use]
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    #[must_use]
    pub const fn created_at(&self) -> SystemTime {
        self.created_at
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Terminal size as (cols, rows).
    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn set_size(&self, cols: u16, rows: u16) {
        *self.size.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = (cols, rows);
    }

    /// Exit code of the shell, if it has been reaped.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.child.exit_code()
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            pid: self.pid(),
            shell: self.shell.clone(),
            args: self.args().to_vec(),
            cwd: self.cwd.clone(),
            term: self
                .env()
                .iter()
                .find(|(key, _)| key == "TERM")
                .map(|(_, value)| value.clone()),
            state: self.state(),
            created_at: self
                .created_at()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            size: self.size(),
            exit_code: self.exit_code(),
        }
    }

    /// Move to `next` if it is later than the current state.
    /// Returns whether the state changed.
    pub(crate) fn advance(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the session reaches [`SessionState::Closed`].
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Record `reason` as the teardown reason. First caller wins;
    /// everyone else gets `false`.
    pub(crate) fn claim_teardown(&self, reason: TeardownReason) -> bool {
        self.teardown_reason.set(reason).is_ok()
    }

    /// Why the session was torn down, once teardown has started.
    #[must_use]
    pub fn teardown_reason(&self) -> Option<TeardownReason> {
        self.teardown_reason.get().copied()
    }

    /// Wake both relay flows.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once teardown has started.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid())
            .field("shell", &self.shell)
            .field("cwd", &self.cwd)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order() {
        assert!(SessionState::Starting < SessionState::Active);
        assert!(SessionState::Active < SessionState::Draining);
        assert!(SessionState::Draining < SessionState::Closed);
    }

    #[test]
    fn test_teardown_reason_names() {
        assert_eq!(TeardownReason::IoError.to_string(), "io-error");
        assert_eq!(
            serde_json::to_string(&TeardownReason::TransportClosed).unwrap(),
            "\"transport-closed\""
        );
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&SessionState::Draining).unwrap();
        assert_eq!(json, "\"draining\"");
    }
}

//! Session lifecycle.
//!
//! Turns an accepted transport into a running session and guarantees
//! that every session is torn down exactly once, whoever asks first.

use super::table::SessionTable;
use crate::config::TerminalConfig;
use crate::relay::{self, RelayEnd};
use crate::session::{Session, SessionState, TeardownReason};
use crate::supervisor::{Supervisor, SupervisorError};
use crate::transport::{Frame, FrameSink, FrameSource};
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Creates, drives and tears down sessions.
pub struct SessionManager {
    config: TerminalConfig,
    supervisor: Supervisor,
    table: Arc<SessionTable>,
}

/// A running session and the task driving it.
#[derive(Debug)]
pub struct SessionHandle {
    session: Arc<Session>,
    task: JoinHandle<TeardownReason>,
}

impl SessionHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        self.session.id()
    }

    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Wait for the session to end. `None` if the driver task was aborted.
    pub async fn finished(self) -> Option<TeardownReason> {
        self.task.await.ok()
    }
}

impl SessionManager {
    /// Create a manager that registers sessions in `table`.
    #[must_use]
    pub fn new(config: TerminalConfig, table: Arc<SessionTable>) -> Self {
        let supervisor = Supervisor::new(config.cols, config.rows);
        Self {
            config,
            supervisor,
            table,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &TerminalConfig {
        &self.config
    }

    #[must_use]
    pub const fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    #[must_use]
    pub const fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Start a session for a freshly connected client.
    ///
    /// On spawn failure the client gets one `error` frame, the transport is
    /// closed and nothing is registered.
    pub async fn accept<S, R>(
        self: &Arc<Self>,
        mut sink: S,
        source: R,
    ) -> Result<SessionHandle, SupervisorError>
    where
        S: FrameSink + 'static,
        R: FrameSource + 'static,
    {
        let id = self.table.reserve_id();
        let spawned = self
            .supervisor
            .spawn(
                id.clone(),
                &self.config.shell,
                &self.config.shell_args,
                &self.config.workspace,
                self.config.spawn_env(),
            )
            .await;

        let session = match spawned {
            Ok(session) => Arc::new(session),
            Err(e) => {
                self.table.release(&id);
                warn!(session_id = %id, "Failed to start session: {e}");
                let _ = sink
                    .send(Frame::error(format!("failed to start terminal: {e}")))
                    .await;
                let _ = sink.close().await;
                return Err(e);
            }
        };

        self.table.insert(Arc::clone(&session));

        let manager = Arc::clone(self);
        let driven = Arc::clone(&session);
        let task = tokio::spawn(async move { manager.drive(driven, sink, source).await });

        Ok(SessionHandle { session, task })
    }

    /// Run the relay until something ends it, then tear down.
    async fn drive<S, R>(
        self: Arc<Self>,
        session: Arc<Session>,
        mut sink: S,
        mut source: R,
    ) -> TeardownReason
    where
        S: FrameSink,
        R: FrameSource,
    {
        let end = tokio::select! {
            end = relay::run(
                &self.supervisor,
                &session,
                &mut sink,
                &mut source,
                self.config.poll_interval,
            ) => Some(end),
            () = session.cancelled() => None,
        };

        let reason = match end {
            Some(RelayEnd::EndOfStream) => TeardownReason::ProcessExit,
            Some(RelayEnd::TransportClosed) => TeardownReason::TransportClosed,
            Some(RelayEnd::Io(e)) => {
                warn!(session_id = %session.id(), "Terminal I/O failed: {e}");
                let _ = sink
                    .send(Frame::error(format!("terminal I/O error: {e}")))
                    .await;
                TeardownReason::IoError
            }
            // Someone else started the teardown and recorded the reason
            None => TeardownReason::Requested,
        };

        if let Err(e) = sink.close().await {
            debug!(session_id = %session.id(), "Transport close failed: {e}");
        }
        drop(source);

        self.teardown(&session, reason).await;
        session.teardown_reason().unwrap_or(reason)
    }

    /// Tear a session down: stop its flows, unregister it, stop the shell
    /// and close the device.
    ///
    /// Safe to call any number of times from anywhere. Only the first call
    /// does the work and returns `true`; every other call waits until the
    /// session is closed and returns `false`.
    pub async fn teardown(&self, session: &Session, reason: TeardownReason) -> bool {
        if !session.claim_teardown(reason) {
            session.closed().await;
            return false;
        }

        session.advance(SessionState::Draining);
        // The driver drops both flows and closes the transport
        session.cancel();
        self.table.remove(session.id());

        let exit_code = self
            .supervisor
            .terminate(session, self.config.grace_period)
            .await;
        info!(session_id = %session.id(), %reason, ?exit_code, "Session torn down");
        true
    }

    /// Tear down every registered session.
    pub async fn shutdown_all(&self) {
        let sessions = self.table.sessions();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "Tearing down all sessions");
        join_all(
            sessions
                .iter()
                .map(|session| self.teardown(session, TeardownReason::Shutdown)),
        )
        .await;
    }
}

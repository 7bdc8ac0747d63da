//! termbridge: PTY terminal sessions over WebSocket
//!
//! Every connection on `/ws/terminal` gets its own shell on a fresh
//! pseudo-terminal. Output and input are relayed as JSON frames until
//! either side goes away, and every session is torn down exactly once.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod config;
pub mod pty;
pub mod relay;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use cli::{Cli, Command, ServeArgs};
pub use config::{ConfigError, TerminalConfig};
pub use server::{Server, ServerError, SessionHandle, SessionManager, SessionTable, TERMINAL_PATH};
pub use session::{Session, SessionId, SessionInfo, SessionState, TeardownReason};
pub use supervisor::{Supervisor, SupervisorError};
pub use transport::{Frame, FrameSink, FrameSource, ProtocolError, TransportError};

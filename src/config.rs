//! Server and session configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// `TERM` exported to every shell.
pub const TERM: &str = "xterm-256color";

/// Errors in the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to create workspace {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("workspace is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
}

/// Everything needed to serve terminal sessions.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Address to listen on.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Working directory of every shell.
    pub workspace: PathBuf,
    /// Shell to spawn.
    pub shell: PathBuf,
    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,
    /// Initial terminal columns.
    pub cols: u16,
    /// Initial terminal rows.
    pub rows: u16,
    /// Upper bound on one wait for shell output.
    pub poll_interval: Duration,
    /// How long a shell gets to exit before SIGKILL.
    pub grace_period: Duration,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7777,
            workspace: default_workspace(),
            shell: default_shell(),
            shell_args: Vec::new(),
            cols: 80,
            rows: 24,
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_millis(1000),
        }
    }
}

impl TerminalConfig {
    /// `host:port` for the listener.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Environment for a new shell: ours, with `TERM` set.
    #[must_use]
    pub fn spawn_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> =
            std::env::vars().filter(|(key, _)| key != "TERM").collect();
        env.push(("TERM".to_string(), TERM.to_string()));
        env
    }

    /// Create the workspace if it is missing.
    pub fn ensure_workspace(&self) -> Result<(), ConfigError> {
        ensure_dir(&self.workspace)
    }
}

fn ensure_dir(path: &Path) -> Result<(), ConfigError> {
    if path.exists() && !path.is_dir() {
        return Err(ConfigError::NotADirectory(path.to_path_buf()));
    }
    std::fs::create_dir_all(path).map_err(|source| ConfigError::Workspace {
        path: path.to_path_buf(),
        source,
    })
}

/// Default shell: `$SHELL`, else `/bin/bash` if present, else `/bin/sh`.
#[must_use]
pub fn default_shell() -> PathBuf {
    if let Some(shell) = std::env::var_os("SHELL").filter(|s| !s.is_empty()) {
        return PathBuf::from(shell);
    }
    let bash = Path::new("/bin/bash");
    if bash.exists() {
        bash.to_path_buf()
    } else {
        PathBuf::from("/bin/sh")
    }
}

/// Default workspace: `~/Code`, falling back to the temp directory
/// when there is no home.
#[must_use]
pub fn default_workspace() -> PathBuf {
    dirs::home_dir().map_or_else(std::env::temp_dir, |home| home.join("Code"))
}

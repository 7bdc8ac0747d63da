//! Command-line interface for termbridge.

use crate::config::{default_shell, default_workspace, TerminalConfig};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Browser terminals backed by real PTYs.
#[derive(Debug, Parser)]
#[command(name = "termbridge", version, about)]
pub struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve terminal sessions over WebSocket until interrupted.
    Serve(ServeArgs),

    /// Check that sessions can be started with this configuration.
    Doctor(ServeArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "TERMBRIDGE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "TERMBRIDGE_PORT", default_value = "7777")]
    pub port: u16,

    /// Working directory of every shell (defaults to ~/Code).
    #[arg(long, env = "TERMBRIDGE_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Shell to spawn (defaults to $SHELL, then /bin/bash, then /bin/sh).
    #[arg(long, env = "TERMBRIDGE_SHELL")]
    pub shell: Option<PathBuf>,

    /// Extra argument for the shell (repeatable).
    #[arg(long = "shell-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub shell_args: Vec<String>,

    /// Initial terminal columns.
    #[arg(long, default_value = "80", value_parser = clap::value_parser!(u16).range(1..))]
    pub cols: u16,

    /// Initial terminal rows.
    #[arg(long, default_value = "24", value_parser = clap::value_parser!(u16).range(1..))]
    pub rows: u16,

    /// Upper bound on one wait for shell output, in milliseconds.
    #[arg(long, value_name = "MILLIS", default_value = "50", value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_ms: u64,

    /// How long a shell gets to exit before SIGKILL, in milliseconds.
    #[arg(long, value_name = "MILLIS", default_value = "1000")]
    pub grace_ms: u64,
}

impl ServeArgs {
    /// Resolve defaults into a full configuration.
    #[must_use]
    pub fn config(&self) -> TerminalConfig {
        TerminalConfig {
            host: self.host.clone(),
            port: self.port,
            workspace: self.workspace.clone().unwrap_or_else(default_workspace),
            shell: self.shell.clone().unwrap_or_else(default_shell),
            shell_args: self.shell_args.clone(),
            cols: self.cols,
            rows: self.rows,
            poll_interval: Duration::from_millis(self.poll_ms),
            grace_period: Duration::from_millis(self.grace_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("termbridge").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_serve_flags_reach_config() {
        let cli = parse(&[
            "serve",
            "--host",
            "0.0.0.0",
            "--port",
            "9001",
            "--shell",
            "/bin/sh",
            "--shell-arg",
            "-i",
            "--cols",
            "132",
            "--rows",
            "50",
            "--poll-ms",
            "20",
            "--grace-ms",
            "250",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.config();
        assert_eq!(config.bind_addr(), "0.0.0.0:9001");
        assert_eq!(config.shell, PathBuf::from("/bin/sh"));
        assert_eq!(config.shell_args, vec!["-i".to_string()]);
        assert_eq!((config.cols, config.rows), (132, 50));
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.grace_period, Duration::from_millis(250));
    }

    #[test]
    fn test_verbose_is_global() {
        let cli = parse(&["doctor", "--verbose"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Doctor(_)));
    }

    #[test]
    fn test_zero_geometry_rejected() {
        let result = Cli::try_parse_from(["termbridge", "serve", "--cols", "0"]);
        assert!(result.is_err());
    }
}

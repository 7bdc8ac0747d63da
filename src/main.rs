//! termbridge: PTY terminal sessions over WebSocket

use clap::Parser;
use std::time::Duration;
use termbridge::pty::{self, SpawnOptions};
use termbridge::{Cli, Command, ServeArgs, Server, Supervisor, TerminalConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging, RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("termbridge=debug")
        } else {
            EnvFilter::new("termbridge=info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Serve(args) => run_server(&args).await,
        Command::Doctor(args) => run_doctor(&args).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_server(args: &ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(args.config()).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = shutdown.send(());
        }
    });

    server.run().await?;
    Ok(())
}

async fn run_doctor(args: &ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.config();
    let mut all_ok = true;

    // 1. Shell resolution
    print!("Shell: {} ", config.shell.display());
    let resolved = match which::which(&config.shell) {
        Ok(path) => {
            println!("[OK] {}", path.display());
            Some(path)
        }
        Err(e) => {
            println!("[FAIL] {e}");
            all_ok = false;
            None
        }
    };

    // 2. Workspace
    print!("Workspace: {} ", config.workspace.display());
    match config.ensure_workspace() {
        Ok(()) => println!("[OK]"),
        Err(e) => {
            println!("[FAIL] {e}");
            all_ok = false;
        }
    }

    // 3. PTY allocation
    print!("PTY allocation: ");
    match check_pty(&config) {
        Ok(()) => println!("[OK]"),
        Err(e) => {
            println!("[FAIL] {e}");
            all_ok = false;
        }
    }

    // 4. Full session cycle, only meaningful if the shell resolved
    print!("Session start/stop: ");
    if resolved.is_some() && config.workspace.is_dir() {
        let supervisor = Supervisor::new(config.cols, config.rows);
        match supervisor
            .spawn(
                "__doctor__".to_string(),
                &config.shell,
                &config.shell_args,
                &config.workspace,
                config.spawn_env(),
            )
            .await
        {
            Ok(session) => {
                supervisor
                    .terminate(&session, Duration::from_millis(200))
                    .await;
                println!("[OK] pid {}", session.pid());
            }
            Err(e) => {
                println!("[FAIL] {e}");
                all_ok = false;
            }
        }
    } else {
        println!("[SKIP]");
    }

    // Summary
    println!();
    if all_ok {
        println!("All checks passed!");
        Ok(())
    } else {
        Err("Some checks failed".into())
    }
}

fn check_pty(config: &TerminalConfig) -> Result<(), Box<dyn std::error::Error>> {
    let program = which::which("true")?;
    let process = pty::spawn(&SpawnOptions {
        program: &program,
        args: &[],
        cwd: &std::env::temp_dir(),
        env: &config.spawn_env(),
        rows: config.rows,
        cols: config.cols,
    })?;
    process.wait()?;
    Ok(())
}

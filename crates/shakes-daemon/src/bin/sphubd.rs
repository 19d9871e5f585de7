//! Entry point for `sphubd` (§6): parses CLI flags, loads
//! configuration, opens the working directory's persisted state, and
//! runs the reactor until the control socket goes away or the process
//! is signaled.

use std::path::PathBuf;

use clap::Parser;
use shakes_core::{Config, DaemonError};
use shakes_daemon::config::CliArgs;
use shakes_daemon::daemon::Daemon;
use shakes_daemon::{queue::Queue, tth_store::TthStore};
use tracing_subscriber::EnvFilter;

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn acquire_pidfile(working_dir: &std::path::Path) -> Result<(), DaemonError> {
    let pid_path = working_dir.join("sphubd.pid");
    if let Ok(existing) = std::fs::read_to_string(&pid_path) {
        if let Ok(pid) = existing.trim().parse::<i32>() {
            // SIGNAL 0 just probes for existence, sends nothing.
            let alive = unsafe { libc::kill(pid, 0) == 0 };
            if alive {
                return Err(DaemonError::AlreadyRunning(pid));
            }
        }
    }
    std::fs::write(&pid_path, format!("{}", std::process::id()))
        .map_err(|source| DaemonError::WorkingDirectory { path: pid_path.display().to_string(), source })?;
    Ok(())
}

#[tokio::main]
async fn main() {
    setup_logging();
    let args = CliArgs::parse();

    let config = Config::load();
    let config = args.apply(config);

    let working_dir = config.paths.working_dir.clone();
    if let Err(e) = std::fs::create_dir_all(&working_dir) {
        eprintln!("cannot create working directory {:?}: {}", working_dir, e);
        std::process::exit(1);
    }

    if let Err(e) = acquire_pidfile(&working_dir) {
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }

    let tth_store = match TthStore::open(&working_dir.join("tth.log")) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot open tth store: {}", e);
            std::process::exit(1);
        }
    };
    let queue = match Queue::open(&working_dir.join("queue2.db")) {
        Ok(q) => q,
        Err(e) => {
            eprintln!("cannot open queue: {}", e);
            std::process::exit(1);
        }
    };

    let daemon = Daemon::new(config, tth_store, queue);
    let socket_path: PathBuf = working_dir.join("sphubd.sock");

    if let Err(e) = daemon.run(socket_path).await {
        eprintln!("reactor exited: {}", e);
        std::process::exit(1);
    }
}

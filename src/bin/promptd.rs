//! promptd daemon binary
//!
//! Provides commands to start, stop, and manage the prompt render daemon.

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use promptd::daemon::{lock, process, Client, Daemon, DaemonPaths, DaemonSettings};
use promptd::{config, logging, Error};
use std::env;
use std::fs;
use std::process::exit;
use std::thread;
use std::time::Duration;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let command = &args[1];

    match command.as_str() {
        "start" => start_daemon(),
        "stop" => stop_daemon(),
        "status" => check_status(),
        "restart" => restart_daemon(),
        "kill" => kill_daemon(),
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            exit(1);
        }
    }
}

fn start_daemon() -> Result<()> {
    logging::init(atty::is(atty::Stream::Stderr));

    let mut settings = DaemonSettings::load();
    settings.config = config::resolve_path(&settings.config);
    let paths = DaemonPaths::for_settings(&settings)?;

    let daemon = match Daemon::new(settings, paths) {
        Ok(daemon) => daemon,
        Err(Error::AlreadyRunning { pid }) => {
            // Racing autostarts land here; the other daemon serves them
            eprintln!("promptd is already running (PID {})", pid);
            return Ok(());
        }
        Err(e) => return Err(e).context("failed to start daemon"),
    };

    daemon.install_signal_handlers()?;
    daemon.serve().context("daemon stopped with an error")?;
    Ok(())
}

fn stop_daemon() -> Result<()> {
    let paths = DaemonPaths::for_settings(&DaemonSettings::load())?;

    let pid = match lock::read_pid(&paths.lock) {
        Ok(pid) => pid,
        Err(_) => {
            println!("Daemon is not running (no lock file).");
            if paths.socket.exists() {
                println!("Removing stale socket file.");
                fs::remove_file(&paths.socket)?;
            }
            return Ok(());
        }
    };

    if !process::is_daemon_process(pid) {
        println!("Daemon is not running (stale lock for PID {}).", pid);
        lock::cleanup_lock(&paths.lock)?;
        return Ok(());
    }

    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("failed to signal daemon (PID {})", pid))?;
    println!("Sent shutdown signal to daemon (PID {}).", pid);

    // Wait for the socket and the process to go away (up to 5 seconds)
    for _ in 0..50 {
        thread::sleep(Duration::from_millis(100));
        if !paths.socket.exists() && !process::is_process_running(pid) {
            println!("Daemon stopped.");
            return Ok(());
        }
    }

    eprintln!("Warning: Daemon may not have stopped cleanly. Try 'promptd kill'.");
    Ok(())
}

fn check_status() -> Result<()> {
    let paths = DaemonPaths::for_settings(&DaemonSettings::load())?;

    if !Client::is_running(&paths.socket) {
        println!("Daemon is not running.");
        if paths.lock.exists() {
            println!("A lock file remains at {}.", paths.lock.display());
        }
        return Ok(());
    }

    println!("Daemon is running at {}", paths.socket.display());
    if let Ok(pid) = lock::read_pid(&paths.lock) {
        println!("PID: {}", pid);
    }

    let mut client = Client::connect(&paths.socket)?;
    if let Ok(days) = client.cache_get_ttl() {
        println!("Cache TTL: {} day(s)", days);
    }
    Ok(())
}

fn restart_daemon() -> Result<()> {
    println!("Stopping daemon...");
    stop_daemon()?;

    // Brief pause to ensure cleanup
    thread::sleep(Duration::from_millis(500));

    println!("Starting daemon...");
    start_daemon()
}

fn kill_daemon() -> Result<()> {
    let paths = DaemonPaths::for_settings(&DaemonSettings::load())?;

    lock::kill_daemon(&paths.lock).context("failed to kill daemon")?;
    if paths.socket.exists() {
        fs::remove_file(&paths.socket)?;
    }
    println!("Daemon killed and state cleaned up.");
    Ok(())
}

fn print_usage() {
    println!("promptd v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: promptd <command>");
    println!();
    println!("Commands:");
    println!("  start      Run the daemon in the foreground");
    println!("  stop       Ask the running daemon to shut down");
    println!("  status     Check daemon status");
    println!("  restart    Restart the daemon");
    println!("  kill       Force-kill the daemon and remove its lock");
    println!("  -h, --help Show this help message");
    println!();
    println!("Settings are read from ~/.promptdrc and PROMPTD_* environment variables.");
}

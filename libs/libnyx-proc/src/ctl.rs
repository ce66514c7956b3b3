//! procctl - Shared process table inspection and control

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use libnyx_proc::{signal, sys, LocalSignals, ProcConfig, ProcDir, ProcessContext, SharedTable, WaitOptions};

#[derive(Parser)]
#[command(name = "procctl")]
#[command(about = "Nyx process table control")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, default_value = "/etc/nyx/proc.yaml")]
    config: PathBuf,

    /// Override the runtime directory
    #[arg(long, env = "NYX_PROC_RUNTIME_DIR")]
    runtime_dir: Option<PathBuf>,

    /// Override the namespace
    #[arg(long, env = "NYX_PROC_NAMESPACE")]
    namespace: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List live processes
    Ps,

    /// Run a command as a child of a fresh instance and reap it
    Run {
        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Remove the shared table and its lock file
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = ProcConfig::load(&cli.config)?;
    if let Some(dir) = cli.runtime_dir {
        config = config.with_runtime_dir(dir);
    }
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    config.validate()?;
    debug!("Using table {}", config.region_path().display());

    match cli.command {
        Commands::Ps => ps(&config),
        Commands::Run { command } => {
            let code = run(&config, &command)?;
            std::process::exit(code);
        }
        Commands::Clean => clean(&config),
    }
}

fn ps(config: &ProcConfig) -> Result<()> {
    if !config.region_path().exists() {
        println!("No process table at {}", config.region_path().display());
        return Ok(());
    }

    let table = SharedTable::open(config).context("Failed to open process table")?;
    let dir = ProcDir::begin(&table)?;

    println!(
        "{:>7} {:>7} {:>7} {:>7} {:>10}",
        "PID", "PPID", "PGID", "SID", "NATIVE"
    );
    let mut cursor = 0;
    while let Some((entry, next)) = dir.step(cursor) {
        if let Some(record) = dir.record(entry.pid) {
            println!(
                "{:>7} {:>7} {:>7} {:>7} {:>10}",
                entry.name, record.ppid, record.pgid, record.sid, record.native_pid
            );
        }
        cursor = next;
    }
    dir.end();
    Ok(())
}

fn run(config: &ProcConfig, command: &[String]) -> Result<i32> {
    let Some((program, args)) = command.split_first() else {
        bail!("No command given");
    };

    let signals = LocalSignals::new();
    let mut ctx = ProcessContext::bootstrap(config, Arc::new(signals.clone()))?;

    let child = Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;
    let registration = ctx.spawn_register(child.id())?;
    info!(
        "Started {} as pid {} (native pid {})",
        program, registration.pid, registration.native_pid
    );
    let watcher = signals.watch_native(child, registration.termination.clone());

    let outcome = ctx.wait_any(WaitOptions::empty())?;
    signal::join_watcher(watcher, registration.native_pid);

    let code = outcome.status.exit_code().unwrap_or(1);
    info!("pid {} exited with {}", outcome.pid, code);
    Ok(sys::exit(ctx, code))
}

fn clean(config: &ProcConfig) -> Result<()> {
    for path in [config.region_path(), config.lock_path()] {
        match std::fs::remove_file(&path) {
            Ok(()) => println!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
            }
        }
    }
    Ok(())
}

//! muxrun: a fail-fast foreground process supervisor.
//!
//! Runs the processes declared in a Muxfile or Procfile concurrently,
//! multiplexes their output into one prefixed, colored stream, and exposes a
//! control socket that `muxrun ls` and `muxrun tail` connect to. If any
//! process exits with an error, the whole stack is interrupted and muxrun
//! exits non-zero.

mod client;
mod colors;
mod config;
mod decorator;
mod env;
mod events;
mod output;
mod process;
mod runner;
mod script;
mod server;
mod supervisor;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::env::Environment;
use crate::server::Server;
use crate::supervisor::{RunError, Supervisor};

const STATUS_FAILED_PROCESS: u8 = 1;
const STATUS_BAD_ENV_FILE: u8 = 2;
const STATUS_BAD_PROCESS_FILE: u8 = 3;
const STATUS_MISSING_ARGUMENT: u8 = 4;

/// Hidden socket file in the working directory, shared by server and
/// clients.
const DEFAULT_SOCKET_PATH: &str = ".muxrun.sock";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "muxrun",
    version,
    about = "Run a Muxfile/Procfile stack in the foreground with multiplexed output"
)]
struct Cli {
    /// Enable detailed log output for debugging.
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run all processes (the default when no subcommand is given).
    Start(StartArgs),
    /// List currently running processes.
    Ls {
        /// Path of the control socket to connect to.
        #[arg(long, short = 's', default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
    },
    /// Follow the log output of one or more running processes.
    Tail {
        /// Path of the control socket to connect to.
        #[arg(long, short = 's', default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
        /// Names of the processes to follow.
        names: Vec<String>,
    },
    /// Show the run configuration of a single process.
    Show {
        /// Process name as written in the Muxfile or Procfile.
        name: Option<String>,
        /// Show all processes instead of a single one.
        #[arg(long, short = 'a')]
        all: bool,
        /// Path to the env file.
        #[arg(long, short = 'e', default_value = ".env")]
        env: PathBuf,
        /// Path to the Muxfile or Procfile.
        #[arg(long, short = 'f')]
        procfile: Option<PathBuf>,
    },
    /// Print the version and exit.
    Version,
}

#[derive(Debug, clap::Args)]
struct StartArgs {
    /// Disable colored output.
    #[arg(long)]
    no_color: bool,
    /// Path to the env file.
    #[arg(long, short = 'e', default_value = ".env")]
    env: PathBuf,
    /// Path to the Muxfile or Procfile.
    #[arg(long, short = 'f')]
    procfile: Option<PathBuf>,
    /// Path of the control socket that ls/tail clients connect to.
    #[arg(long, short = 's', default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    /// Seconds to wait between SIGINT and SIGKILL when stopping processes.
    #[arg(long, default_value_t = 5)]
    interrupt_timeout: u64,
}

impl Default for StartArgs {
    fn default() -> Self {
        StartArgs {
            no_color: false,
            env: PathBuf::from(".env"),
            procfile: None,
            socket: PathBuf::from(DEFAULT_SOCKET_PATH),
            interrupt_timeout: 5,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let status = match cli.command.unwrap_or_else(|| Commands::Start(StartArgs::default())) {
        Commands::Start(args) => run_start(args).await,
        Commands::Ls { socket } => run_ls(&socket).await,
        Commands::Tail { socket, names } => run_tail(&socket, names).await,
        Commands::Show { name, all, env, procfile } => {
            run_show(name, all, &env, procfile.as_deref(), cli.verbose)
        }
        Commands::Version => {
            println!("muxrun {}", env!("CARGO_PKG_VERSION"));
            0
        }
    };
    ExitCode::from(status)
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "muxrun=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_start(args: StartArgs) -> u8 {
    let env = match load_environment(&args.env) {
        Ok(env) => env,
        Err(err) => {
            eprintln!("{:#}", err);
            return STATUS_BAD_ENV_FILE;
        }
    };

    let specs = match config::load_processes(args.procfile.as_deref(), &env) {
        Ok(specs) => specs,
        Err(err) => {
            eprintln!("{}", err);
            return STATUS_BAD_PROCESS_FILE;
        }
    };
    if let Err(err) = process::validate_all(&specs) {
        eprintln!("invalid process configuration: {}", err);
        return STATUS_BAD_PROCESS_FILE;
    }

    let cancel = CancellationToken::new();
    if let Err(err) = forward_signals(cancel.clone()) {
        eprintln!("{:#}", err);
        return STATUS_FAILED_PROCESS;
    }

    let supervisor = Supervisor::new(args.no_color)
        .with_interrupt_timeout(std::time::Duration::from_secs(args.interrupt_timeout));
    let server = Server::new(args.socket.clone(), supervisor);
    match server.run(cancel, specs).await {
        Ok(()) => 0,
        Err(err) => {
            // a process failure was already reported through the log sink
            if err.downcast_ref::<RunError>().is_none() {
                eprintln!("{:#}", err);
            }
            STATUS_FAILED_PROCESS
        }
    }
}

async fn run_ls(socket: &Path) -> u8 {
    let mut client = match Client::connect(socket).await {
        Ok(client) => client,
        Err(err) => {
            eprintln!("{}", err);
            return STATUS_FAILED_PROCESS;
        }
    };

    let mut out = std::io::stdout();
    match client.list(&mut out).await {
        Ok(()) => {
            client.close().await;
            0
        }
        Err(err) => {
            eprintln!("{}", err);
            STATUS_FAILED_PROCESS
        }
    }
}

async fn run_tail(socket: &Path, names: Vec<String>) -> u8 {
    if names.is_empty() {
        eprintln!("tail requires at least one process name");
        return STATUS_MISSING_ARGUMENT;
    }

    let cancel = CancellationToken::new();
    if let Err(err) = forward_signals(cancel.clone()) {
        eprintln!("{:#}", err);
        return STATUS_FAILED_PROCESS;
    }

    let mut client = match Client::connect(socket).await {
        Ok(client) => client,
        Err(err) => {
            eprintln!("{}", err);
            return STATUS_FAILED_PROCESS;
        }
    };

    let mut out = std::io::stdout();
    match client.tail(&names, cancel, &mut out).await {
        Ok(()) => {
            client.close().await;
            0
        }
        Err(err) => {
            eprintln!("{}", err);
            STATUS_FAILED_PROCESS
        }
    }
}

fn run_show(
    name: Option<String>,
    all: bool,
    env_path: &Path,
    procfile: Option<&Path>,
    verbose: bool,
) -> u8 {
    let env = match load_environment(env_path) {
        Ok(env) => env,
        Err(err) => {
            eprintln!("{:#}", err);
            return STATUS_BAD_ENV_FILE;
        }
    };
    let specs = match config::load_processes(procfile, &env) {
        Ok(specs) => specs,
        Err(err) => {
            eprintln!("{}", err);
            return STATUS_BAD_PROCESS_FILE;
        }
    };

    if all {
        let width =
            specs.iter().map(|s| s.name.len()).chain(["NAME".len()]).max().unwrap_or(0);
        println!("{:<width$}  SCRIPT", "NAME");
        for spec in &specs {
            println!("{:<width$}  {}", spec.name, spec.script);
        }
        return 0;
    }

    let Some(name) = name else {
        eprintln!("show requires a process name (or --all)");
        return STATUS_MISSING_ARGUMENT;
    };
    let Some(spec) = specs.iter().find(|s| s.name == name) else {
        eprintln!("no such process {:?}; use `muxrun show --all` to list them", name);
        return STATUS_FAILED_PROCESS;
    };

    if verbose {
        match serde_json::to_string_pretty(spec) {
            Ok(text) => println!("{}", text),
            Err(err) => {
                eprintln!("failed to encode process as JSON: {}", err);
                return STATUS_FAILED_PROCESS;
            }
        }
    } else {
        println!("{}", spec.script);
    }
    0
}

/// Loads the env file on top of the system environment. A missing file at
/// the default path is fine; the system environment is used alone.
fn load_environment(path: &Path) -> Result<Environment> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            tracing::debug!(path = %path.display(), "reading env file");
            let mut env = Environment::system();
            env.parse_env_file(&content)
                .with_context(|| format!("invalid env file {}", path.display()))?;
            Ok(env)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no env file, using system environment");
            Ok(Environment::system())
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to read env file {}", path.display()))
        }
    }
}

// SIGINT, SIGTERM, and SIGHUP all cancel the root scope; the supervisor
// handles the rest.
fn forward_signals(cancel: CancellationToken) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to install signal handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("failed to install signal handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("failed to install signal handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = hangup.recv() => {}
        }
        tracing::debug!("received shutdown signal");
        cancel.cancel();
    });
    Ok(())
}

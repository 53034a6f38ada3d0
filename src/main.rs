//! Sandgate - sandbox gateway with a WebSocket API.
//!
//! Usage:
//!   sandgate serve [--port 8080] [--workspace ./workspace]   # Start the gateway
//!   sandgate exec [--timeout-secs N] -- <command> [args]    # Run one command in the workspace

use std::error::Error;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderName;
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sandgate::command::{requested_timeout, CommandSpec, ProcessKind};
use sandgate::config::{self, CommandTemplate, GatewayConfig, Interpreter};
use sandgate::runner::{KillReason, ProcessEvent, ProcessRunner, ProcessStatus};
use sandgate::sandbox::ResourceLimits;
use sandgate::state::DEFAULT_IDENTITY_HEADER;
use sandgate::{http_server, AppState, Gateway, SessionId, WorkspaceJail};

#[derive(Parser, Debug)]
#[command(name = "sandgate")]
#[command(about = "Sandbox gateway: jailed files, package installs, snippets and shells over WebSocket")]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve(ServeArgs),
    /// Run one command inside the workspace and stream its output
    Exec(ExecArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "SANDGATE_PORT", default_value_t = 8080)]
    port: u16,

    /// Address to bind
    #[arg(long, env = "SANDGATE_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Header carrying the identity authenticated by the reverse proxy
    #[arg(long, env = "SANDGATE_IDENTITY_HEADER", default_value = DEFAULT_IDENTITY_HEADER)]
    identity_header: String,

    #[command(flatten)]
    gateway: GatewayOptions,
}

#[derive(Args, Debug)]
struct ExecArgs {
    /// Wall-clock limit in seconds (0 or absent = --exec-timeout-secs)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Working directory, relative to the workspace
    #[arg(long, default_value = "")]
    cwd: String,

    #[command(flatten)]
    gateway: GatewayOptions,

    /// Command and arguments to run
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct GatewayOptions {
    /// Workspace root (created if missing)
    #[arg(long, env = "SANDGATE_WORKSPACE", default_value = "./workspace")]
    workspace: PathBuf,

    /// Concurrent processes allowed per session
    #[arg(long, env = "SANDGATE_MAX_PROCESSES_PER_SESSION", default_value_t = config::DEFAULT_MAX_PROCESSES_PER_SESSION)]
    max_processes_per_session: usize,

    /// Default and maximum snippet run time in seconds
    #[arg(long, env = "SANDGATE_EXEC_TIMEOUT_SECS", default_value_t = config::DEFAULT_EXEC_TIMEOUT_SECS)]
    exec_timeout_secs: u64,

    /// Package install time limit in seconds
    #[arg(long, env = "SANDGATE_INSTALL_TIMEOUT_SECS", default_value_t = config::DEFAULT_INSTALL_TIMEOUT_SECS)]
    install_timeout_secs: u64,

    /// Seconds between the polite signal and SIGKILL
    #[arg(long, env = "SANDGATE_GRACE_PERIOD_SECS", default_value_t = config::DEFAULT_GRACE_PERIOD_SECS)]
    grace_period_secs: u64,

    /// Idle seconds before a session expires (0 = never)
    #[arg(long, env = "SANDGATE_SESSION_TTL_SECS", default_value_t = config::DEFAULT_SESSION_TTL_SECS)]
    session_ttl_secs: u64,

    /// Shell started by openShell
    #[arg(long, env = "SANDGATE_SHELL", default_value = config::DEFAULT_SHELL)]
    shell: String,

    /// Extra shell argument (repeatable)
    #[arg(long = "shell-arg", allow_hyphen_values = true)]
    shell_args: Vec<String>,

    /// Run shells on a pseudo-terminal
    #[arg(long, env = "SANDGATE_SHELL_TTY", default_value_t = true, action = ArgAction::Set)]
    shell_tty: bool,

    /// Installer command, `{package}` is replaced by the package name
    #[arg(long, env = "SANDGATE_INSTALL_TEMPLATE", default_value = config::DEFAULT_INSTALL_TEMPLATE)]
    install_template: CommandTemplate,

    /// Requirements installer command, `{file}` is replaced by the file path
    #[arg(long, env = "SANDGATE_REQUIREMENTS_TEMPLATE", default_value = config::DEFAULT_REQUIREMENTS_TEMPLATE)]
    requirements_template: CommandTemplate,

    /// Snippet interpreter as LANG=PROGRAM[:EXT] (repeatable)
    #[arg(
        long = "interpreter",
        env = "SANDGATE_INTERPRETERS",
        value_delimiter = ',',
        value_parser = config::parse_interpreter
    )]
    interpreters: Vec<(String, Interpreter)>,

    /// Workspace directory receiving snippet files
    #[arg(long, env = "SANDGATE_SNIPPET_DIR", default_value = config::DEFAULT_SNIPPET_DIR)]
    snippet_dir: String,

    /// CPU seconds per install/exec process (0 = unlimited)
    #[arg(long, env = "SANDGATE_CPU_LIMIT_SECS", default_value_t = config::DEFAULT_CPU_LIMIT_SECS)]
    cpu_limit_secs: u64,

    /// Address space per install/exec process in MB (0 = unlimited)
    #[arg(long, env = "SANDGATE_MEMORY_LIMIT_MB", default_value_t = config::DEFAULT_MEMORY_LIMIT_MB)]
    memory_limit_mb: u64,

    /// Largest file an install/exec process may write in MB (0 = unlimited)
    #[arg(long, env = "SANDGATE_FILE_SIZE_LIMIT_MB", default_value_t = config::DEFAULT_FILE_SIZE_LIMIT_MB)]
    file_size_limit_mb: u64,
}

impl GatewayOptions {
    fn into_config(self) -> GatewayConfig {
        let interpreters = if self.interpreters.is_empty() {
            config::default_interpreters(self.memory_limit_mb)
        } else {
            self.interpreters.into_iter().collect()
        };
        let nonzero = |v: u64| (v > 0).then_some(v);
        let limits = ResourceLimits {
            cpu_secs: nonzero(self.cpu_limit_secs),
            address_space_bytes: nonzero(self.memory_limit_mb).map(|mb| mb * 1024 * 1024),
            file_size_bytes: nonzero(self.file_size_limit_mb).map(|mb| mb * 1024 * 1024),
        };
        GatewayConfig::new(self.workspace)
            .with_max_processes_per_session(self.max_processes_per_session)
            .with_exec_timeout(Duration::from_secs(self.exec_timeout_secs))
            .with_install_timeout(Duration::from_secs(self.install_timeout_secs))
            .with_grace_period(Duration::from_secs(self.grace_period_secs))
            .with_session_ttl(Duration::from_secs(self.session_ttl_secs))
            .with_shell(self.shell, self.shell_args, self.shell_tty)
            .with_install_template(self.install_template)
            .with_requirements_template(self.requirements_template)
            .with_interpreters(interpreters)
            .with_snippet_dir(self.snippet_dir)
            .with_limits(limits)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "sandgate=debug,tower_http=debug"
    } else {
        "sandgate=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match cli.command {
        Commands::Serve(args) => match serve(args).await {
            Ok(()) => 0,
            Err(e) => {
                error!("Server failed: {}", e);
                1
            }
        },
        Commands::Exec(args) => match exec(args).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
    };
    exit(code);
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn Error>> {
    let identity_header = HeaderName::from_bytes(args.identity_header.to_ascii_lowercase().as_bytes())?;
    let gateway = Arc::new(Gateway::new(args.gateway.into_config())?);
    let state = AppState::new(gateway.clone(), identity_header);

    let addr = SocketAddr::new(args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    http_server::serve(listener, state, shutdown_signal()).await?;

    gateway.shutdown().await;
    info!("Stopped");
    Ok(())
}

/// One-off run of a command as an `exec` process. Exit code follows the
/// child; 124 on timeout, 130 when interrupted.
async fn exec(args: ExecArgs) -> Result<i32, Box<dyn Error>> {
    let config = args.gateway.into_config();
    let jail = Arc::new(WorkspaceJail::open(&config.workspace_root)?);
    let runner = ProcessRunner::new(jail, 1, config.grace_period);

    let mut argv = args.command.into_iter();
    let program = argv.next().ok_or("no command specified")?;
    let timeout = requested_timeout(args.timeout_secs).unwrap_or(config.exec_timeout);
    let spec = CommandSpec::new(ProcessKind::Exec, program)
        .args(argv)
        .working_dir(args.cwd)
        .timeout(Some(timeout))
        .limits(config.limits);

    let process = runner.spawn(SessionId::new(), spec).await?;
    let handle = process.handle;
    let mut output = process.output;
    let mut stdout = tokio::io::stdout();

    let status = loop {
        tokio::select! {
            event = output.next() => match event {
                Some(ProcessEvent::Output(chunk)) => {
                    stdout.write_all(&chunk).await?;
                    stdout.flush().await?;
                }
                Some(ProcessEvent::Exited(status)) => break status,
                None => break handle.wait().await,
            },
            _ = tokio::signal::ctrl_c() => handle.cancel(KillReason::Cancelled),
        }
    };

    Ok(match status {
        ProcessStatus::Exited { code } => code,
        ProcessStatus::TimedOut => 124,
        ProcessStatus::Killed { .. } => 130,
        ProcessStatus::Running => 1,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

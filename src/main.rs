//! Pool Membership
//!
//! Runs the pool service (`serve`) or drives a running one from the command
//! line (`create`, `connect`, `evict`, `destroy`, ...). Every failure exits
//! with a code that identifies its kind; zero means success.

use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pool_membership::controlplane::api::{ConnectBody, CreatePoolBody, EvictBody};
use pool_membership::{
    retry_with_backoff, ApiServer, ApiServerConfig, Error, NotifierConfig, PoolClient,
    PoolService, Result, RetryPolicy, ServiceConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Pool Membership - storage pool connection and eviction service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    /// Pool service endpoint for client commands
    #[arg(long, global = true, env = "POOL_ENDPOINT", default_value = "http://127.0.0.1:8090")]
    endpoint: String,

    /// Client request timeout in seconds
    #[arg(long, global = true, env = "POOL_TIMEOUT", default_value = "30")]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pool service
    Serve(ServeArgs),
    /// Create a pool and print its UUID
    Create(CreateArgs),
    /// Connect to a pool and print the handle
    Connect(ConnectArgs),
    /// Evict handles from a pool
    Evict(EvictArgs),
    /// Destroy a pool
    Destroy(DestroyArgs),
    /// Show one pool
    Query(PoolArgs),
    /// List the pools of a server group
    List(GroupArgs),
    /// Drop a handle
    Disconnect(DisconnectArgs),
}

#[derive(ClapArgs, Debug)]
struct ServeArgs {
    /// YAML configuration file
    #[arg(long, env = "POOL_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR")]
    api_addr: Option<String>,

    /// Reachable server group (repeatable)
    #[arg(long = "server-group", env = "SERVER_GROUPS", value_delimiter = ',')]
    server_groups: Vec<String>,

    /// POST revocations to this URL
    #[arg(long, env = "NOTIFY_WEBHOOK")]
    notify_webhook: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct GroupArgs {
    /// Server group, defaults to the service's first group
    #[arg(long, short = 'g')]
    group: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct PoolArgs {
    uuid: String,
    #[command(flatten)]
    group: GroupArgs,
}

#[derive(ClapArgs, Debug)]
struct CreateArgs {
    #[arg(long)]
    uid: u32,
    #[arg(long)]
    gid: u32,
    /// Octal mode, e.g. 0731
    #[arg(long, short = 'm')]
    mode: String,
    /// Size, e.g. 1gb
    #[arg(long, short = 's')]
    size: String,
    #[command(flatten)]
    group: GroupArgs,
    /// Pass-through level
    #[arg(long, short = 'l', default_value = "0")]
    level: u32,
}

#[derive(ClapArgs, Debug)]
struct ConnectArgs {
    uuid: String,
    #[command(flatten)]
    group: GroupArgs,
    #[arg(long)]
    uid: u32,
    #[arg(long)]
    gid: u32,
    /// ro, rw or ex
    #[arg(long, short = 'p', default_value = "ro")]
    permission: String,
    #[arg(long)]
    session: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct EvictArgs {
    uuid: String,
    #[command(flatten)]
    group: GroupArgs,
    /// Evict only this handle
    #[arg(long, conflicts_with_all = ["uid", "gid"])]
    handle: Option<String>,
    /// Evict every handle of this uid
    #[arg(long, requires = "gid")]
    uid: Option<u32>,
    #[arg(long, requires = "uid")]
    gid: Option<u32>,
    /// Pass-through level
    #[arg(long, short = 'l', default_value = "0")]
    level: u32,
}

#[derive(ClapArgs, Debug)]
struct DestroyArgs {
    uuid: String,
    #[command(flatten)]
    group: GroupArgs,
    /// Evict connected handles first
    #[arg(long, short = 'f')]
    force: bool,
}

#[derive(ClapArgs, Debug)]
struct DisconnectArgs {
    handle: String,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("error: {}", e);
        return ExitCode::from(e.exit_code() as u8);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.kind(), "{}", e);
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let client = || PoolClient::new(args.endpoint.as_str(), Duration::from_secs(args.timeout_secs));

    match args.command {
        Command::Serve(serve_args) => serve(serve_args).await,
        Command::Create(a) => {
            let created = client()?
                .create_pool(&CreatePoolBody {
                    uid: a.uid,
                    gid: a.gid,
                    mode: a.mode,
                    size: a.size,
                    group: a.group.group,
                    level: a.level,
                })
                .await?;
            println!("{}", created.uuid);
            Ok(())
        }
        Command::Connect(a) => {
            let handle = client()?
                .connect(
                    &a.uuid,
                    &ConnectBody {
                        group: a.group.group,
                        uid: a.uid,
                        gid: a.gid,
                        permission: a.permission,
                        session: a.session,
                    },
                )
                .await?;
            print_json(&handle)
        }
        Command::Evict(a) => {
            let report = client()?
                .evict(
                    &a.uuid,
                    &EvictBody {
                        group: a.group.group,
                        handle: a.handle,
                        uid: a.uid,
                        gid: a.gid,
                        level: a.level,
                    },
                )
                .await?;
            print_json(&report)
        }
        Command::Destroy(a) => {
            client()?
                .destroy(&a.uuid, a.group.group.as_deref(), a.force)
                .await
        }
        Command::Query(a) => print_json(&client()?.query(&a.uuid, a.group.group.as_deref()).await?),
        Command::List(a) => print_json(&client()?.list(a.group.as_deref()).await?),
        Command::Disconnect(a) => {
            let removed = client()?.disconnect(&a.handle).await?;
            println!("{}", if removed { "disconnected" } else { "not connected" });
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Internal(format!("cannot render output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

// =============================================================================
// Serve
// =============================================================================

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(addr) = args.api_addr {
        config.api_addr = addr;
    }
    if !args.server_groups.is_empty() {
        config.server_groups = args.server_groups;
    }
    if let Some(url) = args.notify_webhook {
        config.notifier = NotifierConfig::Webhook { url };
    }
    config.validate()?;

    info!("Starting Pool Membership service");
    info!("  Version: {}", pool_membership::VERSION);
    info!("  REST API: {}", config.api_addr);
    info!("  Server groups: {}", config.server_groups.join(", "));
    info!("  Notifier: {:?}", config.notifier);

    let rest_addr = config.api_socket_addr()?;
    let service = PoolService::from_config(config)?;

    let svc = &*service;
    retry_with_backoff(&RetryPolicy::default(), move || svc.probe_groups()).await?;
    info!("Server groups reachable");

    let server = Arc::new(ApiServer::new(ApiServerConfig::new(rest_addr), service.clone()));
    let mut running = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = &mut running => {
            return result.map_err(|e| Error::Internal(format!("API server task failed: {}", e)))?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
            server.shutdown();
        }
    }

    running
        .await
        .map_err(|e| Error::Internal(format!("API server task failed: {}", e)))??;

    info!("Service shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let directive = |d: &str| -> Result<tracing_subscriber::filter::Directive> {
        d.parse()
            .map_err(|e| Error::Configuration(format!("bad log directive {:?}: {}", d, e)))
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("tower_http=info")?)
        .add_directive(directive("reqwest=warn")?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

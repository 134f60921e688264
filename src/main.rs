use anyhow::Result;
use clap::{Parser, Subcommand};
use hived::{config::HiveConfig, error::HiveError, AppContext};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "hived",
    about = "Hive Host — always-on orchestrator daemon for containerized agent swarms",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Root directory for all persisted state
    #[arg(long, env = "DATA_ROOT")]
    data_root: Option<std::path::PathBuf>,

    /// Gateway listen address, e.g. 127.0.0.1:7300
    #[arg(long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Container backend: docker or none
    #[arg(long, env = "CONTAINER_BACKEND")]
    backend: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HIVED_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "HIVED_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand given).
    ///
    /// Runs hived in the foreground: loads the swarm registry, recovers the
    /// inflight spool, starts the gateway, and serves until SIGINT/SIGTERM.
    ///
    /// Examples:
    ///   hived serve
    ///   hived
    Serve,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Init once — must happen before any tracing calls.
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    let result = match args.command {
        None | Some(Command::Serve) => {
            run_server(args.data_root, args.listen, args.log, args.backend).await
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        // Stable exit codes per error kind; 1 for anything unclassified.
        let code = e
            .downcast_ref::<HiveError>()
            .map(HiveError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run_server(
    data_root: Option<std::path::PathBuf>,
    listen: Option<String>,
    log: Option<String>,
    backend: Option<String>,
) -> Result<()> {
    let config = HiveConfig::new(data_root, listen, log, backend);
    info!(
        data_root = %config.data_root.display(),
        listen = %config.listen_addr,
        backend = %config.container_backend,
        "hived starting"
    );
    if config.provider_api_key.is_none() {
        warn!("PROVIDER_API_KEY is not set — agents cannot be started until it is");
    }

    let ctx = AppContext::bootstrap(config).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    ctx.start_background(shutdown_rx.clone()).await;

    // Fan the OS signal into every long-running task.
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = signal_tx.send(true);
    });

    hived::gateway::serve(ctx.clone(), shutdown_rx).await?;

    ctx.shutdown().await;
    info!("hived stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Install the global tracing subscriber: compact stdout always, plus a
/// daily-rolling file when `log_file` is given. The returned guard keeps
/// the file writer's background thread alive and must outlive the process
/// body. An unusable log path degrades to stdout-only rather than aborting
/// startup.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let stdout_only = || {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    };

    let Some(path) = log_file else {
        return stdout_only();
    };

    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    // tracing-appender opens the file lazily; the directory must exist first.
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("warn: log directory '{}' unusable ({e}); logging to stdout only", dir.display());
        return stdout_only();
    }
    let filename = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("hived.log"));

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, filename));
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_subscriber::fmt::layer().with_writer(file_writer))
        .init();
    Some(guard)
}

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use worker::{
    engine::event_channel, server, ApiRouter, CliEngine, InstanceWatcher, LogHandler,
    RouterOptions, RouterParts, SysinfoProbe, TokenService, WorkerConfig,
};

/// HandBrake worker process: runs scan and encode jobs for a local UI over a loopback HTTP API
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Pre-shared pairing token. When omitted the first /pair call wins.
    #[arg(long)]
    token: Option<String>,

    /// Process id of the launching UI, checked by the instance watcher
    #[arg(long)]
    pid: Option<u32>,

    /// Process name of the launching UI
    #[arg(long)]
    ui_process_name: Option<String>,

    /// Path to the HandBrakeCLI binary
    #[arg(long)]
    engine_bin: Option<PathBuf>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG still wins over the default level
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = WorkerConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(name) = args.ui_process_name {
        cfg.ui_process_name = name;
    }
    if let Some(bin) = args.engine_bin {
        cfg.engine_bin = bin;
    }
    let addr = cfg.socket_addr()?;

    info!("HandBrake Worker {} starting", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded:");
    info!("  Listen address: {}", addr);
    info!("  Engine binary: {}", cfg.engine_bin.display());
    info!("  UI process: {} (pid {:?})", cfg.ui_process_name, args.pid);
    info!("  Watch interval: {}ms", cfg.watch_interval_ms);

    let (events, stream) = event_channel();
    let engine = Arc::new(CliEngine::new(cfg.engine_bin.clone(), events));

    let tokens = Arc::new(TokenService::new());
    match args.token.as_deref() {
        Some(token) if tokens.register_token(token) => info!("Pairing token set from command line"),
        _ => warn!("Token not initialised, waiting for the UI to pair"),
    }

    let watcher = InstanceWatcher::new(
        Arc::new(SysinfoProbe::new()),
        cfg.ui_process_name.clone(),
        args.pid,
    );

    let api = ApiRouter::new(RouterParts {
        engine,
        events: stream,
        tokens,
        log: Arc::new(LogHandler::new()),
        watcher,
        options: RouterOptions {
            watch_interval: cfg.watch_interval(),
            preview_timeout: cfg.preview_timeout(),
            process_id: std::process::id(),
        },
    });

    let served = server::serve(api.clone(), addr).await;

    api.stop_encode().await;
    api.log_handler().shutdown_file_writer();
    served?;

    info!("HandBrake Worker exited");
    Ok(())
}

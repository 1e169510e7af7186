//! Server binary for docbridge.
//!
//! A thin shim over the library crate: maps CLI flags (each backed by an
//! environment variable) onto `GatewayConfig`, starts the engine supervisor,
//! the conversion gate and the HTTP listener, and tears them down in reverse
//! order on Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use docbridge::server::shutdown_signal;
use docbridge::{
    build_router, AppContext, ConversionGate, Converter, EngineCommand, EngineEndpoint,
    GatewayConfig, OutputFormat, SocketBridge, StaticEndpoint, Supervisor,
};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = "\
Examples:
  docbridge
  docbridge --bind 127.0.0.1:9000 --max-concurrency 1
  SOFFICE_PATH=/opt/libreoffice/program/soffice docbridge --verbose

  curl -X POST --data-binary @report.docx \\
       -H 'Content-Type: application/vnd.openxmlformats-officedocument.wordprocessingml.document' \\
       'http://localhost:8080/?pages=1-3' -o report.pdf";

#[derive(Parser, Debug)]
#[command(
    name = "docbridge",
    version,
    about = "HTTP gateway rendering office documents through a supervised headless engine",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// HTTP listen address.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Chunk size in bytes for streaming reads.
    #[arg(long, env = "MAX_CHUNK", default_value_t = 16 * 1024)]
    max_chunk: usize,

    /// Bytes kept in memory before a buffer spills to disk.
    #[arg(long, env = "MAX_MEMORY", default_value_t = 10 * 1024 * 1024)]
    max_memory: usize,

    /// Directory for spilled buffers and file-backed outputs.
    #[arg(long, env = "TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Concurrent engine sessions. Values above 1 are unsafe for some documents.
    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = 1)]
    max_concurrency: usize,

    /// Requests allowed to wait for a session; 0 means unbounded.
    #[arg(long, env = "MAX_QUEUE", default_value_t = 0)]
    max_queue: usize,

    /// Office engine executable.
    #[arg(long = "soffice", env = "SOFFICE_PATH", default_value = "/usr/bin/soffice")]
    soffice: PathBuf,

    /// Bridge address the engine listens on.
    ///
    /// The built-in client speaks length-prefixed JSON frames, not `urp`;
    /// a bridge adapter has to listen on this address in front of the engine.
    #[arg(
        long,
        env = "BRIDGE_ADDRESS",
        default_value = docbridge::config::DEFAULT_BRIDGE_ADDRESS
    )]
    bridge_address: String,

    /// Delay before relaunching an exited engine, in milliseconds.
    #[arg(long, env = "RESTART_BACKOFF_MS", default_value_t = 1000)]
    restart_backoff_ms: u64,

    /// Connection attempts per session.
    #[arg(long, env = "CONNECT_ATTEMPTS", default_value_t = 3)]
    connect_attempts: u32,

    /// Delay between connection attempts, in milliseconds.
    #[arg(long, env = "CONNECT_DELAY_MS", default_value_t = 500)]
    connect_delay_ms: u64,

    /// Output format when the request does not ask for one.
    #[arg(long, env = "RENDER_FORMAT", default_value = "pdf")]
    render_format: OutputFormat,

    /// Timeout for fetching url= inputs, in seconds.
    #[arg(long, env = "FETCH_TIMEOUT", default_value_t = 120)]
    fetch_timeout: u64,

    /// Do not launch the engine; it is managed elsewhere.
    #[arg(long)]
    no_supervisor: bool,

    /// Debug logging (overridden by RUST_LOG).
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Configuration ────────────────────────────────────────────────────
    let mut builder = GatewayConfig::builder()
        .chunk_size(cli.max_chunk)
        .memory_threshold(cli.max_memory)
        .concurrency(cli.max_concurrency)
        .max_queue(cli.max_queue)
        .engine_program(&cli.soffice)
        .bridge_address(cli.bridge_address.clone())
        .restart_backoff_ms(cli.restart_backoff_ms)
        .connect_attempts(cli.connect_attempts)
        .connect_delay_ms(cli.connect_delay_ms)
        .render_format(cli.render_format)
        .fetch_timeout_secs(cli.fetch_timeout);
    if let Some(dir) = &cli.temp_dir {
        builder = builder.temp_dir(dir).profile_dir(dir.join("soffice"));
    }
    let config = builder.build().context("Invalid configuration")?;

    // ── Engine ───────────────────────────────────────────────────────────
    let supervisor = if cli.no_supervisor {
        info!("Engine supervision disabled, expecting it on {}", config.bridge_address);
        None
    } else {
        let command = EngineCommand::soffice(
            &config.engine_program,
            &config.profile_dir,
            &config.bridge_address,
        )
        .context("Invalid engine command")?;
        Some(Supervisor::start(
            command,
            config.bridge_address.clone(),
            config.restart_backoff(),
        ))
    };
    let endpoint: Arc<dyn EngineEndpoint> = match &supervisor {
        Some(supervisor) => supervisor.clone(),
        None => Arc::new(StaticEndpoint::new(config.bridge_address.clone())),
    };

    // ── Gate ─────────────────────────────────────────────────────────────
    let converter = Converter::new(Arc::new(SocketBridge::new()), endpoint, &config);
    let gate = ConversionGate::new(config.concurrency, config.max_queue, Arc::new(converter))
        .context("Failed to start conversion workers")?;

    // ── Serve ────────────────────────────────────────────────────────────
    let ctx = AppContext::new(config, gate, supervisor);
    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("Cannot bind {}", cli.bind))?;
    info!("Listening on http://{}", cli.bind);

    axum::serve(listener, build_router(ctx.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    // ── Teardown ─────────────────────────────────────────────────────────
    info!("Shutting down");
    ctx.shutdown().await;
    Ok(())
}

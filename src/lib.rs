//! # docbridge
//!
//! HTTP gateway that renders office documents to PDF (or PNG, JPEG, SVG)
//! through a supervised headless office engine.
//!
//! ## Why this crate?
//!
//! The office engine renders almost any document format faithfully, but it is
//! a single stateful process with a blocking bridge protocol. It crashes now
//! and then and cannot safely render two documents at once. This crate wraps
//! it in a service that stays responsive to many clients: the engine is
//! relaunched whenever it exits, sessions are funnelled through a fixed-size
//! worker pool, and large payloads spill to disk instead of memory.
//!
//! ## Request Flow
//!
//! ```text
//! HTTP POST /
//!  │
//!  ├─ 1. Params   validate pages / format / size (400 before any engine work)
//!  ├─ 2. Capture  stream body (or fetch url=) into a TieredBuffer
//!  ├─ 3. Gate     wait for one of N session workers (FIFO, default N = 1)
//!  ├─ 4. Session  connect (3 tries) → load → pick export filter → store
//!  └─ 5. Respond  bytes from memory, or stream a temp file and unlink it
//! ```
//!
//! Meanwhile the [`Supervisor`] keeps one engine process alive on a fixed
//! bridge address, restarting it one backoff interval after every exit.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docbridge::{
//!     build_router, AppContext, ConversionGate, Converter, EngineCommand, GatewayConfig,
//!     SocketBridge, Supervisor,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::default();
//!     let command = EngineCommand::soffice(
//!         &config.engine_program,
//!         &config.profile_dir,
//!         &config.bridge_address,
//!     )?;
//!     let supervisor = Supervisor::start(
//!         command,
//!         config.bridge_address.clone(),
//!         config.restart_backoff(),
//!     );
//!     let converter = Converter::new(Arc::new(SocketBridge::new()), supervisor.clone(), &config);
//!     let gate = ConversionGate::new(config.concurrency, config.max_queue, Arc::new(converter))?;
//!
//!     let ctx = AppContext::new(config, gate, Some(supervisor));
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, build_router(ctx)).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docbridge` binary (clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod bridge;
pub mod buffer;
pub mod config;
pub mod convert;
pub mod error;
pub mod gate;
pub mod output;
pub mod pipeline;
pub mod request;
pub mod server;
pub mod supervisor;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use bridge::socket::SocketBridge;
pub use bridge::{BridgeAddress, EngineConnection, EngineConnector, EngineDocument};
pub use buffer::TieredBuffer;
pub use config::{GatewayConfig, GatewayConfigBuilder, PageRange};
pub use convert::{health_check, Converter};
pub use error::{BridgeError, GatewayError};
pub use gate::{ConversionGate, SessionExecutor};
pub use output::{OutputSink, RenderedOutput};
pub use request::{ConversionRequest, OutputFormat, RequestInput};
pub use server::{build_router, AppContext};
pub use supervisor::{EngineCommand, EngineEndpoint, StaticEndpoint, Supervisor};

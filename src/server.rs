//! HTTP boundary.
//!
//! | Route | Behaviour |
//! |---|---|
//! | `POST /` | convert the body (or the `url=` reference); returns the rendered bytes |
//! | `GET /health` | round-trip a plain-text document; `204` on success, `503` otherwise |
//!
//! `POST /` query parameters: `pages=<start>-<end>`, `format=<pdf|png|jpg|svg>`,
//! `size=<bytes>` (expected output size) and `url=<reference>`. All of them are
//! validated before the body is read or the engine is touched.
//!
//! Handlers share one process-scoped [`AppContext`]; there is no global state.

use crate::config::{GatewayConfig, PageRange};
use crate::convert::health_check;
use crate::error::GatewayError;
use crate::gate::ConversionGate;
use crate::output::{OutputSink, RenderedOutput};
use crate::pipeline::input::{self, CaptureSettings, CapturedInput};
use crate::request::{ConversionRequest, OutputFormat, RequestInput};
use crate::supervisor::Supervisor;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

/// Process-scoped state: created at startup, torn down at shutdown.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<GatewayConfig>,
    pub gate: Arc<ConversionGate>,
    pub supervisor: Option<Arc<Supervisor>>,
}

impl AppContext {
    pub fn new(
        config: GatewayConfig,
        gate: ConversionGate,
        supervisor: Option<Arc<Supervisor>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            gate: Arc::new(gate),
            supervisor,
        }
    }

    /// Drain the gate, then stop the engine.
    pub async fn shutdown(&self) {
        self.gate.shutdown().await;
        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown().await;
        }
    }

    fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            threshold: self.config.memory_threshold,
            temp_dir: self.config.temp_dir.clone(),
            fetch_timeout: Duration::from_secs(self.config.fetch_timeout_secs),
        }
    }
}

pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", post(convert_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::disable())
        .with_state(ctx)
}

/// Query parameters of `POST /`, kept as strings so parse errors produce
/// our own messages.
#[derive(Debug, Default, Deserialize)]
pub struct ConvertQuery {
    pub pages: Option<String>,
    pub format: Option<String>,
    pub size: Option<String>,
    pub url: Option<String>,
}

/// Validated parameters.
#[derive(Debug, PartialEq)]
struct ConvertParams {
    pages: Option<PageRange>,
    format: OutputFormat,
    size: Option<u64>,
}

impl ConvertQuery {
    fn validate(&self, default_format: OutputFormat) -> Result<ConvertParams, GatewayError> {
        let pages = self
            .pages
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(str::parse::<PageRange>)
            .transpose()?;
        let format = self
            .format
            .as_deref()
            .filter(|f| !f.is_empty())
            .map(str::parse::<OutputFormat>)
            .transpose()?
            .unwrap_or(default_format);
        let size = self
            .size
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.trim()
                    .parse::<u64>()
                    .map_err(|_| GatewayError::BadRequest("Invalid param size".into()))
            })
            .transpose()?;
        Ok(ConvertParams {
            pages,
            format,
            size,
        })
    }
}

async fn convert_handler(
    State(ctx): State<AppContext>,
    Query(query): Query<ConvertQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    match convert_request(&ctx, &query, &headers, body).await {
        Ok(output) => respond(output, ctx.config.chunk_size).await,
        Err(err) => error_response(err),
    }
}

async fn convert_request(
    ctx: &AppContext,
    query: &ConvertQuery,
    headers: &HeaderMap,
    body: Body,
) -> Result<RenderedOutput, GatewayError> {
    let params = query.validate(ctx.config.render_format)?;
    let declared = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    debug!("Body content type: {:?}", declared);

    let settings = ctx.capture_settings();
    let captured = match query.url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => {
            let forwarded = input::forwarded_headers(
                headers
                    .iter()
                    .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?))),
            );
            input::capture_reference(url, &forwarded, &settings).await?
        }
        None => CapturedInput {
            input: RequestInput::Buffer(
                input::capture_stream(body.into_data_stream(), &settings).await?,
            ),
            content_type: None,
        },
    };
    if let RequestInput::Buffer(buffer) = &captured.input {
        info!("Body read: {} bytes", buffer.len());
    }

    let mut request = ConversionRequest::new(captured.input).format(params.format);
    if let Some(content_type) = captured.content_type.or(declared) {
        request = request.content_type(content_type);
    }
    if let Some(pages) = params.pages {
        request = request.pages(pages);
    }
    if let Some(size) = params.size {
        request = request.expected_output_size(size);
    }

    ctx.gate.submit(request).await
}

/// Send the rendered output. File-backed outputs are streamed and unlinked
/// once the body is dropped.
async fn respond(output: RenderedOutput, chunk_size: usize) -> Response {
    let media_type = output.media_type();
    match output.sink {
        OutputSink::InMemory(bytes) => ([(CONTENT_TYPE, media_type)], bytes).into_response(),
        OutputSink::FileBacked(path) => {
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) => return error_response(GatewayError::Storage(e)),
            };
            let len = match file.metadata().await {
                Ok(meta) => meta.len(),
                Err(e) => return error_response(GatewayError::Storage(e)),
            };
            // The closure owns `path`, so the file lives exactly as long as the body.
            let stream = ReaderStream::with_capacity(file, chunk_size).map(move |chunk| {
                let _keep = &path;
                chunk
            });
            (
                [
                    (CONTENT_TYPE, media_type.to_string()),
                    (CONTENT_LENGTH, len.to_string()),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
    }
}

/// Log the detail, return only the coarse status and a short message.
fn error_response(err: GatewayError) -> Response {
    let status = err.status();
    if status.is_server_error() {
        error!("Request failed: {err}");
    } else {
        warn!("Request rejected: {err}");
    }
    let message = match &err {
        GatewayError::BadRequest(message) => message.clone(),
        _ => err.public_message().to_string(),
    };
    (status, message).into_response()
}

async fn health_handler(State(ctx): State<AppContext>) -> Response {
    match health_check(&ctx.gate).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            warn!("Health check failed: {err}");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}

//! Error types for the docbridge gateway.
//!
//! Two distinct error types reflect two distinct layers:
//!
//! * [`GatewayError`] — what a caller of the gateway sees. Every failure of a
//!   conversion, a buffer, or the HTTP boundary ends up here and is mapped to
//!   one of three coarse HTTP classes by [`GatewayError::status`].
//!
//! * [`BridgeError`] — what the engine seam reports. Only
//!   [`BridgeError::Connect`] is retried by a session; every other variant is
//!   terminal for the request and becomes [`GatewayError::ConversionFailure`].

use axum::http::StatusCode;
use thiserror::Error;

/// All errors surfaced by the gateway library.
#[derive(Debug, Error)]
pub enum GatewayError {
    // ── Client errors ─────────────────────────────────────────────────────
    /// Malformed parameters (page range, output format, URL reference).
    #[error("Bad request: {0}")]
    BadRequest(String),

    // ── Engine errors ─────────────────────────────────────────────────────
    /// The engine could not be reached after every connection attempt.
    #[error("Engine at '{address}' unreachable after {attempts} attempts")]
    UpstreamUnavailable { address: String, attempts: u32 },

    /// The engine accepted the session but loading or rendering failed.
    #[error("Conversion failed: {0}")]
    ConversionFailure(String),

    // ── Admission errors ──────────────────────────────────────────────────
    /// The gate's optional queue limit was reached.
    #[error("Conversion queue is full ({depth} requests waiting)")]
    QueueFull { depth: usize },

    /// The gate was closed while the request was waiting for admission.
    #[error("Gateway is shutting down")]
    ShuttingDown,

    // ── Storage errors ────────────────────────────────────────────────────
    /// Tiered buffer or temporary file I/O failed.
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// An operation was attempted on a closed or abandoned buffer.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The coarse HTTP status a client sees for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) | GatewayError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::UpstreamUnavailable { .. }
            | GatewayError::QueueFull { .. }
            | GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ConversionFailure(_)
            | GatewayError::Storage(_)
            | GatewayError::InvalidState(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short client-facing text. Never carries engine or I/O detail.
    pub fn public_message(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST => "Bad Request",
            StatusCode::SERVICE_UNAVAILABLE => "Service Busy, Try Again Later",
            _ => "Internal Server Error",
        }
    }
}

/// Errors reported by an engine bridge implementation.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Opening a session against the bridge address failed.
    #[error("cannot connect to engine: {0}")]
    Connect(String),

    /// The connection broke after it was established.
    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine rejected a call (corrupt input, unsupported filter, …).
    #[error("engine error: {0}")]
    Remote(String),

    /// The peer sent something the client cannot interpret.
    #[error("bridge protocol error: {0}")]
    Protocol(String),
}

impl From<BridgeError> for GatewayError {
    fn from(err: BridgeError) -> Self {
        GatewayError::ConversionFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_unavailable_display() {
        let e = GatewayError::UpstreamUnavailable {
            address: "socket,host=localhost,port=2002".into(),
            attempts: 3,
        };
        let msg = e.to_string();
        assert!(msg.contains("3 attempts"), "got: {msg}");
        assert!(msg.contains("port=2002"), "got: {msg}");
    }

    #[test]
    fn status_classes() {
        assert_eq!(
            GatewayError::BadRequest("pages".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::QueueFull { depth: 4 }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::ConversionFailure("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::InvalidState("closed").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn public_message_hides_detail() {
        let e = GatewayError::ConversionFailure("soffice stderr: segfault at 0x0".into());
        assert_eq!(e.public_message(), "Internal Server Error");
        assert!(!e.public_message().contains("segfault"));
    }

    #[test]
    fn bridge_error_becomes_conversion_failure() {
        let e: GatewayError = BridgeError::Remote("unsupported filter".into()).into();
        assert!(matches!(e, GatewayError::ConversionFailure(ref m) if m.contains("unsupported")));
    }
}

//! Configuration types for the gateway.
//!
//! Every tunable lives in [`GatewayConfig`], built via its
//! [`GatewayConfigBuilder`]. The binary maps environment-backed CLI flags onto
//! the builder; tests construct it directly with tiny thresholds and delays.

use crate::bridge::BridgeAddress;
use crate::error::GatewayError;
use crate::request::OutputFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Bridge address the engine is told to accept sessions on.
pub const DEFAULT_BRIDGE_ADDRESS: &str =
    "socket,host=localhost,port=2002,tcpNoDelay=1;urp;StarOffice.ComponentContext";

/// Gateway configuration.
///
/// Built via [`GatewayConfig::builder()`] or using [`GatewayConfig::default()`].
///
/// # Example
/// ```rust
/// use docbridge::GatewayConfig;
///
/// let config = GatewayConfig::builder()
///     .memory_threshold(1024 * 1024)
///     .concurrency(1)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 1);
/// ```
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Chunk size for streaming reads (pre-fetch, file-backed responses). Default: 16 KiB.
    pub chunk_size: usize,

    /// Tiered buffer threshold in bytes. Default: 10 MiB.
    ///
    /// Also decides the output sink: outputs expected to fit under it are
    /// rendered into memory, larger ones straight into a temporary file.
    pub memory_threshold: usize,

    /// Directory for rolled-over buffers and file-backed outputs. Default: OS temp dir.
    pub temp_dir: PathBuf,

    /// Maximum concurrent sessions against the engine. Default: 1.
    ///
    /// The engine keeps global state across documents; values above 1 are
    /// accepted but not safe for every document type.
    pub concurrency: usize,

    /// Maximum requests waiting for a gate slot. `None` means unbounded. Default: `None`.
    pub max_queue: Option<usize>,

    /// Output format when the request does not name one. Default: PDF.
    pub render_format: OutputFormat,

    /// Connection attempts per session, first one included. Default: 3.
    pub connect_attempts: u32,

    /// Fixed delay between connection attempts in milliseconds. Default: 500.
    pub connect_delay_ms: u64,

    /// Delay before relaunching an exited engine in milliseconds. Default: 1000.
    pub restart_backoff_ms: u64,

    /// Engine executable. Default: `/usr/bin/soffice`.
    pub engine_program: PathBuf,

    /// Isolated engine profile directory. Default: `<temp>/soffice`.
    pub profile_dir: PathBuf,

    /// Fixed bridge address, constant for the process lifetime.
    pub bridge_address: BridgeAddress,

    /// Timeout for pre-fetching remote URL inputs in seconds. Default: 120.
    pub fetch_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let temp_dir = std::env::temp_dir();
        Self {
            chunk_size: 16 * 1024,
            memory_threshold: 10 * 1024 * 1024,
            profile_dir: temp_dir.join("soffice"),
            temp_dir,
            concurrency: 1,
            max_queue: None,
            render_format: OutputFormat::Pdf,
            connect_attempts: 3,
            connect_delay_ms: 500,
            restart_backoff_ms: 1000,
            engine_program: PathBuf::from("/usr/bin/soffice"),
            bridge_address: BridgeAddress::default(),
            fetch_timeout_secs: 120,
        }
    }
}

impl GatewayConfig {
    /// Create a new builder for `GatewayConfig`.
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder {
            config: Self::default(),
            bridge_address: None,
        }
    }

    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

/// Builder for [`GatewayConfig`].
#[derive(Debug)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
    bridge_address: Option<String>,
}

impl GatewayConfigBuilder {
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.config.chunk_size = bytes;
        self
    }

    pub fn memory_threshold(mut self, bytes: usize) -> Self {
        self.config.memory_threshold = bytes;
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = dir.into();
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    /// Limit the number of queued requests; `0` keeps the queue unbounded.
    pub fn max_queue(mut self, depth: usize) -> Self {
        self.config.max_queue = (depth > 0).then_some(depth);
        self
    }

    pub fn render_format(mut self, format: OutputFormat) -> Self {
        self.config.render_format = format;
        self
    }

    pub fn connect_attempts(mut self, n: u32) -> Self {
        self.config.connect_attempts = n;
        self
    }

    pub fn connect_delay_ms(mut self, ms: u64) -> Self {
        self.config.connect_delay_ms = ms;
        self
    }

    pub fn restart_backoff_ms(mut self, ms: u64) -> Self {
        self.config.restart_backoff_ms = ms;
        self
    }

    pub fn engine_program(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.engine_program = path.into();
        self
    }

    pub fn profile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.profile_dir = dir.into();
        self
    }

    pub fn bridge_address(mut self, address: impl Into<String>) -> Self {
        self.bridge_address = Some(address.into());
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(mut self) -> Result<GatewayConfig, GatewayError> {
        if let Some(raw) = self.bridge_address.take() {
            self.config.bridge_address = raw.parse()?;
        }
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(GatewayError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.chunk_size == 0 {
            return Err(GatewayError::InvalidConfig(
                "Chunk size must be ≥ 1 byte".into(),
            ));
        }
        if c.connect_attempts == 0 {
            return Err(GatewayError::InvalidConfig(
                "Connect attempts must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Page range ───────────────────────────────────────────────────────────

/// Inclusive, 1-indexed page range passed to the export filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    start: u32,
    end: u32,
}

impl PageRange {
    /// Validate `start ≤ end`, both positive.
    pub fn new(start: u32, end: u32) -> Result<Self, GatewayError> {
        if start < 1 {
            return Err(GatewayError::BadRequest(format!(
                "Pages are 1-indexed, minimum is 1 (got {start})"
            )));
        }
        if start > end {
            return Err(GatewayError::BadRequest(format!(
                "Invalid page range '{start}-{end}': start must be <= end"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Parses the `pages=<start>-<end>` query form.
impl FromStr for PageRange {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.split('-').collect();
        let numbers = segments
            .iter()
            .map(|seg| seg.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| GatewayError::BadRequest("Invalid param pages".into()))?;

        match numbers.as_slice() {
            [start, end] => PageRange::new(*start, *end),
            _ => Err(GatewayError::BadRequest(
                "Param pages must be in form: 1-?".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.chunk_size, 16384);
        assert_eq!(config.memory_threshold, 10 * 1024 * 1024);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.connect_delay(), Duration::from_millis(500));
        assert_eq!(config.restart_backoff(), Duration::from_secs(1));
        assert!(config.max_queue.is_none());
        assert_eq!(config.bridge_address.to_string(), DEFAULT_BRIDGE_ADDRESS);
    }

    #[test]
    fn builder_rejects_zero_concurrency() {
        let err = GatewayConfig::builder().concurrency(0).build().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[test]
    fn builder_max_queue_zero_is_unbounded() {
        let config = GatewayConfig::builder().max_queue(0).build().unwrap();
        assert!(config.max_queue.is_none());
        let config = GatewayConfig::builder().max_queue(8).build().unwrap();
        assert_eq!(config.max_queue, Some(8));
    }

    #[test]
    fn builder_parses_bridge_address() {
        let config = GatewayConfig::builder()
            .bridge_address("socket,host=127.0.0.1,port=2003;urp;StarOffice.ComponentContext")
            .build()
            .unwrap();
        assert_eq!(config.bridge_address.port(), 2003);

        let err = GatewayConfig::builder()
            .bridge_address("pipe,name=office;urp")
            .build()
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[test]
    fn page_range_parses_valid_pairs() {
        for (a, b) in [(1, 1), (1, 2), (3, 15), (7, 4000)] {
            let range: PageRange = format!("{a}-{b}").parse().unwrap();
            assert_eq!((range.start(), range.end()), (a, b));
        }
        let range: PageRange = " 2 - 5 ".parse().unwrap();
        assert_eq!(range.to_string(), "2-5");
    }

    #[test]
    fn page_range_rejects_malformed() {
        for bad in ["", "1", "a-b", "1-2-3", "1-", "-1-3", "1.5-2", "x-2", "2-1", "0-3"] {
            assert!(
                matches!(bad.parse::<PageRange>(), Err(GatewayError::BadRequest(_))),
                "expected BadRequest for {bad:?}"
            );
        }
    }
}

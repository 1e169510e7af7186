//! Input capture: turn what the client sent into a [`RequestInput`].
//!
//! Two shapes are accepted:
//!
//! * a request body, streamed chunk by chunk into a [`TieredBuffer`] so large
//!   uploads spill to disk instead of sitting in memory;
//! * a `url=` reference. Local references (`file://` or an absolute path) are
//!   handed to the engine as-is; `http(s)://` references are pre-fetched into
//!   a [`TieredBuffer`] first, forwarding the caller's `x-fetch-*` headers.

use crate::buffer::TieredBuffer;
use crate::error::GatewayError;
use crate::request::RequestInput;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Header prefix marking headers to forward on a remote pre-fetch.
pub const FETCH_HEADER_PREFIX: &str = "x-fetch-";

/// Where the tiered buffers created here live.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub threshold: usize,
    pub temp_dir: PathBuf,
    pub fetch_timeout: Duration,
}

/// Captured input plus the content type learned along the way.
#[derive(Debug)]
pub struct CapturedInput {
    pub input: RequestInput,
    pub content_type: Option<String>,
}

/// A classified `url=` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlReference {
    /// `file://` URL the engine opens directly.
    Local(String),
    /// Remote document that has to be fetched first.
    Remote(Url),
}

/// Classify a `url=` value. Relative paths and other schemes are rejected.
pub fn classify_url(raw: &str) -> Result<UrlReference, GatewayError> {
    let raw = raw.trim();
    if raw.starts_with('/') {
        let url = Url::from_file_path(Path::new(raw))
            .map_err(|()| GatewayError::BadRequest(format!("Invalid file path '{raw}'")))?;
        return Ok(UrlReference::Local(url.to_string()));
    }

    let url = Url::parse(raw)
        .map_err(|e| GatewayError::BadRequest(format!("Invalid param url: {e}")))?;
    match url.scheme() {
        "file" => {
            url.to_file_path().map_err(|()| {
                GatewayError::BadRequest(format!("Invalid file URL '{raw}'"))
            })?;
            Ok(UrlReference::Local(url.to_string()))
        }
        "http" | "https" => Ok(UrlReference::Remote(url)),
        other => Err(GatewayError::BadRequest(format!(
            "Unsupported url scheme '{other}'"
        ))),
    }
}

/// Pick the headers to forward on a pre-fetch, with the prefix removed.
pub fn forwarded_headers<'a, I>(headers: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .filter_map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            let stripped = lower.strip_prefix(FETCH_HEADER_PREFIX)?;
            (!stripped.is_empty()).then(|| (stripped.to_string(), value.to_string()))
        })
        .collect()
}

/// Stream a body into a fresh tiered buffer, rewound for reading.
pub async fn capture_stream<S, B, E>(
    mut stream: S,
    settings: &CaptureSettings,
) -> Result<TieredBuffer, GatewayError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]> + Send + 'static,
    E: Display,
{
    let mut buffer = TieredBuffer::in_dir(settings.threshold, &settings.temp_dir);
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| GatewayError::BadRequest(format!("Failed to read body: {e}")))?;
        buffer = buffer.append(chunk).await?;
    }
    let buffer = buffer.rewind().await?;
    debug!(
        "Captured {} bytes ({})",
        buffer.len(),
        if buffer.is_rolled_over() { "file" } else { "memory" }
    );
    Ok(buffer)
}

/// Resolve a `url=` reference into request input.
pub async fn capture_reference(
    raw: &str,
    headers: &[(String, String)],
    settings: &CaptureSettings,
) -> Result<CapturedInput, GatewayError> {
    match classify_url(raw)? {
        UrlReference::Local(url) => {
            debug!("Passing local reference {url} to the engine");
            Ok(CapturedInput {
                input: RequestInput::Reference(url),
                content_type: None,
            })
        }
        UrlReference::Remote(url) => prefetch(url, headers, settings).await,
    }
}

/// Download a remote document into a tiered buffer.
async fn prefetch(
    url: Url,
    headers: &[(String, String)],
    settings: &CaptureSettings,
) -> Result<CapturedInput, GatewayError> {
    info!("Pre-fetching {}", url);
    let fetch_failed =
        |reason: String| GatewayError::BadRequest(format!("Cannot fetch '{url}': {reason}"));

    let client = reqwest::Client::builder()
        .timeout(settings.fetch_timeout)
        .build()
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    let mut request = client.get(url.clone());
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let mut response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            fetch_failed(format!("timed out after {}s", settings.fetch_timeout.as_secs()))
        } else {
            fetch_failed(e.to_string())
        }
    })?;
    if !response.status().is_success() {
        return Err(fetch_failed(format!("HTTP {}", response.status())));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut buffer = TieredBuffer::in_dir(settings.threshold, &settings.temp_dir);
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| fetch_failed(e.to_string()))?
    {
        buffer = buffer.append(chunk).await?;
    }
    let buffer = buffer.rewind().await?;
    info!("Fetched {} bytes from {}", buffer.len(), url);

    Ok(CapturedInput {
        input: RequestInput::Buffer(buffer),
        content_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn settings(dir: &Path, threshold: usize) -> CaptureSettings {
        CaptureSettings {
            threshold,
            temp_dir: dir.to_path_buf(),
            fetch_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn classify_local_and_remote() {
        assert_eq!(
            classify_url("/tmp/report.docx").unwrap(),
            UrlReference::Local("file:///tmp/report.docx".into())
        );
        assert_eq!(
            classify_url("file:///srv/in.odt").unwrap(),
            UrlReference::Local("file:///srv/in.odt".into())
        );
        assert!(matches!(
            classify_url("https://example.com/a.docx").unwrap(),
            UrlReference::Remote(_)
        ));
    }

    #[test]
    fn classify_rejects_other_schemes() {
        for bad in ["ftp://example.com/a.doc", "relative/path.doc", "not a url"] {
            assert!(
                matches!(classify_url(bad), Err(GatewayError::BadRequest(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn fetch_headers_are_stripped() {
        let headers = forwarded_headers([
            ("X-Fetch-Cookie", "session=1"),
            ("x-fetch-authorization", "Bearer t"),
            ("x-fetch-", "ignored"),
            ("content-type", "text/plain"),
        ]);
        assert_eq!(
            headers,
            vec![
                ("cookie".to_string(), "session=1".to_string()),
                ("authorization".to_string(), "Bearer t".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn capture_small_body_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let chunks: Vec<Result<&[u8], std::io::Error>> = vec![Ok(&b"hello "[..]), Ok(&b"world"[..])];
        let mut buffer = capture_stream(stream::iter(chunks), &settings(dir.path(), 64))
            .await
            .unwrap();
        assert!(!buffer.is_rolled_over());
        assert_eq!(buffer.read(64).unwrap().unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn capture_large_body_spills() {
        let dir = tempfile::tempdir().unwrap();
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> =
            (0..8).map(|i| Ok(vec![b'a' + i; 16])).collect();
        let mut buffer = capture_stream(stream::iter(chunks), &settings(dir.path(), 32))
            .await
            .unwrap();
        assert!(buffer.is_rolled_over());
        assert_eq!(buffer.len(), 128);
        assert_eq!(buffer.read(16).unwrap().unwrap(), vec![b'a'; 16]);
        let path = buffer.path().unwrap().to_path_buf();
        assert!(path.starts_with(dir.path()));

        drop(buffer);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn body_error_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let chunks: Vec<Result<&[u8], std::io::Error>> = vec![
            Ok(&b"partial"[..]),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let err = capture_stream(stream::iter(chunks), &settings(dir.path(), 64))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }
}

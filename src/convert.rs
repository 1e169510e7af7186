//! Conversion sessions.
//!
//! A session is one complete, blocking conversion against the live engine:
//! connect (with bounded retry), load, pick the export filter, store into the
//! chosen sink, release the document. It always runs on a gate worker thread.
//!
//! ## Retry Strategy
//!
//! Only the connection is retried: `connect_attempts` tries with a fixed
//! `connect_delay` between them, which rides out an engine the supervisor is
//! still relaunching. Once a document handle exists nothing is retried; load
//! and export failures are terminal and surface as
//! [`GatewayError::ConversionFailure`].
//!
//! ## Handle release
//!
//! The document handle is wrapped in a guard that disposes and closes it
//! exactly once, whether rendering succeeded, failed, or panicked.

use crate::bridge::{
    BridgeAddress, DocumentSource, EngineConnection, EngineConnector, EngineDocument,
    PropertySet, StoreTarget,
};
use crate::buffer::TieredBuffer;
use crate::config::GatewayConfig;
use crate::error::{BridgeError, GatewayError};
use crate::gate::{ConversionGate, SessionExecutor};
use crate::output::{OutputSink, RenderedOutput};
use crate::pipeline::filters;
use crate::request::{ConversionRequest, RequestInput};
use crate::supervisor::EngineEndpoint;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Bytes inspected when the content type has to be sniffed.
const SNIFF_LEN: usize = 512;

/// Session tunables, taken from [`GatewayConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub memory_threshold: usize,
    pub temp_dir: PathBuf,
    pub connect_attempts: u32,
    pub connect_delay: Duration,
}

impl From<&GatewayConfig> for SessionSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            memory_threshold: config.memory_threshold,
            temp_dir: config.temp_dir.clone(),
            connect_attempts: config.connect_attempts,
            connect_delay: config.connect_delay(),
        }
    }
}

/// Runs conversion sessions against whatever engine the endpoint points at.
pub struct Converter {
    connector: Arc<dyn EngineConnector>,
    endpoint: Arc<dyn EngineEndpoint>,
    settings: SessionSettings,
}

impl Converter {
    pub fn new(
        connector: Arc<dyn EngineConnector>,
        endpoint: Arc<dyn EngineEndpoint>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            connector,
            endpoint,
            settings: SessionSettings::from(config),
        }
    }

    /// Convert one request. Blocks the calling thread.
    pub fn convert(&self, request: ConversionRequest) -> Result<RenderedOutput, GatewayError> {
        let started = Instant::now();

        // ── Step 1: Connect ──────────────────────────────────────────────
        let address = self.endpoint.current_address();
        if !self.endpoint.is_available() {
            debug!("Engine not reported running, connecting anyway");
        }
        let mut connection = connect_with_retry(
            self.connector.as_ref(),
            &address,
            self.settings.connect_attempts,
            self.settings.connect_delay,
        )?;

        // ── Step 2: Import options ───────────────────────────────────────
        let head = peek(request.input())?;
        let content_type = filters::effective_content_type(request.declared_content_type(), &head);
        let import = content_type.as_deref().and_then(filters::import_filter);
        debug!(
            "Loading {} with filter {}",
            content_type.as_deref().unwrap_or("unknown content"),
            import.map_or("<detect>", |f| f.name)
        );
        let import_props = filters::import_properties(import);

        // ── Step 3: Load ─────────────────────────────────────────────────
        let spooled_url;
        let source = match request.input() {
            RequestInput::Buffer(buffer) => match (buffer.memory(), buffer.path()) {
                (Some(bytes), _) => DocumentSource::Stream(bytes),
                (None, Some(path)) => {
                    spooled_url = file_url(path)?;
                    DocumentSource::Url(&spooled_url)
                }
                (None, None) => return Err(GatewayError::InvalidState("input buffer closed")),
            },
            RequestInput::Reference(url) => DocumentSource::Url(url),
        };
        let document = connection
            .load(source, &import_props)
            .map_err(|e| GatewayError::ConversionFailure(format!("load failed: {e}")))?;
        let mut guard = DocumentGuard::new(document);

        // ── Steps 4–6: Filter, sink, store ───────────────────────────────
        let rendered = self.render(guard.document(), &request);
        guard.release();
        let (filter, sink) = rendered?;

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Converted with {} into {} ({} bytes) in {}ms",
            filter,
            if sink.is_file_backed() { "file" } else { "memory" },
            sink.len().unwrap_or_default(),
            duration_ms
        );

        Ok(RenderedOutput {
            format: request.target_format(),
            filter,
            sink,
            duration_ms,
        })
    }

    fn render(
        &self,
        document: &mut dyn EngineDocument,
        request: &ConversionRequest,
    ) -> Result<(String, OutputSink), GatewayError> {
        let format = request.target_format();
        let family = filters::detect_family(document)?;
        let filter = family.export_filter(format);
        let props = filters::export_properties(&filter, format, request.page_range());

        // Not every document type has these; failures are expected.
        if let Err(e) = document.set_property("ShowChanges", false.into()) {
            debug!("ShowChanges not applied: {e}");
        }
        if let Err(e) = document.refresh() {
            debug!("Refresh skipped: {e}");
        }

        let sink = match request.output_size_hint() {
            Some(hint) if hint > self.settings.memory_threshold as u64 => {
                debug!("Expecting {hint} bytes, rendering straight to disk");
                self.store_to_file(document, &props, format.extension())?
            }
            _ => self.store_to_buffer(document, &props)?,
        };
        Ok((filter, sink))
    }

    fn store_to_buffer(
        &self,
        document: &mut dyn EngineDocument,
        props: &PropertySet,
    ) -> Result<OutputSink, GatewayError> {
        let mut buffer =
            TieredBuffer::in_dir(self.settings.memory_threshold, &self.settings.temp_dir);
        let stored = document.store(StoreTarget::Stream(&mut buffer.writer()), props);
        match stored {
            Ok(()) => buffer.into_output(),
            // The engine only saw a write error; the buffer knows it was the spill.
            Err(e) if buffer.is_abandoned() => Err(GatewayError::Storage(match e {
                BridgeError::Io(io) => io,
                other => io::Error::other(other.to_string()),
            })),
            Err(e) => Err(e.into()),
        }
    }

    fn store_to_file(
        &self,
        document: &mut dyn EngineDocument,
        props: &PropertySet,
        extension: &str,
    ) -> Result<OutputSink, GatewayError> {
        let path = tempfile::Builder::new()
            .prefix("docbridge-out-")
            .suffix(&format!(".{extension}"))
            .tempfile_in(&self.settings.temp_dir)?
            .into_temp_path();
        let url = file_url(&path)?;
        // `path` unlinks the file if the store fails.
        document.store(StoreTarget::Url(&url), props)?;
        Ok(OutputSink::FileBacked(path))
    }
}

impl SessionExecutor for Converter {
    fn execute(&self, request: ConversionRequest) -> Result<RenderedOutput, GatewayError> {
        self.convert(request)
    }
}

/// Open a connection, retrying [`BridgeError::Connect`] failures.
pub fn connect_with_retry(
    connector: &dyn EngineConnector,
    address: &BridgeAddress,
    attempts: u32,
    delay: Duration,
) -> Result<Box<dyn EngineConnection>, GatewayError> {
    for attempt in 1..=attempts {
        match connector.connect(address) {
            Ok(connection) => {
                if attempt > 1 {
                    info!("Connected to engine on attempt {attempt}/{attempts}");
                }
                return Ok(connection);
            }
            Err(BridgeError::Connect(reason)) => {
                warn!("Engine connect attempt {attempt}/{attempts} failed: {reason}");
                if attempt < attempts {
                    thread::sleep(delay);
                }
            }
            Err(other) => return Err(other.into()),
        }
    }
    Err(GatewayError::UpstreamUnavailable {
        address: address.to_string(),
        attempts,
    })
}

/// Round-trip a tiny plain-text document through the whole pipeline.
pub async fn health_check(gate: &ConversionGate) -> Result<(), GatewayError> {
    let mut buffer = TieredBuffer::new(1024);
    buffer.write(b"health check")?;
    let request = ConversionRequest::from_buffer(buffer).content_type("text/plain");
    let output = gate.submit(request).await?;
    if output.sink.is_empty()? {
        return Err(GatewayError::ConversionFailure(
            "health check produced no output".into(),
        ));
    }
    Ok(())
}

/// Leading bytes of the input, for content sniffing.
fn peek(input: &RequestInput) -> Result<Vec<u8>, GatewayError> {
    match input {
        RequestInput::Buffer(buffer) => match (buffer.memory(), buffer.path()) {
            (Some(bytes), _) => Ok(bytes[..bytes.len().min(SNIFF_LEN)].to_vec()),
            (None, Some(path)) => {
                let mut head = Vec::with_capacity(SNIFF_LEN);
                std::fs::File::open(path)?
                    .take(SNIFF_LEN as u64)
                    .read_to_end(&mut head)?;
                Ok(head)
            }
            (None, None) => Ok(Vec::new()),
        },
        RequestInput::Reference(_) => Ok(Vec::new()),
    }
}

fn file_url(path: &Path) -> Result<String, GatewayError> {
    Url::from_file_path(path)
        .map(String::from)
        .map_err(|()| GatewayError::Internal(format!("not an absolute path: {}", path.display())))
}

/// Disposes and closes a document handle exactly once.
struct DocumentGuard<'a> {
    document: Box<dyn EngineDocument + 'a>,
    released: bool,
}

impl<'a> DocumentGuard<'a> {
    fn new(document: Box<dyn EngineDocument + 'a>) -> Self {
        Self {
            document,
            released: false,
        }
    }

    fn document(&mut self) -> &mut (dyn EngineDocument + 'a) {
        self.document.as_mut()
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Err(e) = self.document.dispose() {
            warn!("Document dispose failed: {e}");
        }
        if let Err(e) = self.document.close(true) {
            warn!("Document close failed: {e}");
        }
    }
}

impl Drop for DocumentGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::PropertyValue;
    use crate::config::PageRange;
    use crate::supervisor::StaticEndpoint;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const MARKER: &[u8] = b"%MOCK-PDF%";

    #[derive(Default)]
    struct Script {
        fail_connects: u32,
        fail_load: bool,
        fail_store: bool,
        big_output: bool,
        services: Vec<&'static str>,
    }

    #[derive(Default)]
    struct Shared {
        script: Script,
        connects: AtomicU32,
        calls: Mutex<Vec<String>>,
    }

    impl Shared {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    struct MockEngine(Arc<Shared>);

    impl EngineConnector for MockEngine {
        fn connect(&self, _: &BridgeAddress) -> Result<Box<dyn EngineConnection>, BridgeError> {
            let n = self.0.connects.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.0.script.fail_connects {
                return Err(BridgeError::Connect("connection refused".into()));
            }
            Ok(Box::new(MockConnection(Arc::clone(&self.0))))
        }
    }

    struct MockConnection(Arc<Shared>);

    impl EngineConnection for MockConnection {
        fn load(
            &mut self,
            source: DocumentSource<'_>,
            props: &PropertySet,
        ) -> Result<Box<dyn EngineDocument + '_>, BridgeError> {
            let kind = match source {
                DocumentSource::Stream(_) => "stream".to_string(),
                DocumentSource::Url(url) => url.to_string(),
            };
            self.0.record(format!(
                "load {kind} {}",
                props.get_str("FilterName").unwrap_or("-")
            ));
            if self.0.script.fail_load {
                return Err(BridgeError::Remote("corrupt input".into()));
            }
            Ok(Box::new(MockDocument(Arc::clone(&self.0))))
        }
    }

    struct MockDocument(Arc<Shared>);

    impl EngineDocument for MockDocument {
        fn supports_service(&mut self, service: &str) -> Result<bool, BridgeError> {
            Ok(self.0.script.services.iter().any(|s| *s == service))
        }

        fn set_property(&mut self, name: &str, _: PropertyValue) -> Result<(), BridgeError> {
            Err(BridgeError::Remote(format!("unknown property {name}")))
        }

        fn refresh(&mut self) -> Result<(), BridgeError> {
            Ok(())
        }

        fn store(&mut self, target: StoreTarget<'_>, props: &PropertySet) -> Result<(), BridgeError> {
            let range = match props.get("FilterData") {
                Some(PropertyValue::Nested(data)) => data.get_str("PageRange").unwrap_or("-"),
                _ => "-",
            };
            self.0.record(format!(
                "store {} {range}",
                props.get_str("FilterName").unwrap_or("-")
            ));
            if self.0.script.fail_store {
                return Err(BridgeError::Remote("export filter failed".into()));
            }
            let copies = if self.0.script.big_output { 16 } else { 1 };
            match target {
                StoreTarget::Stream(out) => {
                    for _ in 0..copies {
                        out.write_all(MARKER)?;
                    }
                }
                StoreTarget::Url(url) => {
                    let path = Url::parse(url).unwrap().to_file_path().unwrap();
                    std::fs::write(path, MARKER)?;
                }
            }
            Ok(())
        }

        fn dispose(&mut self) -> Result<(), BridgeError> {
            self.0.record("dispose".into());
            Ok(())
        }

        fn close(&mut self, _: bool) -> Result<(), BridgeError> {
            self.0.record("close".into());
            Ok(())
        }
    }

    fn converter(script: Script, dir: &Path) -> (Converter, Arc<Shared>) {
        let shared = Arc::new(Shared {
            script,
            ..Shared::default()
        });
        let config = GatewayConfig::builder()
            .memory_threshold(64)
            .temp_dir(dir)
            .connect_delay_ms(30)
            .build()
            .unwrap();
        let converter = Converter::new(
            Arc::new(MockEngine(Arc::clone(&shared))),
            Arc::new(StaticEndpoint::new(config.bridge_address.clone())),
            &config,
        );
        (converter, shared)
    }

    fn text_request(body: &[u8]) -> ConversionRequest {
        let mut buffer = TieredBuffer::new(64);
        buffer.write(body).unwrap();
        ConversionRequest::from_buffer(buffer).content_type("text/plain")
    }

    #[test]
    fn retries_connect_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            fail_connects: 2,
            ..Script::default()
        };
        let (converter, shared) = converter(script, dir.path());

        let started = Instant::now();
        let output = converter.convert(text_request(b"hello")).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(shared.connects.load(Ordering::SeqCst), 3);
        assert!(output.into_bytes().unwrap().starts_with(MARKER));
    }

    #[test]
    fn gives_up_after_three_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            fail_connects: u32::MAX,
            ..Script::default()
        };
        let (converter, shared) = converter(script, dir.path());

        let err = converter.convert(text_request(b"hello")).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::UpstreamUnavailable { attempts: 3, .. }
        ));
        assert_eq!(shared.connects.load(Ordering::SeqCst), 3);
        assert!(shared.calls().is_empty());
    }

    #[test]
    fn plain_text_renders_into_memory() {
        let dir = tempfile::tempdir().unwrap();
        let (converter, shared) = converter(Script::default(), dir.path());

        let output = converter.convert(text_request(b"hello")).unwrap();
        assert_eq!(output.filter, "writer_pdf_Export");
        assert_eq!(output.media_type(), "application/pdf");
        assert!(!output.sink.is_file_backed());
        assert_eq!(
            shared.calls(),
            vec![
                "load stream Text (encoded)",
                "store writer_pdf_Export -",
                "dispose",
                "close"
            ]
        );
    }

    #[test]
    fn page_range_and_service_pick_filter() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            services: vec!["com.sun.star.presentation.PresentationDocument"],
            ..Script::default()
        };
        let (converter, shared) = converter(script, dir.path());

        let request = text_request(b"slides").pages(PageRange::new(2, 3).unwrap());
        let output = converter.convert(request).unwrap();
        assert_eq!(output.filter, "impress_pdf_Export");
        assert_eq!(shared.count("store impress_pdf_Export 2-3"), 1);
    }

    #[test]
    fn large_output_goes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let (converter, _shared) = converter(Script::default(), dir.path());

        let output = converter
            .convert(text_request(b"hello").expected_output_size(1 << 20))
            .unwrap();
        let path = output.sink.path().unwrap().to_path_buf();
        assert!(path.starts_with(dir.path()));
        assert_eq!(path.extension().unwrap(), "pdf");
        assert_eq!(std::fs::read(&path).unwrap(), MARKER);

        drop(output);
        assert!(!path.exists());
    }

    #[test]
    fn spooled_input_is_loaded_by_url() {
        let dir = tempfile::tempdir().unwrap();
        let (converter, shared) = converter(Script::default(), dir.path());

        let mut buffer = TieredBuffer::in_dir(8, dir.path());
        buffer.write(b"%PDF-1.7 and a long tail").unwrap();
        let spooled = buffer.path().unwrap().to_path_buf();
        let request = ConversionRequest::from_buffer(buffer);

        converter.convert(request).unwrap();
        let load = &shared.calls()[0];
        assert!(load.starts_with("load file://"), "{load}");
        assert!(load.ends_with("draw_pdf_import"), "{load}");
        assert!(!spooled.exists());
    }

    #[test]
    fn store_failure_releases_document_once() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            fail_store: true,
            ..Script::default()
        };
        let (converter, shared) = converter(script, dir.path());

        let err = converter
            .convert(text_request(b"hello").expected_output_size(1 << 20))
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConversionFailure(_)));
        assert_eq!(shared.count("dispose"), 1);
        assert_eq!(shared.count("close"), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn spill_failure_during_store_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let script = Script {
            big_output: true,
            ..Script::default()
        };
        let (converter, shared) = converter(script, &missing);

        let err = converter.convert(text_request(b"hello")).unwrap_err();
        assert!(matches!(err, GatewayError::Storage(_)), "{err:?}");
        assert_eq!(shared.count("dispose"), 1);
        assert_eq!(shared.count("close"), 1);
    }

    #[test]
    fn load_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            fail_load: true,
            ..Script::default()
        };
        let (converter, shared) = converter(script, dir.path());

        let err = converter.convert(text_request(b"hello")).unwrap_err();
        assert!(matches!(err, GatewayError::ConversionFailure(_)));
        assert_eq!(shared.connects.load(Ordering::SeqCst), 1);
        assert_eq!(shared.count("load"), 1);
        assert_eq!(shared.count("dispose"), 0);
    }
}

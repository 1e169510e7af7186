//! Rendered output returned by a conversion session.

use crate::request::OutputFormat;
use std::io;
use std::path::Path;
use tempfile::TempPath;

/// Where the rendered bytes live.
///
/// Decided once per session from the expected output size. A
/// [`OutputSink::FileBacked`] path is unlinked when the sink is dropped, so
/// whoever streams it to a client only has to keep it alive until the last
/// chunk is sent.
#[derive(Debug)]
pub enum OutputSink {
    InMemory(Vec<u8>),
    FileBacked(TempPath),
}

impl OutputSink {
    /// Length of the rendered artifact in bytes.
    pub fn len(&self) -> io::Result<u64> {
        match self {
            OutputSink::InMemory(bytes) => Ok(bytes.len() as u64),
            OutputSink::FileBacked(path) => Ok(std::fs::metadata(path)?.len()),
        }
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        self.len().map(|n| n == 0)
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self, OutputSink::FileBacked(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            OutputSink::InMemory(_) => None,
            OutputSink::FileBacked(path) => Some(&**path),
        }
    }

    /// Materialise the artifact in memory. The backing file, if any, is
    /// removed once read.
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        match self {
            OutputSink::InMemory(bytes) => Ok(bytes),
            OutputSink::FileBacked(path) => std::fs::read(&path),
        }
    }
}

/// The result of one successful conversion.
#[derive(Debug)]
pub struct RenderedOutput {
    /// Format the engine was asked to produce.
    pub format: OutputFormat,
    /// Export filter that was selected for the loaded document.
    pub filter: String,
    /// Rendered bytes or the file holding them.
    pub sink: OutputSink,
    /// Wall-clock time spent inside the session, connection included.
    pub duration_ms: u64,
}

impl RenderedOutput {
    /// MIME type to declare on the response.
    pub fn media_type(&self) -> &'static str {
        self.format.media_type()
    }

    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        self.sink.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn in_memory_len() {
        let sink = OutputSink::InMemory(b"%PDF-1.7".to_vec());
        assert_eq!(sink.len().unwrap(), 8);
        assert!(!sink.is_file_backed());
        assert!(sink.path().is_none());
    }

    #[test]
    fn file_backed_is_removed_after_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"rendered").unwrap();
        let sink = OutputSink::FileBacked(file.into_temp_path());
        let path = sink.path().unwrap().to_path_buf();
        assert_eq!(sink.len().unwrap(), 8);

        assert_eq!(sink.into_bytes().unwrap(), b"rendered");
        assert!(!path.exists());
    }
}

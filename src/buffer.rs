//! Tiered byte storage: memory first, a named temporary file past a threshold.
//!
//! Request bodies and rendered outputs can be arbitrarily large. A
//! [`TieredBuffer`] keeps small payloads in a `Vec<u8>` and, the first time a
//! write would push the logical size past `threshold`, migrates everything
//! written so far into a [`tempfile::NamedTempFile`]. The file has a real path
//! so the engine can be handed a `file://` reference instead of a byte stream.
//!
//! Rollover is one-way and happens at most once. After a failed migration the
//! buffer is unusable and every further call returns
//! [`GatewayError::InvalidState`].
//!
//! The backing file is unlinked by [`TieredBuffer::close`] or, on any other
//! exit path (error, partial read, panic), when the buffer is dropped.
//!
//! The plain methods do blocking file I/O. Async callers use
//! [`TieredBuffer::append`] and [`TieredBuffer::rewind`], which take the
//! buffer by value and move any write that touches disk onto Tokio's
//! blocking pool.

use crate::error::GatewayError;
use crate::output::OutputSink;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

enum Storage {
    Memory(Cursor<Vec<u8>>),
    File(NamedTempFile),
    Closed,
    Failed,
}

/// Growable byte container that spills to disk once.
pub struct TieredBuffer {
    storage: Storage,
    threshold: usize,
    temp_dir: Option<PathBuf>,
    size: u64,
}

impl TieredBuffer {
    /// A buffer that rolls over into the OS temp directory.
    pub fn new(threshold: usize) -> Self {
        Self {
            storage: Storage::Memory(Cursor::new(Vec::new())),
            threshold,
            temp_dir: None,
            size: 0,
        }
    }

    /// A buffer that rolls over into `dir`.
    pub fn in_dir(threshold: usize, dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: Some(dir.into()),
            ..Self::new(threshold)
        }
    }

    /// Append `bytes` at the current position. Returns the number accepted.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, GatewayError> {
        if let Storage::Memory(cursor) = &self.storage {
            let end = cursor.position() + bytes.len() as u64;
            if end > self.threshold as u64 {
                self.rollover()?;
            }
        }

        let position = match &mut self.storage {
            Storage::Memory(cursor) => {
                cursor.write_all(bytes)?;
                cursor.position()
            }
            Storage::File(file) => {
                file.write_all(bytes)?;
                file.stream_position()?
            }
            Storage::Closed => return Err(GatewayError::InvalidState("write after close")),
            Storage::Failed => return Err(GatewayError::InvalidState("buffer abandoned")),
        };
        self.size = self.size.max(position);
        Ok(bytes.len())
    }

    /// Append a chunk without blocking the async runtime.
    ///
    /// Writes that stay in memory run inline; a write that triggers the
    /// rollover, or lands on an already rolled-over buffer, runs on the
    /// blocking pool.
    pub async fn append<B>(mut self, chunk: B) -> Result<Self, GatewayError>
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        if self.fits_in_memory(chunk.as_ref().len()) {
            self.write(chunk.as_ref())?;
            return Ok(self);
        }
        tokio::task::spawn_blocking(move || {
            self.write(chunk.as_ref())?;
            Ok(self)
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("buffer write task failed: {e}")))?
    }

    /// Seek back to the start, off the runtime when file-backed.
    pub async fn rewind(mut self) -> Result<Self, GatewayError> {
        if !self.is_rolled_over() {
            self.seek(SeekFrom::Start(0))?;
            return Ok(self);
        }
        tokio::task::spawn_blocking(move || {
            self.seek(SeekFrom::Start(0))?;
            Ok(self)
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("buffer seek task failed: {e}")))?
    }

    /// Whether writing `len` more bytes at the current position stays in memory.
    pub fn fits_in_memory(&self, len: usize) -> bool {
        match &self.storage {
            Storage::Memory(cursor) => cursor.position() + len as u64 <= self.threshold as u64,
            _ => false,
        }
    }

    /// Read up to `max_len` bytes from the current position.
    ///
    /// `Ok(None)` signals end of data.
    pub fn read(&mut self, max_len: usize) -> Result<Option<Vec<u8>>, GatewayError> {
        let mut chunk = vec![0u8; max_len];
        let n = match &mut self.storage {
            Storage::Memory(cursor) => cursor.read(&mut chunk)?,
            Storage::File(file) => file.read(&mut chunk)?,
            Storage::Closed => return Err(GatewayError::InvalidState("read after close")),
            Storage::Failed => return Err(GatewayError::InvalidState("buffer abandoned")),
        };
        if n == 0 && max_len > 0 {
            return Ok(None);
        }
        chunk.truncate(n);
        Ok(Some(chunk))
    }

    /// Current position in the logical stream.
    pub fn tell(&mut self) -> Result<u64, GatewayError> {
        match &mut self.storage {
            Storage::Memory(cursor) => Ok(cursor.position()),
            Storage::File(file) => Ok(file.stream_position()?),
            Storage::Closed => Err(GatewayError::InvalidState("tell after close")),
            Storage::Failed => Err(GatewayError::InvalidState("buffer abandoned")),
        }
    }

    /// Reposition within the logical stream.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, GatewayError> {
        match &mut self.storage {
            Storage::Memory(cursor) => Ok(cursor.seek(pos)?),
            Storage::File(file) => Ok(file.seek(pos)?),
            Storage::Closed => Err(GatewayError::InvalidState("seek after close")),
            Storage::Failed => Err(GatewayError::InvalidState("buffer abandoned")),
        }
    }

    /// Release memory and unlink the backing file, if any. Idempotent.
    pub fn close(&mut self) -> Result<(), GatewayError> {
        match std::mem::replace(&mut self.storage, Storage::Closed) {
            Storage::File(file) => {
                let path = file.path().to_path_buf();
                file.close()?;
                debug!("Removed spooled file {}", path.display());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Total bytes written (the logical length of the stream).
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Whether the one-time migration to disk has happened.
    pub fn is_rolled_over(&self) -> bool {
        matches!(self.storage, Storage::File(_))
    }

    /// Whether a failed rollover left the buffer unusable.
    pub fn is_abandoned(&self) -> bool {
        matches!(self.storage, Storage::Failed)
    }

    /// Path of the backing file once rolled over.
    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::File(file) => Some(file.path()),
            _ => None,
        }
    }

    /// Buffered bytes while still memory-backed.
    pub fn memory(&self) -> Option<&[u8]> {
        match &self.storage {
            Storage::Memory(cursor) => Some(cursor.get_ref().as_slice()),
            _ => None,
        }
    }

    /// Adapter implementing [`std::io::Write`] for engines that stream output.
    pub fn writer(&mut self) -> BufferWriter<'_> {
        BufferWriter { buffer: self }
    }

    /// Hand the contents over as a response sink without copying file data.
    pub fn into_output(mut self) -> Result<OutputSink, GatewayError> {
        match std::mem::replace(&mut self.storage, Storage::Closed) {
            Storage::Memory(cursor) => Ok(OutputSink::InMemory(cursor.into_inner())),
            Storage::File(file) => Ok(OutputSink::FileBacked(file.into_temp_path())),
            Storage::Closed => Err(GatewayError::InvalidState("output taken after close")),
            Storage::Failed => Err(GatewayError::InvalidState("buffer abandoned")),
        }
    }

    fn rollover(&mut self) -> Result<(), GatewayError> {
        let cursor = match std::mem::replace(&mut self.storage, Storage::Failed) {
            Storage::Memory(cursor) => cursor,
            other => {
                self.storage = other;
                return Ok(());
            }
        };

        let position = cursor.position();
        let mut file = self.create_file()?;
        file.write_all(cursor.get_ref())?;
        file.seek(SeekFrom::Start(position))?;
        debug!(
            "Buffer rolled over to {} after {} bytes",
            file.path().display(),
            cursor.get_ref().len()
        );

        self.storage = Storage::File(file);
        Ok(())
    }

    fn create_file(&self) -> io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("docbridge-");
        match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
    }
}

impl std::fmt::Debug for TieredBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.storage {
            Storage::Memory(_) => "memory",
            Storage::File(_) => "file",
            Storage::Closed => "closed",
            Storage::Failed => "failed",
        };
        f.debug_struct("TieredBuffer")
            .field("state", &state)
            .field("size", &self.size)
            .field("threshold", &self.threshold)
            .field("path", &self.path())
            .finish()
    }
}

/// [`std::io::Write`] view over a [`TieredBuffer`].
pub struct BufferWriter<'a> {
    buffer: &'a mut TieredBuffer,
}

impl Write for BufferWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.write(buf).map_err(|e| match e {
            GatewayError::Storage(io) => io,
            other => io::Error::other(other.to_string()),
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.buffer.storage {
            Storage::File(file) => file.flush(),
            _ => Ok(()),
        }
    }
}

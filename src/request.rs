//! The unit of work submitted to the gate.
//!
//! A [`ConversionRequest`] is assembled by the HTTP boundary and is immutable
//! from then on: the builder methods consume it, and the only accessors hand
//! out shared references. It owns its input buffer, so dropping the request
//! (on success, failure, or an abandoned client) releases the buffer and
//! unlinks any file it spilled into.

use crate::buffer::TieredBuffer;
use crate::config::PageRange;
use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Artifact formats the engine can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Pdf,
    Png,
    Jpeg,
    Svg,
}

impl OutputFormat {
    /// File extension used for file-backed outputs and filter lookup.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Svg => "svg",
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            OutputFormat::Pdf => "application/pdf",
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Svg => "image/svg+xml",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(OutputFormat::Pdf),
            "png" => Ok(OutputFormat::Png),
            "jpg" | "jpeg" => Ok(OutputFormat::Jpeg),
            "svg" => Ok(OutputFormat::Svg),
            other => Err(GatewayError::BadRequest(format!(
                "Unsupported output format '{other}'"
            ))),
        }
    }
}

/// Document input: captured bytes, or a reference the engine opens itself.
#[derive(Debug)]
pub enum RequestInput {
    /// Body (or pre-fetched remote document) held in a tiered buffer.
    Buffer(TieredBuffer),
    /// A `file://` URL the engine can read directly.
    Reference(String),
}

/// Input to a conversion session.
#[derive(Debug)]
pub struct ConversionRequest {
    input: RequestInput,
    content_type: Option<String>,
    pages: Option<PageRange>,
    expected_output_size: Option<u64>,
    format: OutputFormat,
}

impl ConversionRequest {
    pub fn new(input: RequestInput) -> Self {
        Self {
            input,
            content_type: None,
            pages: None,
            expected_output_size: None,
            format: OutputFormat::default(),
        }
    }

    pub fn from_buffer(buffer: TieredBuffer) -> Self {
        Self::new(RequestInput::Buffer(buffer))
    }

    pub fn from_reference(url: impl Into<String>) -> Self {
        Self::new(RequestInput::Reference(url.into()))
    }

    /// Declared or sniffed MIME type. Parameters such as `charset` are kept
    /// verbatim; the filter lookup strips them.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn pages(mut self, pages: PageRange) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn expected_output_size(mut self, bytes: u64) -> Self {
        self.expected_output_size = Some(bytes);
        self
    }

    pub fn format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn input(&self) -> &RequestInput {
        &self.input
    }

    pub fn declared_content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn page_range(&self) -> Option<PageRange> {
        self.pages
    }

    pub fn target_format(&self) -> OutputFormat {
        self.format
    }

    /// Size hint used to pick the output sink: the caller's estimate when
    /// given, otherwise the size of the captured input.
    pub fn output_size_hint(&self) -> Option<u64> {
        self.expected_output_size.or(match &self.input {
            RequestInput::Buffer(buffer) => Some(buffer.len()),
            RequestInput::Reference(_) => None,
        })
    }
}

//! Engine filter selection.
//!
//! Import side: the request's content type is mapped to file extensions via
//! `mime_guess`, and the first extension with a known engine filter wins.
//! Unknown types load without a `FilterName` so the engine runs its own type
//! detection.
//!
//! Export side: the loaded document is asked which service it implements, in
//! a fixed order, and the matching `<family>_<format>_Export` filter is used.
//! Documents that match nothing are exported with the text-document filter.

use crate::bridge::{EngineDocument, PropertySet};
use crate::config::PageRange;
use crate::error::BridgeError;
use crate::request::OutputFormat;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tracing::debug;

// ── Import ───────────────────────────────────────────────────────────────

/// Engine import filter, with the option string some filters require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportFilter {
    pub name: &'static str,
    pub options: Option<&'static str>,
}

impl ImportFilter {
    const fn plain(name: &'static str) -> Self {
        Self {
            name,
            options: None,
        }
    }
}

static IMPORT_FILTERS: Lazy<HashMap<&'static str, ImportFilter>> = Lazy::new(|| {
    HashMap::from([
        ("doc", ImportFilter::plain("MS Word 97")),
        ("docx", ImportFilter::plain("MS Word 2007 XML")),
        ("odt", ImportFilter::plain("writer8")),
        ("rtf", ImportFilter::plain("Rich Text Format")),
        (
            "txt",
            ImportFilter {
                name: "Text (encoded)",
                options: Some("UTF8"),
            },
        ),
        ("html", ImportFilter::plain("HTML (StarWriter)")),
        ("htm", ImportFilter::plain("HTML (StarWriter)")),
        ("xls", ImportFilter::plain("MS Excel 97")),
        ("xlsx", ImportFilter::plain("Calc MS Excel 2007 XML")),
        ("ods", ImportFilter::plain("calc8")),
        ("csv", ImportFilter::plain("Text - txt - csv (StarCalc)")),
        ("ppt", ImportFilter::plain("MS PowerPoint 97")),
        ("pptx", ImportFilter::plain("Impress MS PowerPoint 2007 XML")),
        ("odp", ImportFilter::plain("impress8")),
        ("odg", ImportFilter::plain("draw8")),
        ("pdf", ImportFilter::plain("draw_pdf_import")),
    ])
});

/// Strip parameters (`; charset=…`) and normalise case.
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Look up the import filter for a MIME type.
pub fn import_filter(content_type: &str) -> Option<ImportFilter> {
    let essence = essence(content_type);
    let extensions = mime_guess::get_mime_extensions_str(&essence)?;
    extensions
        .iter()
        .find_map(|ext| IMPORT_FILTERS.get(ext).copied())
}

/// Guess a MIME type from the first bytes of a document.
///
/// Only formats with an unambiguous signature are recognised; ZIP-based
/// office formats are left to the engine's own detection.
pub fn sniff_content_type(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(b"%PDF") {
        return Some("application/pdf");
    }
    if head.starts_with(b"{\\rtf") {
        return Some("application/rtf");
    }

    let start = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(head.len());
    let prefix: Vec<u8> = head[start..]
        .iter()
        .take(14)
        .map(u8::to_ascii_lowercase)
        .collect();
    if prefix.starts_with(b"<!doctype html") || prefix.starts_with(b"<html") {
        return Some("text/html");
    }
    None
}

/// The content type to load with: the declared one unless it is missing or
/// generic, otherwise whatever the leading bytes reveal.
pub fn effective_content_type(declared: Option<&str>, head: &[u8]) -> Option<String> {
    match declared.map(essence) {
        Some(ct) if !ct.is_empty() && ct != "application/octet-stream" => {
            declared.map(str::to_string)
        }
        _ => sniff_content_type(head).map(str::to_string),
    }
}

/// Load-time properties for a document.
pub fn import_properties(filter: Option<ImportFilter>) -> PropertySet {
    let mut props = PropertySet::new()
        .with("Hidden", true)
        .with("MacroExecutionMode", 0i64)
        .with("ReadOnly", true)
        .with("Overwrite", true)
        .with("OpenNewView", true)
        .with("StartPresentation", false)
        .with("RepairPackage", false);
    if let Some(filter) = filter {
        props.push("FilterName", filter.name);
        if let Some(options) = filter.options {
            props.push("FilterOptions", options);
        }
    }
    props
}

// ── Export ───────────────────────────────────────────────────────────────

/// Engine document families, each with its own export filter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFamily {
    Text,
    Web,
    Presentation,
    Drawing,
    Spreadsheet,
}

/// Services checked on a loaded document, in order.
const SERVICES: [(&str, DocumentFamily); 5] = [
    ("com.sun.star.text.GenericTextDocument", DocumentFamily::Text),
    ("com.sun.star.text.WebDocument", DocumentFamily::Web),
    (
        "com.sun.star.presentation.PresentationDocument",
        DocumentFamily::Presentation,
    ),
    ("com.sun.star.drawing.DrawingDocument", DocumentFamily::Drawing),
    ("com.sun.star.sheet.SpreadsheetDocument", DocumentFamily::Spreadsheet),
];

impl DocumentFamily {
    fn prefix(self) -> &'static str {
        match self {
            DocumentFamily::Text => "writer",
            DocumentFamily::Web => "writer_web",
            DocumentFamily::Presentation => "impress",
            DocumentFamily::Drawing => "draw",
            DocumentFamily::Spreadsheet => "calc",
        }
    }

    /// Export filter name, e.g. `impress_pdf_Export`.
    pub fn export_filter(self, format: OutputFormat) -> String {
        format!("{}_{}_Export", self.prefix(), format.extension())
    }
}

/// Probe the document's services and return its family.
pub fn detect_family(document: &mut dyn EngineDocument) -> Result<DocumentFamily, BridgeError> {
    for (service, family) in SERVICES {
        if document.supports_service(service)? {
            return Ok(family);
        }
    }
    debug!("Document matches no known service, using text filters");
    Ok(DocumentFamily::Text)
}

/// Store-time properties for the chosen filter.
pub fn export_properties(
    filter: &str,
    format: OutputFormat,
    pages: Option<PageRange>,
) -> PropertySet {
    let mut props = PropertySet::new()
        .with("FilterName", filter)
        .with("Overwrite", true)
        .with("ReduceImageResolution", true)
        .with("MaxImageResolution", 300i64);
    if format == OutputFormat::Pdf {
        props.push("SelectPdfVersion", 1i64);
    }
    if let Some(range) = pages {
        props.push(
            "FilterData",
            PropertySet::new().with("PageRange", range.to_string()),
        );
    }
    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{PropertyValue, StoreTarget};

    struct ServiceDoc(&'static [&'static str]);

    impl EngineDocument for ServiceDoc {
        fn supports_service(&mut self, service: &str) -> Result<bool, BridgeError> {
            Ok(self.0.iter().any(|s| *s == service))
        }
        fn set_property(&mut self, _: &str, _: PropertyValue) -> Result<(), BridgeError> {
            Ok(())
        }
        fn refresh(&mut self) -> Result<(), BridgeError> {
            Ok(())
        }
        fn store(&mut self, _: StoreTarget<'_>, _: &PropertySet) -> Result<(), BridgeError> {
            Ok(())
        }
        fn dispose(&mut self) -> Result<(), BridgeError> {
            Ok(())
        }
        fn close(&mut self, _: bool) -> Result<(), BridgeError> {
            Ok(())
        }
    }

    #[test]
    fn import_filter_by_mime() {
        let docx = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
        assert_eq!(import_filter(docx).unwrap().name, "MS Word 2007 XML");
        assert_eq!(import_filter("application/pdf").unwrap().name, "draw_pdf_import");
        assert_eq!(
            import_filter("text/html; charset=utf-8").unwrap().name,
            "HTML (StarWriter)"
        );
    }

    #[test]
    fn plain_text_gets_utf8_options() {
        let filter = import_filter("Text/Plain; charset=UTF-8").unwrap();
        assert_eq!(filter.name, "Text (encoded)");
        assert_eq!(filter.options, Some("UTF8"));

        let props = import_properties(Some(filter));
        assert_eq!(props.get_str("FilterOptions"), Some("UTF8"));
        assert_eq!(props.get("Hidden"), Some(&PropertyValue::Bool(true)));
    }

    #[test]
    fn unknown_mime_leaves_detection_to_engine() {
        assert!(import_filter("application/x-made-up").is_none());
        assert!(import_filter("").is_none());
        assert!(import_properties(None).get("FilterName").is_none());
    }

    #[test]
    fn sniffing() {
        assert_eq!(sniff_content_type(b"%PDF-1.7\n"), Some("application/pdf"));
        assert_eq!(sniff_content_type(b"{\\rtf1\\ansi"), Some("application/rtf"));
        assert_eq!(sniff_content_type(b"\n  <!DOCTYPE HTML>"), Some("text/html"));
        assert_eq!(sniff_content_type(b"<html><body>"), Some("text/html"));
        assert_eq!(sniff_content_type(b"PK\x03\x04"), None);
        assert_eq!(sniff_content_type(b""), None);
    }

    #[test]
    fn declared_type_wins_unless_generic() {
        assert_eq!(
            effective_content_type(Some("text/plain"), b"%PDF").as_deref(),
            Some("text/plain")
        );
        assert_eq!(
            effective_content_type(Some("application/octet-stream"), b"%PDF").as_deref(),
            Some("application/pdf")
        );
        assert_eq!(effective_content_type(None, b"hello").as_deref(), None);
    }

    #[test]
    fn family_detection_order() {
        let mut presentation = ServiceDoc(&[
            "com.sun.star.presentation.PresentationDocument",
            "com.sun.star.drawing.DrawingDocument",
        ]);
        assert_eq!(
            detect_family(&mut presentation).unwrap(),
            DocumentFamily::Presentation
        );

        let mut sheet = ServiceDoc(&["com.sun.star.sheet.SpreadsheetDocument"]);
        let family = detect_family(&mut sheet).unwrap();
        assert_eq!(family.export_filter(OutputFormat::Pdf), "calc_pdf_Export");

        let mut unknown = ServiceDoc(&[]);
        let family = detect_family(&mut unknown).unwrap();
        assert_eq!(family.export_filter(OutputFormat::Png), "writer_png_Export");
    }

    #[test]
    fn export_properties_carry_page_range() {
        let pages = PageRange::new(2, 4).unwrap();
        let props = export_properties("writer_pdf_Export", OutputFormat::Pdf, Some(pages));
        assert_eq!(props.get("SelectPdfVersion"), Some(&PropertyValue::Int(1)));
        match props.get("FilterData") {
            Some(PropertyValue::Nested(data)) => assert_eq!(data.get_str("PageRange"), Some("2-4")),
            other => panic!("unexpected {other:?}"),
        }

        let props = export_properties("draw_svg_Export", OutputFormat::Svg, None);
        assert!(props.get("SelectPdfVersion").is_none());
        assert!(props.get("FilterData").is_none());
        assert_eq!(props.get("MaxImageResolution"), Some(&PropertyValue::Int(300)));
    }
}

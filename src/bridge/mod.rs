//! The engine seam.
//!
//! The rendering engine is an external process reached through a fixed local
//! bridge address. Everything the gateway needs from it fits in three traits:
//!
//! ```text
//! EngineConnector ──connect(address)──▶ EngineConnection ──load(source)──▶ EngineDocument
//!                                                                          ├ supports_service
//!                                                                          ├ store(target)
//!                                                                          └ dispose / close
//! ```
//!
//! The traits are object-safe so the process-scoped context can hold an
//! `Arc<dyn EngineConnector>`; tests plug in an in-process mock, production
//! uses [`socket::SocketBridge`]. All calls are blocking: sessions run on the
//! gate's dedicated worker threads, never on the async runtime.

pub mod socket;

use crate::config::DEFAULT_BRIDGE_ADDRESS;
use crate::error::{BridgeError, GatewayError};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::str::FromStr;

// ── Traits ───────────────────────────────────────────────────────────────

/// Opens sessions against the engine.
pub trait EngineConnector: Send + Sync {
    /// Connect to the engine listening on `address`.
    ///
    /// Must return [`BridgeError::Connect`] when nothing accepts the
    /// connection; that is the only error a session retries.
    fn connect(&self, address: &BridgeAddress) -> Result<Box<dyn EngineConnection>, BridgeError>;
}

/// One live connection to the engine.
pub trait EngineConnection: Send {
    /// Load a document, yielding an engine-side handle.
    fn load(
        &mut self,
        source: DocumentSource<'_>,
        props: &PropertySet,
    ) -> Result<Box<dyn EngineDocument + '_>, BridgeError>;
}

/// Engine-side handle to a loaded document.
///
/// A session disposes and closes every handle it obtains exactly once,
/// whatever happens in between.
pub trait EngineDocument {
    /// Whether the document implements the given engine service, e.g.
    /// `com.sun.star.presentation.PresentationDocument`.
    fn supports_service(&mut self, service: &str) -> Result<bool, BridgeError>;

    /// Set a document property. Engines may reject unknown names.
    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<(), BridgeError>;

    /// Re-layout the document before export.
    fn refresh(&mut self) -> Result<(), BridgeError>;

    /// Run the export filter named in `props` into `target`.
    fn store(&mut self, target: StoreTarget<'_>, props: &PropertySet) -> Result<(), BridgeError>;

    fn dispose(&mut self) -> Result<(), BridgeError>;

    fn close(&mut self, deliver_ownership: bool) -> Result<(), BridgeError>;
}

/// What the engine loads from.
#[derive(Debug, Clone, Copy)]
pub enum DocumentSource<'a> {
    /// In-memory bytes streamed over the bridge (`private:stream`).
    Stream(&'a [u8]),
    /// A URL the engine opens itself, typically `file:///…`.
    Url(&'a str),
}

/// Where the engine writes its output.
pub enum StoreTarget<'a> {
    /// Bytes streamed back over the bridge.
    Stream(&'a mut dyn Write),
    /// A URL the engine writes to directly.
    Url(&'a str),
}

impl fmt::Debug for StoreTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreTarget::Stream(_) => f.write_str("Stream(private:stream)"),
            StoreTarget::Url(url) => f.debug_tuple("Url").field(url).finish(),
        }
    }
}

// ── Properties ───────────────────────────────────────────────────────────

/// A property value as understood by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Nested(PropertySet),
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Str(v)
    }
}

impl From<PropertySet> for PropertyValue {
    fn from(v: PropertySet) -> Self {
        PropertyValue::Nested(v)
    }
}

/// A named property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Property {
    pub name: String,
    pub value: PropertyValue,
}

/// Ordered list of named properties (the engine's `PropertyValue[]`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PropertySet(Vec<Property>);

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: &str, value: impl Into<PropertyValue>) {
        self.0.push(Property {
            name: name.to_string(),
            value: value.into(),
        });
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.0.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(PropertyValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Address ──────────────────────────────────────────────────────────────

/// Bridge address descriptor, e.g.
/// `socket,host=localhost,port=2002,tcpNoDelay=1;urp;StarOffice.ComponentContext`.
///
/// Only `socket` connections are supported. The raw descriptor is kept
/// verbatim so the engine is launched with exactly what sessions dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeAddress {
    raw: String,
    host: String,
    port: u16,
    tcp_no_delay: bool,
    protocol: String,
    object: String,
}

impl BridgeAddress {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tcp_no_delay(&self) -> bool {
        self.tcp_no_delay
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Name of the initial object requested on connect.
    pub fn object_name(&self) -> &str {
        &self.object
    }

    /// `host:port`, suitable for `ToSocketAddrs`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Argument telling the engine to accept sessions on this address.
    pub fn accept_arg(&self) -> String {
        format!("--accept={}", self.raw)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Default for BridgeAddress {
    fn default() -> Self {
        Self {
            raw: DEFAULT_BRIDGE_ADDRESS.to_string(),
            host: "localhost".to_string(),
            port: 2002,
            tcp_no_delay: true,
            protocol: "urp".to_string(),
            object: "StarOffice.ComponentContext".to_string(),
        }
    }
}

impl fmt::Display for BridgeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for BridgeAddress {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| GatewayError::InvalidConfig(format!("bridge address '{s}': {why}"));

        let mut parts = s.trim().split(';');
        let connection = parts.next().unwrap_or_default();
        let protocol = parts.next().ok_or_else(|| invalid("missing protocol"))?;
        let object = parts.next().ok_or_else(|| invalid("missing object name"))?;
        if parts.next().is_some() {
            return Err(invalid("too many ';' separated parts"));
        }

        let mut params = connection.split(',');
        if params.next().map(str::trim) != Some("socket") {
            return Err(invalid("only socket connections are supported"));
        }

        let mut host = None;
        let mut port = None;
        let mut tcp_no_delay = false;
        for param in params {
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| invalid("connection parameters must be key=value"))?;
            match key.trim().to_ascii_lowercase().as_str() {
                "host" => host = Some(value.trim().to_string()),
                "port" => {
                    port = Some(
                        value
                            .trim()
                            .parse::<u16>()
                            .map_err(|_| invalid("port is not a number"))?,
                    )
                }
                "tcpnodelay" => tcp_no_delay = value.trim() == "1",
                _ => {}
            }
        }

        Ok(Self {
            raw: s.trim().to_string(),
            host: host.ok_or_else(|| invalid("missing host"))?,
            port: port.ok_or_else(|| invalid("missing port"))?,
            tcp_no_delay,
            protocol: protocol.trim().to_string(),
            object: object.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_address_matches_parsed() {
        let parsed: BridgeAddress = DEFAULT_BRIDGE_ADDRESS.parse().unwrap();
        assert_eq!(parsed, BridgeAddress::default());
        assert_eq!(parsed.socket_addr(), "localhost:2002");
        assert!(parsed.tcp_no_delay());
        assert_eq!(parsed.object_name(), "StarOffice.ComponentContext");
        assert_eq!(
            parsed.accept_arg(),
            format!("--accept={DEFAULT_BRIDGE_ADDRESS}")
        );
    }

    #[test]
    fn rejects_incomplete_addresses() {
        for bad in [
            "socket,host=localhost;urp;Ctx",
            "socket,port=2002;urp;Ctx",
            "pipe,name=x;urp;Ctx",
            "socket,host=localhost,port=2002",
            "socket,host=localhost,port=abc;urp;Ctx",
        ] {
            assert!(bad.parse::<BridgeAddress>().is_err(), "{bad}");
        }
    }

    #[test]
    fn property_set_lookup() {
        let props = PropertySet::new()
            .with("FilterName", "writer_pdf_Export")
            .with("Overwrite", true)
            .with("MaxImageResolution", 300i64)
            .with("FilterData", PropertySet::new().with("PageRange", "1-2"));
        assert_eq!(props.len(), 4);
        assert_eq!(props.get_str("FilterName"), Some("writer_pdf_Export"));
        assert_eq!(props.get("Overwrite"), Some(&PropertyValue::Bool(true)));
        match props.get("FilterData") {
            Some(PropertyValue::Nested(inner)) => {
                assert_eq!(inner.get_str("PageRange"), Some("1-2"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn property_set_serialises_as_list() {
        let props = PropertySet::new().with("Hidden", true);
        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json, serde_json::json!([{"name": "Hidden", "value": true}]));
    }
}

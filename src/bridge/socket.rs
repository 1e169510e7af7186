//! Socket client for the engine bridge.
//!
//! Each call is one framed request followed by one framed reply on the same
//! TCP connection:
//!
//! ```text
//! request: u32 header_len | JSON call  | u64 payload_len | payload
//! reply:   u32 header_len | JSON reply | payload (reply.payload bytes)
//! ```
//!
//! Payloads carry document bytes for `private:stream` loads and rendered
//! bytes for `private:stream` stores; everything else travels in the JSON
//! header. The client is blocking and is only ever driven from a gate worker
//! thread.
//!
//! This framing is not the engine's native `urp` protocol. The engine started
//! with `--accept=socket,...;urp;...` does not understand it directly: an
//! adapter process must listen on the bridge address, speak this framing to
//! the gateway and translate each call into the engine's own API. Deployments
//! without such an adapter plug their own [`EngineConnector`] in instead.

use super::{
    BridgeAddress, DocumentSource, EngineConnection, EngineConnector, EngineDocument,
    PropertySet, PropertyValue, StoreTarget,
};
use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace};

/// URL the engine uses for in-band streams.
const PRIVATE_STREAM: &str = "private:stream";

/// Upper bound on a JSON header; anything larger is a corrupt frame.
const MAX_HEADER_LEN: u32 = 1024 * 1024;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Call<'a> {
    Resolve {
        object: &'a str,
    },
    Load {
        url: &'a str,
        props: &'a PropertySet,
    },
    SupportsService {
        document: u64,
        service: &'a str,
    },
    SetProperty {
        document: u64,
        name: &'a str,
        value: &'a PropertyValue,
    },
    Refresh {
        document: u64,
    },
    Store {
        document: u64,
        url: &'a str,
        props: &'a PropertySet,
    },
    Dispose {
        document: u64,
    },
    Close {
        document: u64,
        deliver_ownership: bool,
    },
}

#[derive(Debug, Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    payload: u64,
}

/// Connects to the engine over TCP using the host and port of the bridge address.
#[derive(Debug, Clone)]
pub struct SocketBridge {
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
}

impl Default for SocketBridge {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: None,
        }
    }
}

impl SocketBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Read/write timeout on established connections. `None` (the default)
    /// lets a slow render run to completion.
    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    fn open(&self, address: &BridgeAddress) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in address.socket_addr().to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
        }))
    }
}

impl EngineConnector for SocketBridge {
    fn connect(&self, address: &BridgeAddress) -> Result<Box<dyn EngineConnection>, BridgeError> {
        let stream = self
            .open(address)
            .map_err(|e| BridgeError::Connect(format!("{}: {e}", address.socket_addr())))?;
        // The handshake is bounded by the connect timeout: a peer that does
        // not speak this framing (a bare `urp` listener) never answers it.
        stream
            .set_nodelay(address.tcp_no_delay())
            .and_then(|()| stream.set_read_timeout(Some(self.connect_timeout)))
            .and_then(|()| stream.set_write_timeout(Some(self.connect_timeout)))
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        let mut connection = SocketConnection { stream };
        // A listener that accepts but cannot resolve the context is an
        // engine still starting up; report it as a connect failure.
        connection
            .call(
                &Call::Resolve {
                    object: address.object_name(),
                },
                &[],
                None,
            )
            .map_err(|e| BridgeError::Connect(format!("bridge handshake failed: {e}")))?;
        connection
            .stream
            .set_read_timeout(self.io_timeout)
            .and_then(|()| connection.stream.set_write_timeout(self.io_timeout))
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        debug!("Bridge session opened on {}", address.socket_addr());

        Ok(Box::new(connection))
    }
}

struct SocketConnection {
    stream: TcpStream,
}

impl SocketConnection {
    fn call(
        &mut self,
        call: &Call<'_>,
        payload: &[u8],
        sink: Option<&mut dyn Write>,
    ) -> Result<serde_json::Value, BridgeError> {
        let header =
            serde_json::to_vec(call).map_err(|e| BridgeError::Protocol(e.to_string()))?;
        trace!("bridge call: {}", String::from_utf8_lossy(&header));

        self.stream.write_all(&(header.len() as u32).to_be_bytes())?;
        self.stream.write_all(&header)?;
        self.stream.write_all(&(payload.len() as u64).to_be_bytes())?;
        self.stream.write_all(payload)?;
        self.stream.flush()?;

        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len);
        if len > MAX_HEADER_LEN {
            return Err(BridgeError::Protocol(format!(
                "reply header of {len} bytes exceeds limit"
            )));
        }
        let mut header = vec![0u8; len as usize];
        self.stream.read_exact(&mut header)?;
        let reply: Reply =
            serde_json::from_slice(&header).map_err(|e| BridgeError::Protocol(e.to_string()))?;

        if reply.payload > 0 {
            let mut body = (&mut self.stream).take(reply.payload);
            let copied = match sink {
                Some(sink) => io::copy(&mut body, sink)?,
                None => io::copy(&mut body, &mut io::sink())?,
            };
            if copied != reply.payload {
                return Err(BridgeError::Protocol(format!(
                    "payload truncated: {copied} of {} bytes",
                    reply.payload
                )));
            }
        }

        if !reply.ok {
            return Err(BridgeError::Remote(
                reply.error.unwrap_or_else(|| "unspecified engine error".into()),
            ));
        }
        Ok(reply.result)
    }
}

impl EngineConnection for SocketConnection {
    fn load(
        &mut self,
        source: DocumentSource<'_>,
        props: &PropertySet,
    ) -> Result<Box<dyn EngineDocument + '_>, BridgeError> {
        let (url, payload) = match source {
            DocumentSource::Stream(bytes) => (PRIVATE_STREAM, bytes),
            DocumentSource::Url(url) => (url, &[][..]),
        };
        let result = self.call(&Call::Load { url, props }, payload, None)?;
        let id = result
            .get("document")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| BridgeError::Protocol("load reply carries no document id".into()))?;
        Ok(Box::new(SocketDocument {
            connection: self,
            id,
        }))
    }
}

struct SocketDocument<'a> {
    connection: &'a mut SocketConnection,
    id: u64,
}

impl EngineDocument for SocketDocument<'_> {
    fn supports_service(&mut self, service: &str) -> Result<bool, BridgeError> {
        let result = self.connection.call(
            &Call::SupportsService {
                document: self.id,
                service,
            },
            &[],
            None,
        )?;
        result
            .as_bool()
            .ok_or_else(|| BridgeError::Protocol("supports_service expects a bool".into()))
    }

    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<(), BridgeError> {
        self.connection
            .call(
                &Call::SetProperty {
                    document: self.id,
                    name,
                    value: &value,
                },
                &[],
                None,
            )
            .map(drop)
    }

    fn refresh(&mut self) -> Result<(), BridgeError> {
        self.connection
            .call(&Call::Refresh { document: self.id }, &[], None)
            .map(drop)
    }

    fn store(&mut self, target: StoreTarget<'_>, props: &PropertySet) -> Result<(), BridgeError> {
        let (url, sink) = match target {
            StoreTarget::Stream(sink) => (PRIVATE_STREAM, Some(sink)),
            StoreTarget::Url(url) => (url, None),
        };
        self.connection
            .call(
                &Call::Store {
                    document: self.id,
                    url,
                    props,
                },
                &[],
                sink,
            )
            .map(drop)
    }

    fn dispose(&mut self) -> Result<(), BridgeError> {
        self.connection
            .call(&Call::Dispose { document: self.id }, &[], None)
            .map(drop)
    }

    fn close(&mut self, deliver_ownership: bool) -> Result<(), BridgeError> {
        self.connection
            .call(
                &Call::Close {
                    document: self.id,
                    deliver_ownership,
                },
                &[],
                None,
            )
            .map(drop)
    }
}

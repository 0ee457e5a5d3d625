//! Transport seam and registry.
//!
//! A [`Transport`] turns a [`ConnectRequest`] into a connected byte stream,
//! reporting the outcome exactly once through a callback. Transports are
//! looked up by name in a [`TransportRegistry`] owned by the client.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::errors::ConnectError;

/// Any bidirectional async byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A connected transport stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Callback receiving the single outcome of a connect.
pub type TransportCallback = Box<dyn FnOnce(Result<BoxedStream, ConnectError>) + Send>;

/// Process-wide connection identifier. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Wrap a raw id; zero is not a valid connection.
    pub fn new(raw: u32) -> Option<Self> {
        (raw != 0).then_some(ConnectionId(raw))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters of one connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Local adapter address or name; default adapter when `None`
    pub source: Option<String>,
    /// Remote device address
    pub destination: String,
    /// Canonical 128-bit service UUID
    pub service_uuid: String,
    /// Known channel, or 0 to discover it
    pub channel: u8,
}

/// A transport able to produce connected streams.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Start a connect. On `Ok`, `on_result` will be invoked exactly once
    /// unless [`Transport::disconnect`] is called first. On `Err`, it is
    /// never invoked.
    fn connect(&self, request: ConnectRequest, on_result: TransportCallback) -> Result<ConnectionId, ConnectError>;

    /// Tear down a connection. Unknown ids are ignored.
    fn disconnect(&self, id: ConnectionId);
}

/// Registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("transport {0} already registered")]
    Duplicate(String),
}

/// Transports known to a client, by name.
#[derive(Default)]
pub struct TransportRegistry {
    transports: Mutex<HashMap<String, Arc<dyn Transport>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transport: Arc<dyn Transport>) -> Result<(), RegistryError> {
        let mut map = self.transports.lock().unwrap_or_else(PoisonError::into_inner);
        let name = transport.name().to_string();
        if map.contains_key(&name) {
            warn!(transport = %name, "transport already registered");
            return Err(RegistryError::Duplicate(name));
        }
        debug!(transport = %name, "transport registered");
        map.insert(name, transport);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Transport>> {
        let removed = self
            .transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed.is_some() {
            debug!(transport = %name, "transport unregistered");
        }
        removed
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Transport for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn connect(&self, _request: ConnectRequest, _on_result: TransportCallback) -> Result<ConnectionId, ConnectError> {
            Err(ConnectError::InvalidArgument("unused".into()))
        }

        fn disconnect(&self, _id: ConnectionId) {}
    }

    #[test]
    fn test_register_find_unregister() {
        let reg = TransportRegistry::new();
        reg.register(Arc::new(Named("Bluetooth"))).unwrap();
        assert!(reg.find("Bluetooth").is_some());
        assert!(reg.find("USB").is_none());

        assert_eq!(
            reg.register(Arc::new(Named("Bluetooth"))),
            Err(RegistryError::Duplicate("Bluetooth".into()))
        );

        assert!(reg.unregister("Bluetooth").is_some());
        assert!(reg.find("Bluetooth").is_none());
        assert!(reg.unregister("Bluetooth").is_none());
    }

    #[test]
    fn test_connection_id_is_never_zero() {
        assert!(ConnectionId::new(0).is_none());
        assert_eq!(ConnectionId::new(7).map(|id| id.get()), Some(7));
    }
}

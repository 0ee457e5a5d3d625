//! IPC seam: exported session objects, agent handles and name liveness.

use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::Agent;
use crate::errors::{BusError, SessionError};
use crate::session::WeakSession;

/// The message bus the client serves on.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Export `object` at `path`.
    async fn export_session(&self, path: &str, object: SessionObject) -> Result<(), BusError>;

    /// Remove the object exported at `path`. Must not block.
    fn retract_session(&self, path: &str);

    /// A handle to the agent served by `name` at `path`.
    fn agent(&self, name: &str, path: &str) -> Arc<dyn Agent>;

    /// Resolves once `name` has left the bus.
    async fn owner_vanished(&self, name: &str);
}

/// Properties reported by `GetProperties`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProperties {
    pub source: Option<String>,
    pub destination: String,
    pub channel: u8,
}

/// The externally addressable surface of one session.
///
/// Holds the session weakly so an exported object never keeps it alive.
#[derive(Clone)]
pub struct SessionObject {
    session: WeakSession,
}

impl SessionObject {
    pub(crate) fn new(session: WeakSession) -> Self {
        Self { session }
    }

    pub fn properties(&self) -> Result<SessionProperties, SessionError> {
        let s = self.session.upgrade().ok_or(SessionError::Gone)?;
        Ok(SessionProperties {
            source: s.source().map(str::to_string),
            destination: s.destination().to_string(),
            channel: s.channel(),
        })
    }

    /// `AssignAgent`: bind the caller's agent at `path`.
    pub fn assign_agent(&self, sender: &str, path: &str) -> Result<(), SessionError> {
        if path.is_empty() {
            return Err(SessionError::InvalidArguments);
        }
        let s = self.session.upgrade().ok_or(SessionError::Gone)?;
        s.set_agent(sender, path)
    }

    /// `ReleaseAgent`: unbind the caller's agent at `path`.
    pub fn release_agent(&self, sender: &str, path: &str) -> Result<(), SessionError> {
        if path.is_empty() {
            return Err(SessionError::InvalidArguments);
        }
        let s = self.session.upgrade().ok_or(SessionError::Gone)?;
        s.release_agent(sender, path)
    }
}

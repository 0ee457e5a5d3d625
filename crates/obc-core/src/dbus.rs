//! D-Bus collaborators.
//!
//! - [`DbusBus`] exports `org.openobex.Session` objects, talks to
//!   `org.openobex.Agent` endpoints and watches bus names through
//!   `NameOwnerChanged`.
//! - [`BluezAdapters`] drives the BlueZ adapter manager on the system bus.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::runtime::Handle;
use tracing::{debug, warn};
use zbus::message::Header;
use zbus::names::BusName;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, Value};
use zbus::{fdo, interface, Connection};

use crate::adapter::{AdapterError, AdapterManager};
use crate::agent::Agent;
use crate::bus::{Bus, SessionObject};
use crate::errors::{AgentError, BusError, SessionError};

pub const SESSION_INTERFACE: &str = "org.openobex.Session";
pub const AGENT_INTERFACE: &str = "org.openobex.Agent";

const BLUEZ_SERVICE: &str = "org.bluez";
const BLUEZ_MANAGER_INTERFACE: &str = "org.bluez.Manager";
const BLUEZ_ADAPTER_INTERFACE: &str = "org.bluez.Adapter";

// ============================================================================
// Errors
// ============================================================================

/// Errors returned to D-Bus callers.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.openobex.Error")]
pub enum ClientDbusError {
    #[zbus(error)]
    ZBus(zbus::Error),
    InvalidArguments(String),
    AlreadyExists(String),
    NotAuthorized(String),
    Failed(String),
}

impl From<SessionError> for ClientDbusError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidArguments => ClientDbusError::InvalidArguments("Invalid arguments in method call".into()),
            SessionError::AlreadyExists => ClientDbusError::AlreadyExists("Another agent already assigned".into()),
            SessionError::NotAuthorized => ClientDbusError::NotAuthorized("Not Authorized".into()),
            other => ClientDbusError::Failed(other.to_string()),
        }
    }
}

fn agent_error(e: zbus::Error) -> AgentError {
    match e {
        zbus::Error::MethodError(name, message, _) => AgentError::Replied {
            name: name.to_string(),
            message: message.unwrap_or_default(),
        },
        other => AgentError::Unreachable(other.to_string()),
    }
}

// ============================================================================
// Session objects
// ============================================================================

struct SessionInterface {
    object: SessionObject,
}

#[interface(name = "org.openobex.Session")]
impl SessionInterface {
    async fn get_properties(&self) -> Result<HashMap<String, Value<'static>>, ClientDbusError> {
        let props = self.object.properties()?;
        let mut dict = HashMap::new();
        if let Some(src) = props.source {
            dict.insert("Source".to_string(), Value::from(src));
        }
        dict.insert("Destination".to_string(), Value::from(props.destination));
        dict.insert("Channel".to_string(), Value::from(props.channel));
        Ok(dict)
    }

    async fn assign_agent(&self, #[zbus(header)] header: Header<'_>, agent: ObjectPath<'_>) -> Result<(), ClientDbusError> {
        let sender = header.sender().map(|s| s.to_string()).unwrap_or_default();
        self.object.assign_agent(&sender, agent.as_str())?;
        Ok(())
    }

    async fn release_agent(&self, #[zbus(header)] header: Header<'_>, agent: ObjectPath<'_>) -> Result<(), ClientDbusError> {
        let sender = header.sender().map(|s| s.to_string()).unwrap_or_default();
        self.object.release_agent(&sender, agent.as_str())?;
        Ok(())
    }
}

/// The client's bus.
#[derive(Clone)]
pub struct DbusBus {
    conn: Connection,
}

impl DbusBus {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn session() -> zbus::Result<Self> {
        Ok(Self::new(Connection::session().await?))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[async_trait]
impl Bus for DbusBus {
    async fn export_session(&self, path: &str, object: SessionObject) -> Result<(), BusError> {
        let added = self
            .conn
            .object_server()
            .at(path, SessionInterface { object })
            .await
            .map_err(|e| BusError::Export(e.to_string()))?;
        if !added {
            return Err(BusError::AlreadyExported(path.to_string()));
        }
        debug!(path = %path, interface = SESSION_INTERFACE, "session object exported");
        Ok(())
    }

    fn retract_session(&self, path: &str) {
        let conn = self.conn.clone();
        let path = path.to_string();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.object_server().remove::<SessionInterface, _>(path.as_str()).await {
                        debug!(path = %path, error = %e, "session object already gone");
                    }
                });
            }
            Err(_) => warn!(path = %path, "no runtime to retract session object"),
        }
    }

    fn agent(&self, name: &str, path: &str) -> Arc<dyn Agent> {
        Arc::new(DbusAgent {
            conn: self.conn.clone(),
            name: name.to_string(),
            path: path.to_string(),
        })
    }

    async fn owner_vanished(&self, name: &str) {
        if let Err(e) = watch_name(&self.conn, name).await {
            // Without a watch the owner is treated as present forever.
            warn!(name = %name, error = %e, "cannot watch bus name");
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves once `name` has no owner.
async fn watch_name(conn: &Connection, name: &str) -> zbus::Result<()> {
    let proxy = fdo::DBusProxy::new(conn).await?;
    let mut changes = proxy.receive_name_owner_changed_with_args(&[(0, name)]).await?;

    let bus_name = BusName::try_from(name)?;
    if !proxy.name_has_owner(bus_name).await? {
        debug!(name = %name, "name already gone");
        return Ok(());
    }

    while let Some(signal) = changes.next().await {
        let args = signal.args()?;
        if args.new_owner().is_none() {
            debug!(name = %name, "name lost its owner");
            return Ok(());
        }
    }
    Err(zbus::Error::Failure("NameOwnerChanged stream ended".into()))
}

// ============================================================================
// Agents
// ============================================================================

/// An `org.openobex.Agent` endpoint.
struct DbusAgent {
    conn: Connection,
    name: String,
    path: String,
}

impl DbusAgent {
    async fn call<B>(&self, method: &str, body: &B) -> zbus::Result<zbus::Message>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType + Sync,
    {
        self.conn
            .call_method(Some(self.name.as_str()), self.path.as_str(), Some(AGENT_INTERFACE), method, body)
            .await
    }

    async fn notify<B>(&self, method: &str, body: &B)
    where
        B: serde::Serialize + zbus::zvariant::DynamicType + Sync,
    {
        if let Err(e) = self.call(method, body).await {
            debug!(agent = %self.name, method, error = %e, "agent notification failed");
        }
    }
}

fn transfer_path(transfer: &str) -> Result<ObjectPath<'_>, AgentError> {
    ObjectPath::try_from(transfer).map_err(|e| AgentError::Unreachable(e.to_string()))
}

#[async_trait]
impl Agent for DbusAgent {
    async fn request(&self, transfer: &str) -> Result<String, AgentError> {
        let reply = self
            .call("Request", &(transfer_path(transfer)?,))
            .await
            .map_err(agent_error)?;
        reply
            .body()
            .deserialize::<String>()
            .map_err(|e| AgentError::Unreachable(e.to_string()))
    }

    async fn progress(&self, transfer: &str, transferred: u64) {
        if let Ok(path) = transfer_path(transfer) {
            self.notify("Progress", &(path, transferred)).await;
        }
    }

    async fn complete(&self, transfer: &str) {
        if let Ok(path) = transfer_path(transfer) {
            self.notify("Complete", &(path,)).await;
        }
    }

    async fn error(&self, transfer: &str, message: &str) {
        if let Ok(path) = transfer_path(transfer) {
            self.notify("Error", &(path, message)).await;
        }
    }

    async fn release(&self) {
        self.notify("Release", &()).await;
    }
}

// ============================================================================
// BlueZ adapter manager
// ============================================================================

/// BlueZ `org.bluez.Manager` / `org.bluez.Adapter` client.
#[derive(Clone)]
pub struct BluezAdapters {
    conn: Connection,
}

impl BluezAdapters {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn system() -> zbus::Result<Self> {
        Ok(Self::new(Connection::system().await?))
    }

    async fn manager_call<B>(&self, method: &str, body: &B) -> Result<String, AdapterError>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType + Sync,
    {
        let reply = self
            .conn
            .call_method(Some(BLUEZ_SERVICE), "/", Some(BLUEZ_MANAGER_INTERFACE), method, body)
            .await
            .map_err(|e| match e {
                zbus::Error::MethodError(name, msg, _) => {
                    AdapterError::NotFound(format!("{name}: {}", msg.unwrap_or_default()))
                }
                other => AdapterError::Unavailable(other.to_string()),
            })?;
        let path: OwnedObjectPath = reply
            .body()
            .deserialize()
            .map_err(|e| AdapterError::Unavailable(e.to_string()))?;
        Ok(path.to_string())
    }
}

#[async_trait]
impl AdapterManager for BluezAdapters {
    async fn default_adapter(&self) -> Result<String, AdapterError> {
        self.manager_call("DefaultAdapter", &()).await
    }

    async fn find_adapter(&self, name: &str) -> Result<String, AdapterError> {
        self.manager_call("FindAdapter", &(name,)).await
    }

    async fn request_session(&self, adapter: &str) -> Result<(), AdapterError> {
        self.conn
            .call_method(Some(BLUEZ_SERVICE), adapter, Some(BLUEZ_ADAPTER_INTERFACE), "RequestSession", &())
            .await
            .map_err(|e| AdapterError::Refused(e.to_string()))?;
        Ok(())
    }

    async fn release_session(&self, adapter: &str) {
        if let Err(e) = self
            .conn
            .call_method(Some(BLUEZ_SERVICE), adapter, Some(BLUEZ_ADAPTER_INTERFACE), "ReleaseSession", &())
            .await
        {
            warn!(adapter = %adapter, error = %e, "ReleaseSession failed");
        }
    }
}

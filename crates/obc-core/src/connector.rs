//! Bluetooth transport connector.
//!
//! Each connect runs as one task through the chain
//! adapter lookup → session lease → (known channel | SDP search) → RFCOMM,
//! tracked in a per-transport table keyed by [`ConnectionId`] so it can be
//! torn down by id at any stage.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::adapter::AdapterManager;
use crate::errors::ConnectError;
use crate::sdp::{self, SdpClient};
use crate::transport::{BoxedStream, ConnectRequest, ConnectionId, Transport, TransportCallback};
use crate::types::{BdAddr, Uuid128};

/// Name under which the Bluetooth transport registers.
pub const BLUETOOTH_TRANSPORT: &str = "Bluetooth";

// ============================================================================
// RFCOMM seam
// ============================================================================

/// Link security required for the RFCOMM connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Opens RFCOMM streams.
#[async_trait]
pub trait RfcommConnector: Send + Sync {
    async fn connect(&self, src: BdAddr, dst: BdAddr, channel: u8, security: SecurityLevel) -> io::Result<BoxedStream>;
}

// ============================================================================
// Connection table
// ============================================================================

/// Where a connection is in its connect chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    AdapterLookup,
    SessionRequest,
    ServiceSearch,
    Rfcomm { channel: u8 },
    Connected,
}

struct Record {
    stage: ConnectStage,
    /// Adapter whose session lease must be released on teardown.
    lease: Option<String>,
    task: Option<AbortHandle>,
}

/// Connector settings.
#[derive(Debug, Clone, Default)]
pub struct ConnectorConfig {
    pub security: SecurityLevel,
    /// Overall deadline for the chain; unbounded when `None`.
    pub timeout: Option<Duration>,
}

struct Inner {
    adapters: Arc<dyn AdapterManager>,
    sdp: Arc<dyn SdpClient>,
    rfcomm: Arc<dyn RfcommConnector>,
    config: ConnectorConfig,
    next_id: AtomicU32,
    conns: Mutex<HashMap<ConnectionId, Record>>,
}

/// What one connect needs after argument validation.
struct Plan {
    id: ConnectionId,
    adapter_name: Option<String>,
    src: BdAddr,
    dst: BdAddr,
    channel: u8,
    uuid: Option<Uuid128>,
}

/// Bluetooth RFCOMM transport.
#[derive(Clone)]
pub struct BluetoothTransport {
    inner: Arc<Inner>,
}

impl BluetoothTransport {
    pub fn new(
        adapters: Arc<dyn AdapterManager>,
        sdp: Arc<dyn SdpClient>,
        rfcomm: Arc<dyn RfcommConnector>,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapters,
                sdp,
                rfcomm,
                config,
                next_id: AtomicU32::new(1),
                conns: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Current stage of a connection, if it is still tracked.
    pub fn stage(&self, id: ConnectionId) -> Option<ConnectStage> {
        self.inner.lock().get(&id).map(|r| r.stage)
    }

    /// Number of tracked connections.
    pub fn active_connections(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Record>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_id(&self) -> ConnectionId {
        loop {
            if let Some(id) = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed)) {
                return id;
            }
        }
    }

    /// Update a tracked record; `Cancelled` if it was torn down meanwhile.
    fn update(&self, id: ConnectionId, f: impl FnOnce(&mut Record)) -> Result<(), ConnectError> {
        match self.lock().get_mut(&id) {
            Some(rec) => {
                f(rec);
                Ok(())
            }
            None => Err(ConnectError::Cancelled),
        }
    }

    /// Forget a connection and release its lease. Returns the task handle.
    fn teardown(&self, id: ConnectionId) -> Option<AbortHandle> {
        let rec = self.lock().remove(&id)?;
        if let Some(adapter) = rec.lease {
            let adapters = self.adapters.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    debug!(id = %id, adapter = %adapter, "releasing adapter session");
                    handle.spawn(async move { adapters.release_session(&adapter).await });
                }
                Err(_) => warn!(id = %id, adapter = %adapter, "no runtime to release adapter session"),
            }
        }
        rec.task
    }

    async fn run(&self, plan: &Plan) -> Result<BoxedStream, ConnectError> {
        let id = plan.id;

        let adapter = match &plan.adapter_name {
            None => self.adapters.default_adapter().await,
            Some(name) => self.adapters.find_adapter(name).await,
        }
        .map_err(|e| {
            debug!(id = %id, error = %e, "adapter lookup failed");
            ConnectError::NoAdapter
        })?;

        self.update(id, |r| {
            r.lease = Some(adapter.clone());
            r.stage = ConnectStage::SessionRequest;
        })?;

        self.adapters.request_session(&adapter).await.map_err(|e| {
            debug!(id = %id, error = %e, "session request failed");
            ConnectError::SessionRequest
        })?;

        let channel = match (plan.channel, plan.uuid) {
            (0, Some(uuid)) => {
                self.update(id, |r| r.stage = ConnectStage::ServiceSearch)?;
                self.resolve_channel(plan.src, plan.dst, &uuid).await?
            }
            (0, None) => return Err(ConnectError::InvalidArgument("no channel and no service".into())),
            (ch, _) => ch,
        };

        self.update(id, |r| r.stage = ConnectStage::Rfcomm { channel })?;
        debug!(id = %id, channel, "connecting rfcomm");

        self.rfcomm
            .connect(plan.src, plan.dst, channel, self.config.security)
            .await
            .map_err(|e| ConnectError::Rfcomm(e.to_string()))
    }

    async fn resolve_channel(&self, src: BdAddr, dst: BdAddr, uuid: &Uuid128) -> Result<u8, ConnectError> {
        let not_found = |e: crate::errors::SdpError| {
            debug!(dst = %dst, error = %e, "service search failed");
            ConnectError::ServiceNotFound
        };

        let mut chan = self.sdp.connect(src, dst).await.map_err(not_found)?;
        let lists = sdp::service_search_attr(chan.as_mut(), uuid).await;
        // The SDP session closes before RFCOMM is attempted.
        drop(chan);

        let channel = sdp::first_rfcomm_channel(&lists.map_err(not_found)?).map_err(not_found)?;
        debug!(dst = %dst, uuid = %uuid, channel, "service resolved");
        Ok(channel)
    }
}

impl Transport for BluetoothTransport {
    fn name(&self) -> &str {
        BLUETOOTH_TRANSPORT
    }

    fn connect(&self, request: ConnectRequest, on_result: TransportCallback) -> Result<ConnectionId, ConnectError> {
        let dst: BdAddr = request
            .destination
            .parse()
            .map_err(|e: crate::types::ParseError| ConnectError::InvalidArgument(e.to_string()))?;

        // A source that is not an address still selects the adapter by name.
        let src = request
            .source
            .as_deref()
            .and_then(|s| s.parse::<BdAddr>().ok())
            .unwrap_or(BdAddr::ANY);

        let uuid = if request.channel == 0 {
            let parsed = request
                .service_uuid
                .parse::<Uuid128>()
                .map_err(|e| ConnectError::InvalidArgument(e.to_string()))?;
            Some(parsed)
        } else {
            None
        };

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| ConnectError::InvalidArgument(format!("no async runtime: {e}")))?;

        let id = self.inner.allocate_id();
        self.inner.lock().insert(
            id,
            Record {
                stage: ConnectStage::AdapterLookup,
                lease: None,
                task: None,
            },
        );

        let plan = Plan {
            id,
            adapter_name: request.source.clone(),
            src,
            dst,
            channel: request.channel,
            uuid,
        };
        info!(id = %id, dst = %dst, channel = request.channel, "bluetooth connect started");

        let inner = self.inner.clone();
        let task = handle.spawn(async move {
            let outcome = match inner.config.timeout {
                Some(limit) => tokio::time::timeout(limit, inner.run(&plan))
                    .await
                    .unwrap_or(Err(ConnectError::Timeout)),
                None => inner.run(&plan).await,
            };

            match outcome {
                Ok(stream) => {
                    if inner.update(id, |r| r.stage = ConnectStage::Connected).is_err() {
                        debug!(id = %id, "connected after disconnect, dropping stream");
                        return;
                    }
                    info!(id = %id, "bluetooth connected");
                    on_result(Ok(stream));
                }
                Err(ConnectError::Cancelled) if inner.lock().get(&id).is_none() => {
                    debug!(id = %id, "connect abandoned");
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "bluetooth connect failed");
                    on_result(Err(e));
                    inner.teardown(id);
                }
            }
        });

        if let Some(rec) = self.inner.lock().get_mut(&id) {
            rec.task = Some(task.abort_handle());
        }
        Ok(id)
    }

    fn disconnect(&self, id: ConnectionId) {
        if let Some(task) = self.inner.teardown(id) {
            debug!(id = %id, "bluetooth disconnect");
            task.abort();
        }
    }
}

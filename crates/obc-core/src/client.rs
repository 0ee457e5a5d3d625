//! Session registry.
//!
//! [`ObexClient`] owns everything sessions share: configuration, the
//! transport and driver registries, the OBEX engine, the transfer factory
//! and the bus. Live sessions are tracked weakly so the registry never
//! keeps one alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::config::ClientConfig;
use crate::driver::{Driver, DriverRegistry};
use crate::errors::SessionError;
use crate::obex::ObexEngine;
use crate::session::{ConnectCallback, Session, SessionParams, SessionPhase, WeakSession};
use crate::transfer::TransferFactory;
use crate::transport::TransportRegistry;

/// State shared by the client and all of its sessions.
pub struct ClientContext {
    pub(crate) config: ClientConfig,
    pub(crate) transports: TransportRegistry,
    pub(crate) drivers: DriverRegistry,
    pub(crate) engine: Arc<dyn ObexEngine>,
    pub(crate) transfers: Arc<dyn TransferFactory>,
    pub(crate) bus: Arc<dyn Bus>,
    sessions: Mutex<Vec<WeakSession>>,
    path_counter: AtomicU64,
    serial: AtomicU64,
}

impl ClientContext {
    fn sessions(&self) -> MutexGuard<'_, Vec<WeakSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next `session<N>` index for exported objects.
    pub(crate) fn next_path_index(&self) -> u64 {
        self.path_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn forget_session(&self, session: &Session) {
        self.sessions().retain(|w| w.is_alive() && !w.refers_to(session));
    }

    pub(crate) fn prune_sessions(&self) {
        self.sessions().retain(WeakSession::is_alive);
    }

    /// Strong handles to every registered session. The registry lock is
    /// released before the caller can drop them.
    fn live_sessions(&self) -> Vec<Session> {
        let weak: Vec<WeakSession> = self.sessions().clone();
        weak.iter().filter_map(WeakSession::upgrade).collect()
    }
}

/// Parameters of a session request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    /// Local adapter address or name
    pub source: Option<String>,
    pub destination: String,
    /// Service name or UUID
    pub service: String,
    /// RFCOMM channel; 0 discovers it through SDP
    pub channel: u8,
    /// Bus name whose departure shuts the session down
    pub owner: Option<String>,
}

impl SessionRequest {
    pub fn new(destination: &str, service: &str) -> Self {
        Self {
            destination: destination.to_string(),
            service: service.to_string(),
            ..Default::default()
        }
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    fn matches(&self, session: &Session) -> bool {
        if session.phase() == SessionPhase::ShuttingDown {
            return false;
        }
        if session.destination() != self.destination {
            return false;
        }
        if !session.driver().matches(&self.service) {
            return false;
        }
        if let Some(src) = &self.source {
            if session.source() != Some(src.as_str()) {
                return false;
            }
        }
        if self.channel != 0 && session.channel() != self.channel {
            return false;
        }
        session.owner() == self.owner
    }
}

/// The OBEX client.
#[derive(Clone)]
pub struct ObexClient {
    ctx: Arc<ClientContext>,
}

impl ObexClient {
    pub fn new(
        config: ClientConfig,
        drivers: DriverRegistry,
        engine: Arc<dyn ObexEngine>,
        transfers: Arc<dyn TransferFactory>,
        bus: Arc<dyn Bus>,
    ) -> Self {
        Self {
            ctx: Arc::new(ClientContext {
                config,
                transports: TransportRegistry::new(),
                drivers,
                engine,
                transfers,
                bus,
                sessions: Mutex::new(Vec::new()),
                path_counter: AtomicU64::new(0),
                serial: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.ctx.config
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.ctx.transports
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.ctx.drivers
    }

    /// Live sessions, in creation order.
    pub fn sessions(&self) -> Vec<Session> {
        self.ctx.live_sessions()
    }

    /// Create a session, or reuse a live one with the same source,
    /// destination, service, channel and owner, and start connecting it.
    ///
    /// `on_connect` fires once with the connect outcome. On a reused
    /// session that is still connecting it is dropped instead.
    pub fn create_session(
        &self,
        request: SessionRequest,
        on_connect: Option<ConnectCallback>,
    ) -> Result<Session, SessionError> {
        if request.destination.is_empty() {
            return Err(SessionError::InvalidArguments);
        }

        let existing = self.ctx.live_sessions().into_iter().find(|s| request.matches(s));
        if let Some(session) = existing {
            debug!(session = session.serial(), dst = %request.destination, "reusing session");
            session.connect(on_connect)?;
            return Ok(session);
        }

        let transport = self
            .ctx
            .transports
            .find(&self.ctx.config.transport)
            .ok_or_else(|| SessionError::NoTransport(self.ctx.config.transport.clone()))?;
        let driver = self.ctx.drivers.find(&request.service).ok_or_else(|| {
            warn!(service = %request.service, "no driver for service");
            SessionError::UnknownService(request.service.clone())
        })?;
        let runtime = Handle::try_current().map_err(|e| {
            warn!(error = %e, "no async runtime for session");
            SessionError::Io
        })?;

        let session = Session::new(
            self.ctx.clone(),
            runtime,
            SessionParams {
                serial: self.ctx.serial.fetch_add(1, Ordering::Relaxed),
                source: request.source.clone(),
                destination: request.destination.clone(),
                channel: request.channel,
                driver,
                transport,
            },
        );
        if let Some(owner) = &request.owner {
            session.set_owner(owner);
        }
        self.ctx.sessions().push(session.downgrade());

        if let Err(e) = session.connect(on_connect) {
            warn!(session = session.serial(), error = %e, "session connect failed to start");
            self.ctx.forget_session(&session);
            return Err(e);
        }

        info!(
            session = session.serial(),
            dst = %request.destination,
            service = session.service(),
            channel = request.channel,
            "session created"
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConnectError;
    use crate::harness::{settle, ConnectProbe, FakeRfcomm, TestClient};

    #[tokio::test]
    async fn test_missing_destination() {
        let tc = TestClient::new();
        let err = tc.client.create_session(SessionRequest::new("", "OPP"), None).unwrap_err();
        assert_eq!(err, SessionError::InvalidArguments);
        assert_eq!(err.errno(), -22);
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let tc = TestClient::new();
        let err = tc.create("HFP", 0, None).unwrap_err();
        assert_eq!(err, SessionError::UnknownService("HFP".into()));
        assert!(tc.client.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_missing_transport() {
        let tc = TestClient::builder().without_transport().build();
        let err = tc.create("OPP", 9, None).unwrap_err();
        assert_eq!(err, SessionError::NoTransport("Bluetooth".into()));
    }

    #[tokio::test]
    async fn test_synchronous_transport_failure() {
        let tc = TestClient::new();
        let err = tc
            .client
            .create_session(SessionRequest::new("not-an-address", "OPP").channel(9), None)
            .unwrap_err();
        assert!(matches!(err, SessionError::Connect(ConnectError::InvalidArgument(_))));
        assert!(tc.client.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_same_tuple_reuses_session() {
        let tc = TestClient::new();
        let a = tc.connected("OPP", 9).await;
        let b = tc.connected("opp", 9).await;
        assert!(a.ptr_eq(&b));
        assert_eq!(a.ref_count(), 2);
        assert_eq!(tc.rfcomm.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_reuse_matches_discovered_channel_request() {
        let tc = TestClient::new();
        let a = tc.connected("OPP", 9).await;
        // Channel 0 means "any".
        let b = tc.connected("OPP", 0).await;
        assert!(a.ptr_eq(&b));
    }

    #[tokio::test]
    async fn test_differing_tuples_get_new_sessions() {
        let tc = TestClient::new();
        let a = tc.connected("OPP", 9).await;
        let b = tc.connected("FTP", 9).await;
        let c = tc.connected("OPP", 10).await;
        assert!(!a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));

        let probe = ConnectProbe::new();
        let d = tc
            .client
            .create_session(tc.request("OPP", 9).owner(":1.3"), Some(probe.callback()))
            .unwrap();
        probe.wait().await;
        assert!(!a.ptr_eq(&d));
        assert_eq!(tc.client.sessions().len(), 4);
    }

    #[tokio::test]
    async fn test_reuse_while_connecting_drops_second_callback() {
        let tc = TestClient::builder().with_rfcomm(FakeRfcomm::new().hanging()).build();
        let first = ConnectProbe::new();
        let second = ConnectProbe::new();

        let a = tc.create("OPP", 9, Some(first.callback())).unwrap();
        let b = tc.create("OPP", 9, Some(second.callback())).unwrap();
        settle().await;

        assert!(a.ptr_eq(&b));
        assert!(first.results().is_empty());
        assert!(second.dropped());
        assert!(!first.dropped());
    }

    #[tokio::test]
    async fn test_shut_down_sessions_are_not_reused() {
        let tc = TestClient::new();
        let a = tc.connected("OPP", 9).await;
        a.shutdown();
        let b = tc.connected("OPP", 9).await;
        assert!(!a.ptr_eq(&b));
        assert_eq!(tc.client.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_sessions_leave_registry() {
        let tc = TestClient::new();
        let a = tc.connected("OPP", 9).await;
        assert_eq!(tc.client.sessions().len(), 1);
        drop(a);
        settle().await;
        assert!(tc.client.sessions().is_empty());
    }
}

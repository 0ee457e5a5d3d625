//! OBEX session state machine.
//!
//! A [`Session`] is a shared handle to one logical OBEX connection. Cloning
//! a handle takes a reference and dropping it releases one; the last drop
//! runs the destructor contract (agent released, watches and pending
//! requests aborted, transport disconnected, exported object retracted).
//!
//! All asynchronous completions (transport ready, OBEX CONNECT, agent
//! replies, transfer progress, owner loss) are posted to a private event
//! loop and handled one at a time. The state mutex is never held while a
//! callback or collaborator runs.
//!
//! # Transfer queue
//!
//! Transfers wait in a FIFO queue whose head is the only one that may be
//! authorizing or running. Each queued transfer holds a session reference.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::agent::AgentBinding;
use crate::bus::SessionObject;
use crate::client::ClientContext;
use crate::driver::Driver;
use crate::errors::{AgentError, ConnectError, ObexError, SessionError, TransferError};
use crate::obex::ObexLink;
use crate::transfer::{ProgressReporter, Transfer, TransferProgress, TransferSpec};
use crate::transport::{BoxedStream, ConnectRequest, ConnectionId, Transport};

/// Receives the single outcome of a session connect.
pub type ConnectCallback = Box<dyn FnOnce(&Session, Result<(), ConnectError>) + Send>;

/// Stored per-session completion callback, invoked whenever a transfer
/// leaves the queue.
pub type TransferCallback = Arc<dyn Fn(&Session, Result<(), TransferError>) + Send + Sync>;

// ============================================================================
// State
// ============================================================================

/// Connection phase. A destroyed session has no phase: it is deallocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Connected,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Get,
    Pull,
    Put,
    Send,
}

impl TransferKind {
    fn receives(self) -> bool {
        matches!(self, TransferKind::Get | TransferKind::Pull)
    }
}

/// Where a queued transfer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    /// Waiting behind the head
    Queued,
    /// Head of the queue, waiting for the agent
    Authorizing,
    /// Head of the queue, started
    Active,
}

/// Identifies a transfer within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct PendingTransfer {
    id: TransferId,
    kind: TransferKind,
    stage: TransferStage,
    transfer: Arc<dyn Transfer>,
    _hold: Session,
}

struct ConnectWaiter {
    callback: ConnectCallback,
    _hold: Session,
}

enum Event {
    TransportReady(Result<BoxedStream, ConnectError>),
    ObexConnected(Result<ObexLink, ObexError>),
    ConnectionComplete(ConnectWaiter),
    Authorized { id: TransferId, result: Result<String, AgentError> },
    Progress { id: TransferId, progress: TransferProgress },
    OwnerVanished,
    AgentVanished,
}

struct SessionState {
    phase: SessionPhase,
    conn_id: Option<ConnectionId>,
    link: Option<Arc<ObexLink>>,
    owner: Option<String>,
    watch: Option<AbortHandle>,
    path: Option<String>,
    agent: Option<AgentBinding>,
    callback: Option<TransferCallback>,
    pending: VecDeque<PendingTransfer>,
    waiter: Option<ConnectWaiter>,
    obex_task: Option<AbortHandle>,
    requests: HashMap<TransferId, AbortHandle>,
    next_transfer: u64,
    /// Transfer whose outcome callback is running
    finishing: Option<Arc<dyn Transfer>>,
}

struct SessionInner {
    serial: u64,
    source: Option<String>,
    destination: String,
    channel: u8,
    driver: Arc<dyn Driver>,
    transport: Arc<dyn Transport>,
    ctx: Arc<ClientContext>,
    runtime: Handle,
    events: mpsc::UnboundedSender<Event>,
    event_loop: AbortHandle,
    state: Mutex<SessionState>,
}

/// Immutable identity of a new session.
pub(crate) struct SessionParams {
    pub serial: u64,
    pub source: Option<String>,
    pub destination: String,
    pub channel: u8,
    pub driver: Arc<dyn Driver>,
    pub transport: Arc<dyn Transport>,
}

// ============================================================================
// Handles
// ============================================================================

/// Shared handle to a session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Non-owning session handle.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub(crate) fn refers_to(&self, session: &Session) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&session.inner))
    }
}

async fn run_events(weak: Weak<SessionInner>, mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        Session { inner }.handle(event);
    }
}

impl Session {
    pub(crate) fn new(ctx: Arc<ClientContext>, runtime: Handle, params: SessionParams) -> Session {
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let (tx, rx) = mpsc::unbounded_channel();
            let event_loop = runtime.spawn(run_events(weak.clone(), rx)).abort_handle();
            SessionInner {
                serial: params.serial,
                source: params.source,
                destination: params.destination,
                channel: params.channel,
                driver: params.driver,
                transport: params.transport,
                ctx,
                runtime,
                events: tx,
                event_loop,
                state: Mutex::new(SessionState {
                    phase: SessionPhase::Idle,
                    conn_id: None,
                    link: None,
                    owner: None,
                    watch: None,
                    path: None,
                    agent: None,
                    callback: None,
                    pending: VecDeque::new(),
                    waiter: None,
                    obex_task: None,
                    requests: HashMap::new(),
                    next_transfer: 0,
                    finishing: None,
                }),
            }
        });
        debug!(session = inner.serial, dst = %inner.destination, service = inner.driver.service(), "session created");
        Session { inner }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post(&self, event: Event) {
        // Fails only once the event loop is gone, i.e. during destruction.
        let _ = self.inner.events.send(event);
    }

    // ------------------------------------------------------------------------
    // Identity and accessors
    // ------------------------------------------------------------------------

    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub fn source(&self) -> Option<&str> {
        self.inner.source.as_deref()
    }

    pub fn destination(&self) -> &str {
        &self.inner.destination
    }

    /// Requested channel; 0 when it was discovered through SDP.
    pub fn channel(&self) -> u8 {
        self.inner.channel
    }

    pub fn service(&self) -> &str {
        self.inner.driver.service()
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }

    /// Target header sent on CONNECT.
    pub fn target(&self) -> Option<&[u8]> {
        self.inner.driver.target()
    }

    pub fn owner(&self) -> Option<String> {
        self.state().owner.clone()
    }

    /// Exported object path, once registered.
    pub fn path(&self) -> Option<String> {
        self.state().path.clone()
    }

    /// Bus name of the bound agent.
    pub fn agent_name(&self) -> Option<String> {
        self.state().agent.as_ref().map(|a| a.name().to_string())
    }

    pub fn link(&self) -> Option<Arc<ObexLink>> {
        self.state().link.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state().phase
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.state().conn_id
    }

    pub fn queue_len(&self) -> usize {
        self.state().pending.len()
    }

    /// Transfers that are authorizing or running.
    pub fn in_flight(&self) -> usize {
        self.state()
            .pending
            .iter()
            .filter(|p| p.stage != TransferStage::Queued)
            .count()
    }

    pub fn transfer_stage(&self, id: TransferId) -> Option<TransferStage> {
        self.state().pending.iter().find(|p| p.id == id).map(|p| p.stage)
    }

    /// The current transfer: the one whose outcome is being reported, else
    /// the queue head.
    fn current_transfer(&self) -> Option<Arc<dyn Transfer>> {
        let st = self.state();
        st.finishing
            .clone()
            .or_else(|| st.pending.front().map(|p| p.transfer.clone()))
    }

    /// The current transfer's buffer, which is then cleared.
    pub fn buffer(&self) -> Option<Bytes> {
        let head = self.current_transfer()?;
        let buf = head.buffer();
        head.clear_buffer();
        buf
    }

    /// The current transfer's application parameters.
    pub fn params(&self) -> Option<Bytes> {
        let head = self.current_transfer()?;
        head.params()
    }

    /// Number of live handles, including those held by queued transfers
    /// and pending callbacks.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ------------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------------

    /// Connect the session.
    ///
    /// When already connected, `on_connect` fires from the event loop. When
    /// a connect is already in flight, `on_connect` is dropped and only the
    /// first callback fires.
    pub fn connect(&self, on_connect: Option<ConnectCallback>) -> Result<(), SessionError> {
        let waiter = on_connect.map(|callback| ConnectWaiter {
            callback,
            _hold: self.clone(),
        });

        {
            let mut st = self.state();
            match st.phase {
                SessionPhase::Connected => {
                    drop(st);
                    if let Some(w) = waiter {
                        self.post(Event::ConnectionComplete(w));
                    }
                    return Ok(());
                }
                SessionPhase::Connecting => {
                    drop(st);
                    if waiter.is_some() {
                        debug!(session = self.serial(), "connect in flight, callback not attached");
                    }
                    return Ok(());
                }
                SessionPhase::ShuttingDown => return Err(SessionError::NotConnected),
                SessionPhase::Idle => {
                    st.phase = SessionPhase::Connecting;
                    st.waiter = waiter;
                }
            }
        }

        let request = ConnectRequest {
            source: self.inner.source.clone(),
            destination: self.inner.destination.clone(),
            service_uuid: self.inner.driver.uuid().to_string(),
            channel: self.inner.channel,
        };
        let tx = self.inner.events.clone();
        let started = self.inner.transport.connect(
            request,
            Box::new(move |res| {
                let _ = tx.send(Event::TransportReady(res));
            }),
        );

        match started {
            Ok(id) => {
                let mut st = self.state();
                if st.phase == SessionPhase::ShuttingDown {
                    drop(st);
                    self.inner.transport.disconnect(id);
                } else {
                    st.conn_id = Some(id);
                }
                debug!(session = self.serial(), id = %id, transport = self.inner.transport.name(), "transport connect started");
                Ok(())
            }
            Err(e) => {
                warn!(session = self.serial(), error = %e, "transport connect could not start");
                let waiter = {
                    let mut st = self.state();
                    st.phase = SessionPhase::Idle;
                    st.waiter.take()
                };
                drop(waiter);
                Err(SessionError::Connect(e))
            }
        }
    }

    fn on_transport_ready(&self, stream: BoxedStream) {
        let mut st = self.state();
        if st.phase != SessionPhase::Connecting {
            debug!(session = self.serial(), "stream delivered to inactive session");
            return;
        }

        let engine = self.inner.ctx.engine.clone();
        let target = self.inner.driver.target().map(Bytes::copy_from_slice);
        let tx = self.inner.events.clone();
        let task = self.inner.runtime.spawn(async move {
            let res = engine.connect(stream, target.as_deref()).await;
            let _ = tx.send(Event::ObexConnected(res));
        });
        st.obex_task = Some(task.abort_handle());
    }

    fn on_obex_connected(&self, res: Result<ObexLink, ObexError>) {
        let mut st = self.state();
        st.obex_task = None;
        if st.phase != SessionPhase::Connecting {
            return;
        }

        match res {
            Ok(link) => {
                st.phase = SessionPhase::Connected;
                st.link = Some(Arc::new(link));
                let waiter = st.waiter.take();
                drop(st);

                info!(session = self.serial(), dst = %self.destination(), service = self.service(), "session connected");
                if let Some(ConnectWaiter { callback, _hold }) = waiter {
                    callback(self, Ok(()));
                }
            }
            Err(e) => {
                drop(st);
                self.fail_connect(e.into());
            }
        }
    }

    /// Report a connect failure once, then shut the session down.
    fn fail_connect(&self, err: ConnectError) {
        let waiter = self.state().waiter.take();
        warn!(session = self.serial(), error = %err, "session connect failed");
        self.shutdown();
        match waiter {
            Some(ConnectWaiter { callback, _hold }) => callback(self, Err(err)),
            None => debug!(session = self.serial(), "connect failure with no waiter"),
        }
    }

    // ------------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------------

    fn handle(&self, event: Event) {
        match event {
            Event::TransportReady(Ok(stream)) => self.on_transport_ready(stream),
            Event::TransportReady(Err(e)) => self.fail_connect(e),
            Event::ObexConnected(res) => self.on_obex_connected(res),
            Event::ConnectionComplete(ConnectWaiter { callback, _hold }) => {
                let res = match self.phase() {
                    SessionPhase::Connected => Ok(()),
                    _ => Err(ConnectError::Cancelled),
                };
                callback(self, res);
            }
            Event::Authorized { id, result } => self.on_authorized(id, result),
            Event::Progress { id, progress } => match progress {
                TransferProgress::Transferred(n) => self.notify_progress(id, n),
                TransferProgress::Failed(e) => self.notify_error(id, e),
            },
            Event::OwnerVanished => {
                let stale = {
                    let mut st = self.state();
                    let owner_is_agent = match (&st.agent, &st.owner) {
                        (Some(a), Some(o)) => a.name() == o,
                        _ => false,
                    };
                    if owner_is_agent {
                        st.agent.take()
                    } else {
                        None
                    }
                };
                drop(stale);
                info!(session = self.serial(), "owner left the bus");
                self.shutdown();
            }
            Event::AgentVanished => {
                let stale = self.state().agent.take();
                drop(stale);
                info!(session = self.serial(), "agent left the bus");
                self.shutdown();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Cancel every pending transfer, retract the exported object,
    /// disconnect the transport and leave the registry.
    ///
    /// Idempotent, and safe from inside any session callback.
    pub fn shutdown(&self) {
        let (cancelled, callback, requests, obex_task, waiter, conn_id, path, link) = {
            let mut st = self.state();
            if st.phase == SessionPhase::ShuttingDown {
                return;
            }
            st.phase = SessionPhase::ShuttingDown;

            let cancelled: Vec<PendingTransfer> = st.pending.drain(..).collect();
            if let Some(agent) = &st.agent {
                for p in &cancelled {
                    if let Some(path) = p.transfer.path() {
                        agent.notify_error(&path, &TransferError::Cancelled.to_string());
                    }
                }
            }
            let requests: Vec<AbortHandle> = st.requests.drain().map(|(_, h)| h).collect();
            (
                cancelled,
                st.callback.clone(),
                requests,
                st.obex_task.take(),
                st.waiter.take(),
                st.conn_id.take(),
                st.path.take(),
                st.link.take(),
            )
        };

        for r in requests {
            r.abort();
        }
        if let Some(t) = obex_task {
            t.abort();
        }

        for p in cancelled {
            debug!(session = self.serial(), transfer = %p.id, "cancelling transfer");
            if let Some(cb) = &callback {
                cb(self, Err(TransferError::Cancelled));
            }
            p.transfer.unregister();
        }

        if let Some(path) = path {
            self.inner.driver.remove(&path);
            self.inner.ctx.bus.retract_session(&path);
            debug!(session = self.serial(), path = %path, "session unregistered");
        }

        if let Some(id) = conn_id {
            self.inner.transport.disconnect(id);
        }
        drop(link);

        self.inner.ctx.forget_session(self);
        info!(session = self.serial(), "session shut down");

        if let Some(ConnectWaiter { callback, _hold }) = waiter {
            callback(self, Err(ConnectError::Cancelled));
        }
    }

    // ------------------------------------------------------------------------
    // Owner and agent
    // ------------------------------------------------------------------------

    /// Tie the session's lifetime to `name`: it shuts down when `name`
    /// leaves the bus. Replaces any previous owner watch.
    pub fn set_owner(&self, name: &str) {
        let bus = self.inner.ctx.bus.clone();
        let tx = self.inner.events.clone();
        let watched = name.to_string();

        let mut st = self.state();
        if let Some(old) = st.watch.take() {
            old.abort();
        }
        let task = self.inner.runtime.spawn(async move {
            bus.owner_vanished(&watched).await;
            let _ = tx.send(Event::OwnerVanished);
        });
        st.watch = Some(task.abort_handle());
        st.owner = Some(name.to_string());
        debug!(session = self.serial(), owner = %name, "owner set");
    }

    /// Bind the agent served by `name` at `path`.
    pub fn set_agent(&self, name: &str, path: &str) -> Result<(), SessionError> {
        if self.state().agent.is_some() {
            return Err(SessionError::AlreadyExists);
        }

        let agent = self.inner.ctx.bus.agent(name, path);
        let mut binding = AgentBinding::new(name, path, agent, &self.inner.runtime);

        let bus = self.inner.ctx.bus.clone();
        let tx = self.inner.events.clone();
        let watched = name.to_string();
        let watch = self.inner.runtime.spawn(async move {
            bus.owner_vanished(&watched).await;
            let _ = tx.send(Event::AgentVanished);
        });
        binding.set_watch(watch.abort_handle());

        let needs_owner = {
            let mut st = self.state();
            if st.agent.is_some() {
                return Err(SessionError::AlreadyExists);
            }
            st.agent = Some(binding);
            st.watch.is_none()
        };
        if needs_owner {
            self.set_owner(name);
        }

        debug!(session = self.serial(), agent = %name, path = %path, "agent assigned");
        Ok(())
    }

    /// Unbind the agent if `sender`/`path` describe it. No binding is not
    /// an error.
    pub fn release_agent(&self, sender: &str, path: &str) -> Result<(), SessionError> {
        let mut st = self.state();
        let Some(binding) = st.agent.as_ref() else {
            return Ok(());
        };
        if !binding.matches(sender, path) {
            return Err(SessionError::NotAuthorized);
        }
        let released = st.agent.take();
        drop(st);
        drop(released);
        debug!(session = self.serial(), agent = %sender, "agent released");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Export the session object under the configured base path and probe
    /// the driver. Returns the existing path when already registered.
    pub async fn register(&self) -> Result<String, SessionError> {
        if let Some(path) = self.path() {
            return Ok(path);
        }

        let ctx = &self.inner.ctx;
        let path = format!("{}/session{}", ctx.config.session_base_path, ctx.next_path_index());

        ctx.bus
            .export_session(&path, SessionObject::new(self.downgrade()))
            .await
            .map_err(|e| {
                warn!(session = self.serial(), path = %path, error = %e, "export failed");
                SessionError::Bus(e)
            })?;

        if let Err(e) = self.inner.driver.probe(&path, self) {
            warn!(session = self.serial(), path = %path, error = %e, "driver probe failed");
            ctx.bus.retract_session(&path);
            return Err(SessionError::Bus(e));
        }

        let mut st = self.state();
        if st.phase == SessionPhase::ShuttingDown {
            drop(st);
            self.inner.driver.remove(&path);
            ctx.bus.retract_session(&path);
            return Err(SessionError::Gone);
        }
        st.path = Some(path.clone());
        drop(st);

        info!(session = self.serial(), path = %path, "session registered");
        Ok(path)
    }

    // ------------------------------------------------------------------------
    // Transfer operations
    // ------------------------------------------------------------------------

    fn register_transfer(&self, mut spec: TransferSpec) -> Result<Arc<dyn Transfer>, SessionError> {
        let link = {
            let st = self.state();
            spec.agent = st.agent.as_ref().map(|a| a.name().to_string());
            st.link.clone().ok_or(SessionError::NotConnected)?
        };
        self.inner.ctx.transfers.register(&link, spec).map_err(|e| {
            warn!(session = self.serial(), error = %e, "transfer registration failed");
            SessionError::Io
        })
    }

    fn set_callback(&self, callback: Option<TransferCallback>) {
        if let Some(cb) = callback {
            self.state().callback = Some(cb);
        }
    }

    fn enqueue(&self, kind: TransferKind, transfer: Arc<dyn Transfer>) -> TransferId {
        let (id, first) = {
            let mut st = self.state();
            st.next_transfer += 1;
            let id = TransferId(st.next_transfer);
            let first = st.pending.is_empty();
            st.pending.push_back(PendingTransfer {
                id,
                kind,
                stage: TransferStage::Queued,
                transfer,
                _hold: self.clone(),
            });
            (id, first)
        };
        debug!(session = self.serial(), transfer = %id, ?kind, first, "transfer queued");
        if first {
            self.request_authorization(id);
        }
        id
    }

    /// Fetch an object. Queues behind any pending transfer; authorization
    /// is requested once it reaches the head.
    pub fn get(
        &self,
        mime_type: Option<&str>,
        filename: Option<&str>,
        targetname: Option<&str>,
        apparam: Option<&[u8]>,
        callback: Option<TransferCallback>,
    ) -> Result<TransferId, SessionError> {
        let transfer = self.register_transfer(TransferSpec {
            agent: None,
            filename: filename.map(str::to_string),
            name: targetname.map(str::to_string),
            mime_type: mime_type.map(str::to_string),
            params: apparam.map(Bytes::copy_from_slice),
        })?;
        self.set_callback(callback);
        Ok(self.enqueue(TransferKind::Get, transfer))
    }

    /// Fetch an object by name into memory. Queues like [`Session::get`].
    pub fn pull(
        &self,
        mime_type: Option<&str>,
        name: &str,
        callback: Option<TransferCallback>,
    ) -> Result<TransferId, SessionError> {
        let transfer = self.register_transfer(TransferSpec {
            agent: None,
            filename: None,
            name: Some(name.to_string()),
            mime_type: mime_type.map(str::to_string),
            params: None,
        })?;
        self.set_callback(callback);
        Ok(self.enqueue(TransferKind::Pull, transfer))
    }

    /// Send a local file. Queues behind any pending transfer.
    pub fn send(&self, filename: &str, targetname: Option<&str>) -> Result<TransferId, SessionError> {
        let transfer = self.register_transfer(TransferSpec {
            agent: None,
            filename: Some(filename.to_string()),
            name: targetname.map(str::to_string),
            mime_type: None,
            params: None,
        })?;
        if let Err(e) = transfer.set_file() {
            transfer.unregister();
            return Err(SessionError::Transfer(e));
        }
        Ok(self.enqueue(TransferKind::Send, transfer))
    }

    /// Send a caller supplied buffer. Rejected with [`SessionError::Busy`]
    /// while any transfer is pending.
    pub fn put(&self, buffer: Bytes, targetname: Option<&str>) -> Result<TransferId, SessionError> {
        {
            let st = self.state();
            if st.link.is_none() {
                return Err(SessionError::NotConnected);
            }
            if !st.pending.is_empty() {
                return Err(SessionError::Busy);
            }
        }
        let transfer = self.register_transfer(TransferSpec {
            agent: None,
            filename: None,
            name: targetname.map(str::to_string),
            mime_type: None,
            params: None,
        })?;
        transfer.set_buffer(buffer);
        Ok(self.enqueue(TransferKind::Put, transfer))
    }

    // ------------------------------------------------------------------------
    // Authorization gate and progress fan-out
    // ------------------------------------------------------------------------

    /// Ask the agent about a queued transfer. Without an agent, or for a
    /// transfer with no path, approval is posted to the event loop.
    fn request_authorization(&self, id: TransferId) {
        let mut st = self.state();
        let Some(entry) = st.pending.iter_mut().find(|p| p.id == id) else {
            return;
        };
        if entry.stage != TransferStage::Queued {
            return;
        }
        entry.stage = TransferStage::Authorizing;
        let path = entry.transfer.path();
        let agent = st.agent.as_ref().map(|a| a.agent());

        match (agent, path) {
            (Some(agent), Some(path)) => {
                debug!(session = self.serial(), transfer = %path, "requesting authorization");
                let tx = self.inner.events.clone();
                let task = self.inner.runtime.spawn(async move {
                    let result = agent.request(&path).await;
                    let _ = tx.send(Event::Authorized { id, result });
                });
                st.requests.insert(id, task.abort_handle());
            }
            _ => {
                drop(st);
                self.post(Event::Authorized {
                    id,
                    result: Ok(String::new()),
                });
            }
        }
    }

    fn on_authorized(&self, id: TransferId, result: Result<String, AgentError>) {
        let (transfer, kind) = {
            let mut st = self.state();
            st.requests.remove(&id);
            match st.pending.iter().find(|p| p.id == id) {
                Some(p) => (p.transfer.clone(), p.kind),
                None => return,
            }
        };

        match result {
            Err(e) => {
                error!(session = self.serial(), transfer = %id, error = %e, "agent replied with an error");
                self.terminate(id, Err(TransferError::Rejected(e.message().to_string())));
            }
            Ok(name) => {
                if !name.is_empty() {
                    debug!(session = self.serial(), transfer = %id, name = %name, "agent renamed transfer");
                    transfer.set_name(&name);
                }
                self.start(id, kind, transfer);
            }
        }
    }

    fn start(&self, id: TransferId, kind: TransferKind, transfer: Arc<dyn Transfer>) {
        if let Some(p) = self.state().pending.iter_mut().find(|p| p.id == id) {
            p.stage = TransferStage::Active;
        }

        let tx = self.inner.events.clone();
        let reporter = ProgressReporter::new(move |progress| {
            let _ = tx.send(Event::Progress { id, progress });
        });

        let started = if kind.receives() {
            transfer.start_get(reporter)
        } else {
            transfer.start_put(reporter)
        };

        match started {
            Ok(()) => debug!(session = self.serial(), transfer = %id, ?kind, "transfer started"),
            Err(e) => self.notify_error(id, e),
        }
    }

    fn notify_progress(&self, id: TransferId, transferred: u64) {
        let transfer = {
            let st = self.state();
            let Some(p) = st.pending.iter().find(|p| p.id == id) else {
                return;
            };
            if let (Some(agent), Some(path)) = (&st.agent, p.transfer.path()) {
                agent.notify_progress(&path, transferred);
            }
            p.transfer.clone()
        };

        debug!(session = self.serial(), transfer = %id, transferred, "transfer progress");
        if transfer.size() == Some(transferred) {
            self.notify_complete(id);
        }
    }

    fn notify_complete(&self, id: TransferId) {
        {
            let st = self.state();
            if let Some(p) = st.pending.iter().find(|p| p.id == id) {
                if let (Some(agent), Some(path)) = (&st.agent, p.transfer.path()) {
                    agent.notify_complete(&path);
                }
            }
        }
        debug!(session = self.serial(), transfer = %id, "transfer complete");
        self.terminate(id, Ok(()));
    }

    fn notify_error(&self, id: TransferId, err: TransferError) {
        {
            let st = self.state();
            let Some(p) = st.pending.iter().find(|p| p.id == id) else {
                return;
            };
            if let (Some(agent), Some(path)) = (&st.agent, p.transfer.path()) {
                agent.notify_error(&path, &err.to_string());
            }
        }
        error!(session = self.serial(), transfer = %id, error = %err, "transfer failed");
        self.terminate(id, Err(err));
    }

    /// Drop the transfer from the queue, report the outcome to the stored
    /// callback and start the next one.
    ///
    /// The transfer leaves the queue before the callback runs, so a
    /// shutdown from inside the callback does not cancel it again.
    fn terminate(&self, id: TransferId, result: Result<(), TransferError>) {
        let (removed, callback) = {
            let mut st = self.state();
            if let Some(req) = st.requests.remove(&id) {
                req.abort();
            }
            let pos = st.pending.iter().position(|p| p.id == id);
            let removed = pos.and_then(|i| st.pending.remove(i));
            st.finishing = removed.as_ref().map(|p| p.transfer.clone());
            (removed, st.callback.clone())
        };

        if let Some(cb) = callback {
            cb(self, result);
        }
        self.state().finishing = None;
        if let Some(p) = removed {
            p.transfer.unregister();
        }

        self.dispatch_next();
    }

    fn dispatch_next(&self) {
        let next = {
            let st = self.state();
            if st.phase == SessionPhase::ShuttingDown {
                return;
            }
            match st.pending.front() {
                Some(head) if head.stage == TransferStage::Queued => Some(head.id),
                _ => None,
            }
        };
        if let Some(id) = next {
            self.request_authorization(id);
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);

        if let Some(agent) = st.agent.take() {
            agent.release();
        }
        if let Some(watch) = st.watch.take() {
            watch.abort();
        }
        for (_, req) in st.requests.drain() {
            req.abort();
        }
        if let Some(task) = st.obex_task.take() {
            task.abort();
        }
        st.link = None;

        if let Some(id) = st.conn_id.take() {
            self.transport.disconnect(id);
        }
        if let Some(path) = st.path.take() {
            self.driver.remove(&path);
            self.ctx.bus.retract_session(&path);
        }

        self.event_loop.abort();
        self.ctx.prune_sessions();
        debug!(session = self.serial, "session destroyed");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("serial", &self.inner.serial)
            .field("destination", &self.inner.destination)
            .field("service", &self.inner.driver.service())
            .field("channel", &self.inner.channel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{settle, ConnectProbe, FakeAgent, TestClient, TransferProbe};

    #[tokio::test]
    async fn test_operations_require_connection() {
        let tc = TestClient::builder().with_rfcomm(crate::harness::FakeRfcomm::new().hanging()).build();
        let session = tc.create("OPP", 9, None).unwrap();
        assert_eq!(session.phase(), SessionPhase::Connecting);

        assert_eq!(session.get(None, Some("a"), None, None, None).unwrap_err(), SessionError::NotConnected);
        assert_eq!(session.pull(None, "b", None).unwrap_err(), SessionError::NotConnected);
        assert_eq!(session.send("c", None).unwrap_err(), SessionError::NotConnected);
        assert_eq!(session.put(Bytes::from_static(b"d"), None).unwrap_err(), SessionError::NotConnected);
        assert_eq!(session.put(Bytes::new(), None).unwrap_err().errno(), -107);
    }

    #[tokio::test]
    async fn test_accessors() {
        let tc = TestClient::new();
        let session = tc.connected("FTP", 7).await;
        assert_eq!(session.destination(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(session.channel(), 7);
        assert_eq!(session.service(), "FTP");
        assert_eq!(session.target().map(|t| t.len()), Some(16));
        assert!(session.source().is_none());
        assert!(session.link().is_some());
        assert!(session.connection_id().is_some());
        assert_eq!(session.phase(), SessionPhase::Connected);
    }

    #[tokio::test]
    async fn test_put_busy_while_pending() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;

        session.send("/tmp/a", None).unwrap();
        let err = session.put(Bytes::from_static(b"x"), Some("x.vcf")).unwrap_err();
        assert_eq!(err, SessionError::Busy);
        assert_eq!(err.errno(), -106);

        // File based sends queue instead.
        assert!(session.send("/tmp/b", None).is_ok());
        assert_eq!(session.queue_len(), 2);
        assert_eq!(session.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_send_set_file_failure() {
        let tc = TestClient::builder()
            .with_transfers(crate::harness::FakeTransferFactory::new().failing_set_file())
            .build();
        let session = tc.connected("OPP", 9).await;

        let err = session.send("/missing", None).unwrap_err();
        assert!(matches!(err, SessionError::Transfer(_)));
        assert_eq!(session.queue_len(), 0);
        assert!(tc.transfers.created()[0].is_unregistered());
    }

    #[tokio::test]
    async fn test_register_failure_is_io() {
        let tc = TestClient::builder()
            .with_transfers(crate::harness::FakeTransferFactory::new().failing_register())
            .build();
        let session = tc.connected("OPP", 9).await;
        assert_eq!(session.get(None, None, Some("x"), None, None).unwrap_err(), SessionError::Io);
    }

    #[tokio::test]
    async fn test_start_failure_terminates_transfer() {
        let tc = TestClient::builder()
            .with_transfers(crate::harness::FakeTransferFactory::new().failing_start(-2))
            .build();
        let session = tc.connected("OPP", 9).await;
        let probe = TransferProbe::new();

        session.get(None, None, Some("x"), None, Some(probe.callback())).unwrap();
        settle().await;

        assert_eq!(probe.results(), vec![Err(TransferError::Start(-2))]);
        assert_eq!(session.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_progress_below_size_keeps_transfer() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;
        let probe = TransferProbe::new();
        let id = session.get(None, None, Some("x"), None, Some(probe.callback())).unwrap();
        settle().await;

        let t = tc.transfers.created()[0].clone();
        t.report(10);
        settle().await;
        assert_eq!(session.transfer_stage(id), Some(TransferStage::Active));
        assert!(probe.results().is_empty());

        t.report(t.declared_size());
        settle().await;
        assert_eq!(probe.results(), vec![Ok(())]);
        assert!(t.is_unregistered());
    }

    #[tokio::test]
    async fn test_mid_transfer_error() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;
        let agent = tc.bus.add_agent(":1.5", FakeAgent::approving());
        session.set_agent(":1.5", "/agent").unwrap();

        let probe = TransferProbe::new();
        session.get(None, None, Some("x"), None, Some(probe.callback())).unwrap();
        settle().await;

        let t = tc.transfers.created()[0].clone();
        t.fail(TransferError::Io("reset".into()));
        settle().await;

        assert_eq!(probe.results(), vec![Err(TransferError::Io("reset".into()))]);
        let path = t.path().unwrap();
        assert!(agent.calls().contains(&format!("Error {path} transfer i/o error: reset")));
        assert_eq!(session.queue_len(), 0);
        assert_eq!(session.phase(), SessionPhase::Connected);
    }

    #[tokio::test]
    async fn test_agent_suggested_name() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;
        tc.bus.add_agent(":1.5", FakeAgent::approving().suggesting("renamed.vcf"));
        session.set_agent(":1.5", "/agent").unwrap();

        session.send("/tmp/card.vcf", Some("card.vcf")).unwrap();
        settle().await;

        let t = tc.transfers.created()[0].clone();
        assert_eq!(t.name().as_deref(), Some("renamed.vcf"));
        assert!(t.started());
    }

    #[tokio::test]
    async fn test_agent_name_attached_to_transfers() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;
        session.set_agent(":1.5", "/agent").unwrap();
        session.pull(Some("x-bt/vcard"), "me.vcf", None).unwrap();

        let spec = tc.transfers.created()[0].spec();
        assert_eq!(spec.agent.as_deref(), Some(":1.5"));
        assert_eq!(spec.name.as_deref(), Some("me.vcf"));
        assert!(spec.filename.is_none());
        assert_eq!(session.agent_name().as_deref(), Some(":1.5"));
    }

    #[tokio::test]
    async fn test_set_agent_twice() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;
        session.set_agent(":1.5", "/agent").unwrap();
        let err = session.set_agent(":1.6", "/other").unwrap_err();
        assert_eq!(err, SessionError::AlreadyExists);
        assert_eq!(err.errno(), -114);
        // The first agent also became the owner.
        assert_eq!(session.owner().as_deref(), Some(":1.5"));
    }

    #[tokio::test]
    async fn test_release_agent_rules() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;
        assert!(session.release_agent(":1.5", "/agent").is_ok());

        session.set_agent(":1.5", "/agent").unwrap();
        assert_eq!(session.release_agent(":1.6", "/agent"), Err(SessionError::NotAuthorized));
        assert_eq!(session.release_agent(":1.5", "/nope"), Err(SessionError::NotAuthorized));
        assert!(session.release_agent(":1.5", "/agent").is_ok());
        assert!(session.agent_name().is_none());
        assert!(session.set_agent(":1.6", "/other").is_ok());
    }

    #[tokio::test]
    async fn test_buffer_and_params_of_head() {
        let tc = TestClient::new();
        let session = tc.connected("PBAP", 19).await;
        assert!(session.buffer().is_none());

        session.get(Some("x-bt/phonebook"), None, Some("pb.vcf"), Some(&[0x04, 0x02, 0x00, 0x10]), None).unwrap();
        assert_eq!(session.params().as_deref(), Some(&[0x04, 0x02, 0x00, 0x10][..]));

        tc.transfers.created()[0].set_buffer(Bytes::from_static(b"BEGIN:VCARD"));
        assert_eq!(session.buffer().as_deref(), Some(&b"BEGIN:VCARD"[..]));
        assert!(session.buffer().is_none());
    }

    #[tokio::test]
    async fn test_buffer_readable_from_outcome_callback() {
        let tc = TestClient::new();
        let session = tc.connected("PBAP", 19).await;
        let seen: Arc<std::sync::Mutex<Vec<Option<Bytes>>>> = Arc::default();
        let sink = seen.clone();
        let cb: TransferCallback = Arc::new(move |s: &Session, _res| {
            sink.lock().unwrap().push(s.buffer());
        });
        session.pull(Some("x-bt/phonebook"), "pb.vcf", Some(cb)).unwrap();
        settle().await;

        let t = tc.transfers.created()[0].clone();
        t.set_buffer(Bytes::from_static(b"BEGIN:VCARD"));
        t.complete();
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![Some(Bytes::from_static(b"BEGIN:VCARD"))]);
        assert_eq!(session.queue_len(), 0);
        assert!(session.buffer().is_none());
    }

    #[tokio::test]
    async fn test_register_exports_under_base_path() {
        let tc = TestClient::new();
        let a = tc.connected("OPP", 9).await;
        let b = tc.connected("FTP", 10).await;

        assert_eq!(a.register().await.unwrap(), "/org/openobex/session0");
        assert_eq!(a.register().await.unwrap(), "/org/openobex/session0");
        assert_eq!(b.register().await.unwrap(), "/org/openobex/session1");
        assert_eq!(a.path().as_deref(), Some("/org/openobex/session0"));

        let props = tc.bus.object("/org/openobex/session0").unwrap().properties().unwrap();
        assert_eq!(props.destination, "AA:BB:CC:DD:EE:FF");
        assert_eq!(props.channel, 9);
        assert!(props.source.is_none());
    }

    #[tokio::test]
    async fn test_exported_object_assigns_agents() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;
        let path = session.register().await.unwrap();
        let object = tc.bus.object(&path).unwrap();

        object.assign_agent(":1.9", "/agent").unwrap();
        assert_eq!(object.assign_agent(":1.9", "/agent"), Err(SessionError::AlreadyExists));
        assert_eq!(object.release_agent(":1.8", "/agent"), Err(SessionError::NotAuthorized));
        assert_eq!(object.assign_agent(":1.9", ""), Err(SessionError::InvalidArguments));
        object.release_agent(":1.9", "/agent").unwrap();
        assert!(session.agent_name().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;
        let agent = tc.bus.add_agent(":1.5", FakeAgent::holding());
        session.set_agent(":1.5", "/agent").unwrap();
        let path = session.register().await.unwrap();

        let probe = TransferProbe::new();
        session.get(None, None, Some("x"), None, Some(probe.callback())).unwrap();
        session.send("/tmp/y", None).unwrap();
        settle().await;

        session.shutdown();
        settle().await;
        let after_first = (session.phase(), session.queue_len(), probe.results(), tc.bus.retracted(), tc.rfcomm_disconnects());
        assert_eq!(after_first.4, 1);
        session.shutdown();
        settle().await;
        let after_second = (session.phase(), session.queue_len(), probe.results(), tc.bus.retracted(), tc.rfcomm_disconnects());

        assert_eq!(after_first, after_second);
        assert_eq!(session.phase(), SessionPhase::ShuttingDown);
        assert_eq!(probe.results(), vec![Err(TransferError::Cancelled), Err(TransferError::Cancelled)]);
        assert_eq!(tc.bus.retracted(), vec![path]);
        assert!(tc.transfers.created().iter().all(|t| t.is_unregistered()));
        assert_eq!(agent.calls().iter().filter(|c| c.starts_with("Error")).count(), 2);
        assert!(session.link().is_none());
        assert!(tc.client.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_from_inside_callback() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;
        let agent = tc.bus.add_agent(":1.5", FakeAgent::approving());
        session.set_agent(":1.5", "/agent").unwrap();

        let probe = TransferProbe::new();
        let record = probe.callback();
        let cb: TransferCallback = Arc::new(move |s: &Session, res| {
            record(s, res);
            s.shutdown();
        });
        session.get(None, None, Some("x"), None, Some(cb)).unwrap();
        session.send("/tmp/next", None).unwrap();
        settle().await;

        let first = tc.transfers.created()[0].clone();
        first.report(first.declared_size());
        settle().await;

        assert_eq!(session.phase(), SessionPhase::ShuttingDown);
        assert_eq!(session.queue_len(), 0);
        assert!(!tc.transfers.created()[1].started());

        // One outcome per transfer: the finished GET, then the cancelled SEND.
        assert_eq!(probe.results(), vec![Ok(()), Err(TransferError::Cancelled)]);
        let calls = agent.calls();
        assert!(calls.contains(&"Complete /transfer1".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("Error /transfer1")));
        assert!(tc.transfers.created().iter().all(|t| t.is_unregistered()));
    }

    #[tokio::test]
    async fn test_owner_vanishing_shuts_down() {
        let tc = TestClient::new();
        let probe = ConnectProbe::new();
        let session = tc
            .client
            .create_session(tc.request("OPP", 9).owner(":1.42"), Some(probe.callback()))
            .unwrap();
        probe.wait().await;
        assert_eq!(session.owner().as_deref(), Some(":1.42"));

        tc.bus.vanish(":1.42");
        settle().await;
        assert_eq!(session.phase(), SessionPhase::ShuttingDown);
    }

    #[tokio::test]
    async fn test_agent_vanishing_clears_binding_and_shuts_down() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;
        let agent = tc.bus.add_agent(":1.5", FakeAgent::approving());
        session.set_agent(":1.5", "/agent").unwrap();

        tc.bus.vanish(":1.5");
        settle().await;

        assert!(session.agent_name().is_none());
        assert_eq!(session.phase(), SessionPhase::ShuttingDown);
        drop(session);
        settle().await;
        assert!(!agent.calls().contains(&"Release".to_string()));
    }

    #[tokio::test]
    async fn test_last_drop_runs_destructor() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;
        let agent = tc.bus.add_agent(":1.5", FakeAgent::approving());
        session.set_agent(":1.5", "/agent").unwrap();
        let path = session.register().await.unwrap();
        assert_eq!(session.ref_count(), 1);

        drop(session);
        settle().await;

        assert_eq!(agent.calls(), vec!["Release"]);
        assert_eq!(tc.bus.retracted(), vec![path]);
        assert_eq!(tc.rfcomm_disconnects(), 1);
        assert!(tc.client.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_queued_transfers_hold_references() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;
        session.send("/tmp/a", None).unwrap();
        session.send("/tmp/b", None).unwrap();
        assert_eq!(session.ref_count(), 3);

        let weak = session.downgrade();
        drop(session);
        settle().await;
        let session = weak.upgrade().expect("queued transfers keep the session alive");

        session.shutdown();
        assert_eq!(session.ref_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_deferred() {
        let tc = TestClient::new();
        let session = tc.connected("OPP", 9).await;

        let probe = ConnectProbe::new();
        session.connect(Some(probe.callback())).unwrap();
        // Not delivered inline.
        assert!(probe.results().is_empty());
        probe.wait().await;
        assert_eq!(probe.results(), vec![Ok(())]);
    }
}

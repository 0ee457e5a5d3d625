//! Test harness for the OBEX client core.
//!
//! Fakes for every collaborator (adapter manager, SDP server, RFCOMM with
//! an OBEX peer, transfers, agents, bus) and a [`TestClient`] that wires
//! them to a real [`BluetoothTransport`] and [`ObexClient`].

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{watch, Notify};

use crate::adapter::{AdapterError, AdapterManager};
use crate::agent::Agent;
use crate::bus::{Bus, SessionObject};
use crate::client::{ObexClient, SessionRequest};
use crate::config::ClientConfig;
use crate::connector::{BluetoothTransport, RfcommConnector, SecurityLevel};
use crate::driver::DriverRegistry;
use crate::errors::{AgentError, BusError, ConnectError, SdpError, SessionError, TransferError};
use crate::obex::{ObexLink, FINAL_BIT, HDR_CONNECTION_ID, OBEX_VERSION, RSP_SUCCESS};
use crate::sdp::{DataElement, SdpChannel, SdpClient, SearchAttrResponse, ATTR_PROTOCOL_DESCRIPTOR_LIST, L2CAP_UUID, RFCOMM_UUID};
use crate::session::{ConnectCallback, Session, TransferCallback};
use crate::transfer::{ProgressReporter, Transfer, TransferFactory, TransferSpec};
use crate::transport::BoxedStream;
use crate::types::BdAddr;

/// Path the fake adapter manager reports as the default adapter.
pub const FAKE_ADAPTER: &str = "/org/bluez/hci0";

/// Destination used by [`TestClient`] requests.
pub const FAKE_DESTINATION: &str = "AA:BB:CC:DD:EE:FF";

/// Let spawned tasks run to quiescence.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ============================================================================
// Adapter manager
// ============================================================================

/// Adapter manager with one default adapter.
#[derive(Default)]
pub struct FakeAdapters {
    no_adapters: bool,
    refuse: bool,
    hang: bool,
    calls: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
}

impl FakeAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every adapter lookup fails.
    pub fn without_adapters(mut self) -> Self {
        self.no_adapters = true;
        self
    }

    pub fn refusing_sessions(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// Session requests never answer.
    pub fn hanging_sessions(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn released(&self) -> Vec<String> {
        lock(&self.released).clone()
    }
}

#[async_trait]
impl AdapterManager for FakeAdapters {
    async fn default_adapter(&self) -> Result<String, AdapterError> {
        lock(&self.calls).push("DefaultAdapter".to_string());
        if self.no_adapters {
            return Err(AdapterError::NotFound("default".into()));
        }
        Ok(FAKE_ADAPTER.to_string())
    }

    async fn find_adapter(&self, name: &str) -> Result<String, AdapterError> {
        lock(&self.calls).push(format!("FindAdapter {name}"));
        if self.no_adapters {
            return Err(AdapterError::NotFound(name.to_string()));
        }
        Ok(format!("/org/bluez/{name}"))
    }

    async fn request_session(&self, adapter: &str) -> Result<(), AdapterError> {
        lock(&self.calls).push(format!("RequestSession {adapter}"));
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.refuse {
            return Err(AdapterError::Refused(adapter.to_string()));
        }
        Ok(())
    }

    async fn release_session(&self, adapter: &str) {
        lock(&self.released).push(adapter.to_string());
    }
}

// ============================================================================
// SDP
// ============================================================================

/// Attribute lists holding one OPP-like record. With `Some(channel)` the
/// record carries an RFCOMM stack, otherwise only L2CAP.
pub fn sdp_record_lists(channel: Option<u8>) -> Bytes {
    let protocols = match channel {
        Some(ch) => DataElement::Sequence(vec![
            DataElement::Sequence(vec![DataElement::uuid16(L2CAP_UUID)]),
            DataElement::Sequence(vec![DataElement::uuid16(RFCOMM_UUID), DataElement::u8(ch)]),
            DataElement::Sequence(vec![DataElement::uuid16(0x0008)]),
        ]),
        None => DataElement::Sequence(vec![DataElement::Sequence(vec![
            DataElement::uuid16(L2CAP_UUID),
            DataElement::u16(0x1001),
        ])]),
    };
    DataElement::Sequence(vec![DataElement::Sequence(vec![
        DataElement::u16(0x0000),
        DataElement::u32(0x0001_0000),
        DataElement::u16(0x0001),
        DataElement::Sequence(vec![DataElement::uuid16(0x1105)]),
        DataElement::u16(ATTR_PROTOCOL_DESCRIPTOR_LIST),
        protocols,
    ])])
    .to_bytes()
}

/// SDP server answering every search with fixed attribute lists.
pub struct ScriptedSdp {
    lists: Option<Bytes>,
    searches: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
}

impl ScriptedSdp {
    pub fn with_lists(lists: Bytes) -> Self {
        Self {
            lists: Some(lists),
            searches: Arc::new(AtomicUsize::new(0)),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_channel(channel: u8) -> Self {
        Self::with_lists(sdp_record_lists(Some(channel)))
    }

    pub fn without_rfcomm() -> Self {
        Self::with_lists(sdp_record_lists(None))
    }

    /// The SDP connection itself fails.
    pub fn unreachable() -> Self {
        Self {
            lists: None,
            ..Self::with_lists(Bytes::new())
        }
    }

    /// Search requests received.
    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    /// SDP channels not yet closed.
    pub fn open_channels(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

struct ScriptedChannel {
    lists: Bytes,
    reply: Option<Bytes>,
    searches: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
}

impl Drop for ScriptedChannel {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SdpChannel for ScriptedChannel {
    async fn send(&mut self, pdu: &[u8]) -> Result<(), SdpError> {
        let tid = pdu
            .get(1..3)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| SdpError::Malformed("short request".into()))?;
        self.searches.fetch_add(1, Ordering::SeqCst);
        let rsp = SearchAttrResponse::Attributes {
            lists: self.lists.clone(),
            continuation: Vec::new(),
        };
        self.reply = Some(rsp.encode(tid));
        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes, SdpError> {
        self.reply.take().ok_or_else(|| SdpError::Io("no request pending".into()))
    }
}

#[async_trait]
impl SdpClient for ScriptedSdp {
    async fn connect(&self, _src: BdAddr, _dst: BdAddr) -> Result<Box<dyn SdpChannel>, SdpError> {
        let lists = self
            .lists
            .clone()
            .ok_or_else(|| SdpError::Io("host is down".into()))?;
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedChannel {
            lists,
            reply: None,
            searches: self.searches.clone(),
            open: self.open.clone(),
        }))
    }
}

// ============================================================================
// RFCOMM and OBEX peer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfcommAttempt {
    pub src: BdAddr,
    pub dst: BdAddr,
    pub channel: u8,
    pub security: SecurityLevel,
}

enum RfcommMode {
    Accept,
    Refuse,
    Hang,
}

/// RFCOMM connector backed by in-memory streams, with an OBEX peer that
/// answers CONNECT on the other end.
pub struct FakeRfcomm {
    mode: RfcommMode,
    response: u8,
    attempts: Mutex<Vec<RfcommAttempt>>,
    closed: Arc<AtomicUsize>,
}

impl Default for FakeRfcomm {
    fn default() -> Self {
        Self {
            mode: RfcommMode::Accept,
            response: RSP_SUCCESS | FINAL_BIT,
            attempts: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl FakeRfcomm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        Self {
            mode: RfcommMode::Refuse,
            ..Self::default()
        }
    }

    /// Connects never complete.
    pub fn hanging(mut self) -> Self {
        self.mode = RfcommMode::Hang;
        self
    }

    /// The peer answers CONNECT with `code` (final bit included).
    pub fn with_obex_response(mut self, code: u8) -> Self {
        self.response = code;
        self
    }

    pub fn attempts(&self) -> Vec<RfcommAttempt> {
        lock(&self.attempts).clone()
    }

    /// Streams the client side has closed.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn obex_peer(mut stream: DuplexStream, response: u8, closed: Arc<AtomicUsize>) {
    let mut head = [0u8; 3];
    if stream.read_exact(&mut head).await.is_ok() {
        let len = u16::from_be_bytes([head[1], head[2]]) as usize;
        let mut rest = vec![0u8; len.saturating_sub(3)];
        if stream.read_exact(&mut rest).await.is_ok() {
            let mut rsp = BytesMut::new();
            rsp.put_u8(response);
            rsp.put_u16(0);
            if response == (RSP_SUCCESS | FINAL_BIT) {
                rsp.put_u8(OBEX_VERSION);
                rsp.put_u8(0);
                rsp.put_u16(1024);
                rsp.put_u8(HDR_CONNECTION_ID);
                rsp.put_u32(1);
            }
            let n = rsp.len() as u16;
            rsp[1..3].copy_from_slice(&n.to_be_bytes());
            let _ = stream.write_all(&rsp).await;
        }
    }

    let mut sink = [0u8; 256];
    while let Ok(n) = stream.read(&mut sink).await {
        if n == 0 {
            break;
        }
    }
    closed.fetch_add(1, Ordering::SeqCst);
}

#[async_trait]
impl RfcommConnector for FakeRfcomm {
    async fn connect(&self, src: BdAddr, dst: BdAddr, channel: u8, security: SecurityLevel) -> io::Result<BoxedStream> {
        lock(&self.attempts).push(RfcommAttempt {
            src,
            dst,
            channel,
            security,
        });
        match self.mode {
            RfcommMode::Refuse => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")),
            RfcommMode::Hang => std::future::pending().await,
            RfcommMode::Accept => {
                let (client, server) = tokio::io::duplex(8192);
                tokio::spawn(obex_peer(server, self.response, self.closed.clone()));
                Ok(Box::new(client))
            }
        }
    }
}

// ============================================================================
// Transfers
// ============================================================================

/// A transfer that only records what the session does with it.
pub struct FakeTransfer {
    path: Option<String>,
    spec: TransferSpec,
    size: u64,
    fail_set_file: bool,
    fail_start: Option<i32>,
    name: Mutex<Option<String>>,
    buffer: Mutex<Option<Bytes>>,
    reporter: Mutex<Option<ProgressReporter>>,
    started_as: Mutex<Option<&'static str>>,
    unregistered: AtomicBool,
}

impl FakeTransfer {
    pub fn spec(&self) -> TransferSpec {
        self.spec.clone()
    }

    pub fn declared_size(&self) -> u64 {
        self.size
    }

    pub fn started(&self) -> bool {
        lock(&self.started_as).is_some()
    }

    /// `"get"` or `"put"`, once started.
    pub fn started_as(&self) -> Option<&'static str> {
        *lock(&self.started_as)
    }

    pub fn is_unregistered(&self) -> bool {
        self.unregistered.load(Ordering::SeqCst)
    }

    /// Report `transferred` bytes; reaching the declared size completes.
    pub fn report(&self, transferred: u64) {
        if let Some(r) = lock(&self.reporter).clone() {
            r.progress(transferred);
        }
    }

    pub fn complete(&self) {
        self.report(self.size);
    }

    pub fn fail(&self, err: TransferError) {
        if let Some(r) = lock(&self.reporter).clone() {
            r.fail(err);
        }
    }

    fn begin(&self, kind: &'static str, progress: ProgressReporter) -> Result<(), TransferError> {
        if let Some(code) = self.fail_start {
            return Err(TransferError::Start(code));
        }
        *lock(&self.reporter) = Some(progress);
        *lock(&self.started_as) = Some(kind);
        Ok(())
    }
}

impl Transfer for FakeTransfer {
    fn path(&self) -> Option<String> {
        self.path.clone()
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn name(&self) -> Option<String> {
        lock(&self.name).clone()
    }

    fn set_name(&self, name: &str) {
        *lock(&self.name) = Some(name.to_string());
    }

    fn filename(&self) -> Option<String> {
        self.spec.filename.clone()
    }

    fn set_file(&self) -> Result<(), TransferError> {
        if self.fail_set_file {
            return Err(TransferError::InvalidArguments("cannot open file".into()));
        }
        Ok(())
    }

    fn set_buffer(&self, buffer: Bytes) {
        *lock(&self.buffer) = Some(buffer);
    }

    fn buffer(&self) -> Option<Bytes> {
        lock(&self.buffer).clone()
    }

    fn clear_buffer(&self) {
        *lock(&self.buffer) = None;
    }

    fn params(&self) -> Option<Bytes> {
        self.spec.params.clone()
    }

    fn start_get(&self, progress: ProgressReporter) -> Result<(), TransferError> {
        self.begin("get", progress)
    }

    fn start_put(&self, progress: ProgressReporter) -> Result<(), TransferError> {
        self.begin("put", progress)
    }

    fn unregister(&self) {
        self.unregistered.store(true, Ordering::SeqCst);
        *lock(&self.reporter) = None;
    }
}

/// Creates [`FakeTransfer`]s at `/transfer<N>`.
pub struct FakeTransferFactory {
    counter: AtomicU64,
    created: Mutex<Vec<Arc<FakeTransfer>>>,
    with_paths: bool,
    fail_register: bool,
    fail_set_file: bool,
    fail_start: Option<i32>,
    size: u64,
}

impl Default for FakeTransferFactory {
    fn default() -> Self {
        Self {
            counter: AtomicU64::new(0),
            created: Mutex::new(Vec::new()),
            with_paths: true,
            fail_register: false,
            fail_set_file: false,
            fail_start: None,
            size: 1024,
        }
    }
}

impl FakeTransferFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transfers have no path and so bypass the agent.
    pub fn without_paths(mut self) -> Self {
        self.with_paths = false;
        self
    }

    pub fn failing_register(mut self) -> Self {
        self.fail_register = true;
        self
    }

    pub fn failing_set_file(mut self) -> Self {
        self.fail_set_file = true;
        self
    }

    pub fn failing_start(mut self, code: i32) -> Self {
        self.fail_start = Some(code);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn created(&self) -> Vec<Arc<FakeTransfer>> {
        lock(&self.created).clone()
    }
}

impl TransferFactory for FakeTransferFactory {
    fn register(&self, _link: &Arc<ObexLink>, spec: TransferSpec) -> Result<Arc<dyn Transfer>, TransferError> {
        if self.fail_register {
            return Err(TransferError::Io("registration refused".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let transfer = Arc::new(FakeTransfer {
            path: self.with_paths.then(|| format!("/transfer{n}")),
            name: Mutex::new(spec.name.clone()),
            spec,
            size: self.size,
            fail_set_file: self.fail_set_file,
            fail_start: self.fail_start,
            buffer: Mutex::new(None),
            reporter: Mutex::new(None),
            started_as: Mutex::new(None),
            unregistered: AtomicBool::new(false),
        });
        lock(&self.created).push(transfer.clone());
        Ok(transfer)
    }
}

// ============================================================================
// Agent and bus
// ============================================================================

enum AgentReply {
    Approve(String),
    Reject,
    Hold,
}

/// Agent recording every call as a string.
pub struct FakeAgent {
    reply: AgentReply,
    calls: Mutex<Vec<String>>,
}

impl FakeAgent {
    pub fn approving() -> Self {
        Self {
            reply: AgentReply::Approve(String::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reply: AgentReply::Reject,
            ..Self::approving()
        }
    }

    /// Authorization requests never answer.
    pub fn holding() -> Self {
        Self {
            reply: AgentReply::Hold,
            ..Self::approving()
        }
    }

    /// Approve, suggesting `name` for the object.
    pub fn suggesting(mut self, name: &str) -> Self {
        self.reply = AgentReply::Approve(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Agent for FakeAgent {
    async fn request(&self, transfer: &str) -> Result<String, AgentError> {
        lock(&self.calls).push(format!("Request {transfer}"));
        match &self.reply {
            AgentReply::Approve(name) => Ok(name.clone()),
            AgentReply::Reject => Err(AgentError::Replied {
                name: "org.openobex.Error.Rejected".into(),
                message: "Not Authorized".into(),
            }),
            AgentReply::Hold => std::future::pending().await,
        }
    }

    async fn progress(&self, transfer: &str, transferred: u64) {
        lock(&self.calls).push(format!("Progress {transfer} {transferred}"));
    }

    async fn complete(&self, transfer: &str) {
        lock(&self.calls).push(format!("Complete {transfer}"));
    }

    async fn error(&self, transfer: &str, message: &str) {
        lock(&self.calls).push(format!("Error {transfer} {message}"));
    }

    async fn release(&self) {
        lock(&self.calls).push("Release".to_string());
    }
}

/// In-memory bus.
pub struct FakeBus {
    refuse_exports: bool,
    objects: Mutex<HashMap<String, SessionObject>>,
    retracted: Mutex<Vec<String>>,
    agents: Mutex<HashMap<String, Arc<FakeAgent>>>,
    gone: watch::Sender<HashSet<String>>,
}

impl Default for FakeBus {
    fn default() -> Self {
        Self {
            refuse_exports: false,
            objects: Mutex::new(HashMap::new()),
            retracted: Mutex::new(Vec::new()),
            agents: Mutex::new(HashMap::new()),
            gone: watch::channel(HashSet::new()).0,
        }
    }
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing_exports(mut self) -> Self {
        self.refuse_exports = true;
        self
    }

    /// Serve `agent` for bus name `name`.
    pub fn add_agent(&self, name: &str, agent: FakeAgent) -> Arc<FakeAgent> {
        let agent = Arc::new(agent);
        lock(&self.agents).insert(name.to_string(), agent.clone());
        agent
    }

    pub fn object(&self, path: &str) -> Option<SessionObject> {
        lock(&self.objects).get(path).cloned()
    }

    pub fn retracted(&self) -> Vec<String> {
        lock(&self.retracted).clone()
    }

    /// `name` leaves the bus.
    pub fn vanish(&self, name: &str) {
        self.gone.send_modify(|gone| {
            gone.insert(name.to_string());
        });
    }
}

#[async_trait]
impl Bus for FakeBus {
    async fn export_session(&self, path: &str, object: SessionObject) -> Result<(), BusError> {
        if self.refuse_exports {
            return Err(BusError::Export(path.to_string()));
        }
        let mut objects = lock(&self.objects);
        if objects.contains_key(path) {
            return Err(BusError::AlreadyExported(path.to_string()));
        }
        objects.insert(path.to_string(), object);
        Ok(())
    }

    fn retract_session(&self, path: &str) {
        if lock(&self.objects).remove(path).is_some() {
            lock(&self.retracted).push(path.to_string());
        }
    }

    fn agent(&self, name: &str, _path: &str) -> Arc<dyn Agent> {
        lock(&self.agents)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FakeAgent::approving()))
            .clone()
    }

    async fn owner_vanished(&self, name: &str) {
        let mut rx = self.gone.subscribe();
        let closed = rx.wait_for(|gone| gone.contains(name)).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Probes
// ============================================================================

struct FiredFlag {
    fired: bool,
    dropped: Arc<AtomicBool>,
}

impl Drop for FiredFlag {
    fn drop(&mut self) {
        if !self.fired {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }
}

/// Records connect callback outcomes.
#[derive(Clone, Default)]
pub struct ConnectProbe {
    results: Arc<Mutex<Vec<Result<(), ConnectError>>>>,
    notify: Arc<Notify>,
    dropped: Arc<AtomicBool>,
}

impl ConnectProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> ConnectCallback {
        let results = self.results.clone();
        let notify = self.notify.clone();
        let flag = FiredFlag {
            fired: false,
            dropped: self.dropped.clone(),
        };
        Box::new(move |_session: &Session, res| {
            let mut flag = flag;
            flag.fired = true;
            lock(&results).push(res);
            notify.notify_one();
        })
    }

    pub fn results(&self) -> Vec<Result<(), ConnectError>> {
        lock(&self.results).clone()
    }

    /// Whether a callback was dropped without firing.
    pub fn dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Wait for the first outcome.
    pub async fn wait(&self) -> Result<(), ConnectError> {
        let first = async {
            loop {
                if let Some(res) = lock(&self.results).first().cloned() {
                    return res;
                }
                self.notify.notified().await;
            }
        };
        match tokio::time::timeout(Duration::from_secs(5), first).await {
            Ok(res) => res,
            Err(_) => panic!("connect callback did not fire"),
        }
    }
}

/// Records stored transfer callback outcomes.
#[derive(Clone, Default)]
pub struct TransferProbe {
    results: Arc<Mutex<Vec<Result<(), TransferError>>>>,
}

impl TransferProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> TransferCallback {
        let results = self.results.clone();
        Arc::new(move |_session: &Session, res| lock(&results).push(res))
    }

    pub fn results(&self) -> Vec<Result<(), TransferError>> {
        lock(&self.results).clone()
    }
}

// ============================================================================
// Client wiring
// ============================================================================

/// An [`ObexClient`] over the fakes, with a real [`BluetoothTransport`].
pub struct TestClient {
    pub client: ObexClient,
    pub adapters: Arc<FakeAdapters>,
    pub sdp: Arc<ScriptedSdp>,
    pub rfcomm: Arc<FakeRfcomm>,
    pub transport: BluetoothTransport,
    pub transfers: Arc<FakeTransferFactory>,
    pub bus: Arc<FakeBus>,
}

pub struct TestClientBuilder {
    config: ClientConfig,
    adapters: FakeAdapters,
    sdp: ScriptedSdp,
    rfcomm: FakeRfcomm,
    transfers: FakeTransferFactory,
    bus: FakeBus,
    register_transport: bool,
}

impl TestClientBuilder {
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_adapters(mut self, adapters: FakeAdapters) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_sdp(mut self, sdp: ScriptedSdp) -> Self {
        self.sdp = sdp;
        self
    }

    pub fn with_rfcomm(mut self, rfcomm: FakeRfcomm) -> Self {
        self.rfcomm = rfcomm;
        self
    }

    pub fn with_transfers(mut self, transfers: FakeTransferFactory) -> Self {
        self.transfers = transfers;
        self
    }

    pub fn with_bus(mut self, bus: FakeBus) -> Self {
        self.bus = bus;
        self
    }

    /// Leave the transport registry empty.
    pub fn without_transport(mut self) -> Self {
        self.register_transport = false;
        self
    }

    pub fn build(self) -> TestClient {
        let adapters = Arc::new(self.adapters);
        let sdp = Arc::new(self.sdp);
        let rfcomm = Arc::new(self.rfcomm);
        let transfers = Arc::new(self.transfers);
        let bus = Arc::new(self.bus);

        let transport = BluetoothTransport::new(
            adapters.clone(),
            sdp.clone(),
            rfcomm.clone(),
            self.config.connector_config(),
        );
        let client = ObexClient::new(
            self.config.clone(),
            DriverRegistry::with_defaults(),
            Arc::new(self.config.stream_engine()),
            transfers.clone(),
            bus.clone(),
        );
        if self.register_transport {
            if let Err(e) = client.transports().register(Arc::new(transport.clone())) {
                panic!("transport registration failed: {e}");
            }
        }

        TestClient {
            client,
            adapters,
            sdp,
            rfcomm,
            transport,
            transfers,
            bus,
        }
    }
}

impl Default for TestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClient {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> TestClientBuilder {
        TestClientBuilder {
            config: ClientConfig::default(),
            adapters: FakeAdapters::new(),
            sdp: ScriptedSdp::with_channel(9),
            rfcomm: FakeRfcomm::new(),
            transfers: FakeTransferFactory::new(),
            bus: FakeBus::new(),
            register_transport: true,
        }
    }

    /// A request for `service` on [`FAKE_DESTINATION`].
    pub fn request(&self, service: &str, channel: u8) -> SessionRequest {
        SessionRequest::new(FAKE_DESTINATION, service).channel(channel)
    }

    pub fn create(
        &self,
        service: &str,
        channel: u8,
        on_connect: Option<ConnectCallback>,
    ) -> Result<Session, SessionError> {
        self.client.create_session(self.request(service, channel), on_connect)
    }

    /// Create (or reuse) a session and wait until it is connected.
    pub async fn connected(&self, service: &str, channel: u8) -> Session {
        let probe = ConnectProbe::new();
        let session = match self.create(service, channel, Some(probe.callback())) {
            Ok(s) => s,
            Err(e) => panic!("create_session failed: {e}"),
        };
        if let Err(e) = probe.wait().await {
            panic!("connect failed: {e}");
        }
        settle().await;
        session
    }

    /// RFCOMM streams closed by the client side.
    pub fn rfcomm_disconnects(&self) -> usize {
        self.rfcomm.closed()
    }
}

//! Integration tests for OBEX client flows.
//!
//! These tests drive a real `BluetoothTransport`, the stream OBEX engine and
//! the session state machine against the harness fakes:
//! - Session creation, reuse and connect failures at every stage
//! - Transfer queue ordering and agent authorization
//! - Shutdown and destruction

use std::sync::Arc;

use bytes::Bytes;
use obc_core::{
    client::SessionRequest,
    connector::ConnectStage,
    errors::{ConnectError, TransferError},
    harness::{
        settle, ConnectProbe, FakeAdapters, FakeAgent, FakeBus, FakeRfcomm, FakeTransferFactory,
        ScriptedSdp, TestClient, TransferProbe, FAKE_ADAPTER, FAKE_DESTINATION,
    },
    session::{SessionPhase, TransferStage},
    transfer::Transfer,
    transport::Transport,
};

/// Test: Channel 0 (SDP discovery) and a known channel reach the same state
#[tokio::test]
async fn integration_discovered_and_known_channel_agree() {
    let discovered = TestClient::builder().with_sdp(ScriptedSdp::with_channel(12)).build();
    let known = TestClient::new();

    let a = discovered.connected("OPP", 0).await;
    let b = known.connected("OPP", 12).await;

    assert_eq!(a.phase(), SessionPhase::Connected);
    assert_eq!(b.phase(), SessionPhase::Connected);
    assert_eq!(discovered.rfcomm.attempts()[0].channel, 12);
    assert_eq!(known.rfcomm.attempts()[0].channel, 12);
    assert_eq!(discovered.sdp.searches(), 1);
    assert_eq!(known.sdp.searches(), 0);
    assert_eq!(a.link().unwrap().mtu(), b.link().unwrap().mtu());

    let id = a.connection_id().unwrap();
    assert_eq!(discovered.transport.stage(id), Some(ConnectStage::Connected));
}

/// Test: Creating twice with the same tuple yields one session with two refs
#[tokio::test]
async fn integration_same_tuple_shares_session() {
    let tc = TestClient::new();
    let first = tc.connected("OPP", 9).await;
    let second = tc.connected("OPP", 9).await;

    assert!(first.ptr_eq(&second));
    assert_eq!(first.ref_count(), 2);
    assert_eq!(tc.client.sessions().len(), 1);

    drop(second);
    assert_eq!(first.ref_count(), 1);
    assert_eq!(first.phase(), SessionPhase::Connected);
}

/// Test: OPP without an RFCOMM record fails with "Unable to find service record"
#[tokio::test]
async fn integration_missing_service_record() {
    let tc = TestClient::builder().with_sdp(ScriptedSdp::without_rfcomm()).build();
    let probe = ConnectProbe::new();

    let session = tc.create("OPP", 0, Some(probe.callback())).unwrap();
    let err = probe.wait().await.unwrap_err();
    settle().await;

    assert_eq!(err, ConnectError::ServiceNotFound);
    assert_eq!(err.to_string(), "Unable to find service record");
    assert_eq!(probe.results().len(), 1);
    assert!(tc.rfcomm.attempts().is_empty());
    assert_eq!(session.phase(), SessionPhase::ShuttingDown);
    assert!(tc.client.sessions().is_empty());
    assert_eq!(tc.adapters.released(), vec![FAKE_ADAPTER.to_string()]);
}

/// Test: Every failing stage yields exactly one connect callback
#[tokio::test]
async fn integration_each_failed_stage_reports_once() {
    let cases: Vec<(TestClient, u8, ConnectError)> = vec![
        (
            TestClient::builder().with_adapters(FakeAdapters::new().without_adapters()).build(),
            9,
            ConnectError::NoAdapter,
        ),
        (
            TestClient::builder().with_adapters(FakeAdapters::new().refusing_sessions()).build(),
            9,
            ConnectError::SessionRequest,
        ),
        (
            TestClient::builder().with_sdp(ScriptedSdp::unreachable()).build(),
            0,
            ConnectError::ServiceNotFound,
        ),
        (
            TestClient::builder().with_rfcomm(FakeRfcomm::new().with_obex_response(0xC3)).build(),
            9,
            ConnectError::ObexRejected(0x43),
        ),
    ];

    for (tc, channel, expected) in cases {
        let probe = ConnectProbe::new();
        let session = tc.create("OPP", channel, Some(probe.callback())).unwrap();
        assert_eq!(probe.wait().await, Err(expected.clone()));
        settle().await;

        assert_eq!(probe.results(), vec![Err(expected)]);
        assert_eq!(session.phase(), SessionPhase::ShuttingDown);
        assert_eq!(tc.transport.active_connections(), 0);
    }
}

/// Test: RFCOMM refusal surfaces through the callback
#[tokio::test]
async fn integration_rfcomm_refused() {
    let tc = TestClient::builder().with_rfcomm(FakeRfcomm::refusing()).build();
    let probe = ConnectProbe::new();
    tc.create("FTP", 4, Some(probe.callback())).unwrap();
    assert!(matches!(probe.wait().await, Err(ConnectError::Rfcomm(_))));
}

/// Test: Transfers run one at a time in queue order
#[tokio::test]
async fn integration_one_transfer_in_flight() {
    let tc = TestClient::new();
    let session = tc.connected("OPP", 9).await;
    let probe = TransferProbe::new();

    let first = session.get(None, None, Some("a.vcf"), None, Some(probe.callback())).unwrap();
    let second = session.send("/tmp/b.vcf", None).unwrap();
    let third = session.pull(Some("x-bt/vcard"), "c.vcf", None).unwrap();
    settle().await;

    assert_eq!(session.in_flight(), 1);
    assert_eq!(session.transfer_stage(first), Some(TransferStage::Active));
    assert_eq!(session.transfer_stage(second), Some(TransferStage::Queued));
    assert_eq!(session.transfer_stage(third), Some(TransferStage::Queued));

    let transfers = tc.transfers.created();
    transfers[0].complete();
    settle().await;
    assert_eq!(session.in_flight(), 1);
    assert_eq!(session.transfer_stage(second), Some(TransferStage::Active));
    assert_eq!(transfers[1].started_as(), Some("put"));
    assert!(!transfers[2].started());

    transfers[1].complete();
    settle().await;
    assert_eq!(transfers[2].started_as(), Some("get"));

    transfers[2].complete();
    settle().await;
    assert_eq!(session.queue_len(), 0);
    assert_eq!(probe.results(), vec![Ok(()), Ok(()), Ok(())]);
}

/// Test: Two puts with an agent, the second is authorized after the first completes
#[tokio::test]
async fn integration_agent_authorizes_in_order() {
    let tc = TestClient::new();
    let session = tc.connected("OPP", 9).await;
    let agent = tc.bus.add_agent(":1.7", FakeAgent::approving());
    session.set_agent(":1.7", "/agent").unwrap();

    session.send("/tmp/one.vcf", Some("one.vcf")).unwrap();
    session.send("/tmp/two.vcf", Some("two.vcf")).unwrap();
    settle().await;

    assert_eq!(agent.calls(), vec!["Request /transfer1"]);

    let transfers = tc.transfers.created();
    transfers[0].report(512);
    transfers[0].complete();
    settle().await;

    assert_eq!(
        agent.calls(),
        vec![
            "Request /transfer1",
            "Progress /transfer1 512",
            "Progress /transfer1 1024",
            "Complete /transfer1",
            "Request /transfer2",
        ]
    );
    assert!(transfers[0].is_unregistered());
    assert!(transfers[1].started());
}

/// Test: An agent rejection terminates a lone transfer through the stored callback
#[tokio::test]
async fn integration_agent_rejects_get() {
    let tc = TestClient::new();
    let session = tc.connected("FTP", 10).await;
    let agent = tc.bus.add_agent(":1.7", FakeAgent::rejecting());
    session.set_agent(":1.7", "/agent").unwrap();

    let probe = TransferProbe::new();
    session.get(Some("x-obex/folder-listing"), None, None, None, Some(probe.callback())).unwrap();
    settle().await;

    let results = probe.results();
    assert_eq!(results, vec![Err(TransferError::Rejected("Not Authorized".into()))]);
    assert_eq!(results[0].as_ref().unwrap_err().errno(), -125);
    assert_eq!(session.queue_len(), 0);
    assert!(!tc.transfers.created()[0].started());
    // The agent is not told about its own rejection.
    assert_eq!(agent.calls(), vec!["Request /transfer1"]);
    assert_eq!(session.phase(), SessionPhase::Connected);
}

/// Test: Transfers without a path bypass the agent
#[tokio::test]
async fn integration_pathless_transfers_skip_agent() {
    let tc = TestClient::builder()
        .with_transfers(FakeTransferFactory::new().without_paths())
        .build();
    let session = tc.connected("OPP", 9).await;
    let agent = tc.bus.add_agent(":1.7", FakeAgent::rejecting());
    session.set_agent(":1.7", "/agent").unwrap();

    session.put(Bytes::from_static(b"BEGIN:VCARD\r\nEND:VCARD\r\n"), Some("me.vcf")).unwrap();
    settle().await;

    let t = tc.transfers.created()[0].clone();
    assert_eq!(t.started_as(), Some("put"));
    assert_eq!(t.buffer().as_deref(), Some(&b"BEGIN:VCARD\r\nEND:VCARD\r\n"[..]));
    t.complete();
    settle().await;
    assert!(agent.calls().is_empty());
}

/// Test: Shutdown twice leaves identical state and notifies once
#[tokio::test]
async fn integration_shutdown_twice() {
    let tc = TestClient::new();
    let session = tc.connected("OPP", 9).await;
    let agent = tc.bus.add_agent(":1.7", FakeAgent::holding());
    session.set_agent(":1.7", "/agent").unwrap();
    session.send("/tmp/a", None).unwrap();
    settle().await;

    session.shutdown();
    session.shutdown();
    settle().await;

    let errors = agent.calls().iter().filter(|c| c.starts_with("Error")).count();
    assert_eq!(errors, 1);
    assert_eq!(session.queue_len(), 0);
    assert!(session.link().is_none());
    assert!(session.connection_id().is_none());
    assert_eq!(session.connect(None), Err(obc_core::errors::SessionError::NotConnected));
}

/// Test: Shutdown while connecting fails the connect callback and releases the lease
#[tokio::test]
async fn integration_shutdown_while_connecting() {
    let tc = TestClient::builder()
        .with_adapters(FakeAdapters::new().hanging_sessions())
        .build();
    let probe = ConnectProbe::new();
    let session = tc.create("OPP", 9, Some(probe.callback())).unwrap();
    settle().await;

    let id = session.connection_id().unwrap();
    assert_eq!(tc.transport.stage(id), Some(ConnectStage::SessionRequest));

    session.shutdown();
    assert_eq!(probe.results(), vec![Err(ConnectError::Cancelled)]);
    settle().await;

    assert!(tc.transport.stage(id).is_none());
    assert_eq!(tc.adapters.released(), vec![FAKE_ADAPTER.to_string()]);
}

/// Test: Dropping the last handle destroys the session
#[tokio::test]
async fn integration_last_handle_destroys() {
    let tc = TestClient::new();
    let session = tc.connected("PBAP", 19).await;
    let agent = tc.bus.add_agent(":1.7", FakeAgent::approving());
    session.set_agent(":1.7", "/agent").unwrap();
    let path = session.register().await.unwrap();
    let object = tc.bus.object(&path).unwrap();
    let id = session.connection_id().unwrap();

    drop(session);
    settle().await;

    assert_eq!(agent.calls(), vec!["Release"]);
    assert!(tc.bus.object(&path).is_none());
    assert!(tc.transport.stage(id).is_none());
    assert_eq!(tc.rfcomm_disconnects(), 1);
    assert!(object.properties().is_err());
}

/// Test: Export failure and driver lookup by UUID
#[tokio::test]
async fn integration_register_failure_and_uuid_lookup() {
    let tc = TestClient::builder().with_bus(FakeBus::new().refusing_exports()).build();
    let session = tc
        .client
        .create_session(
            SessionRequest::new(FAKE_DESTINATION, "00001106-0000-1000-8000-00805f9b34fb").channel(10),
            None,
        )
        .unwrap();
    assert_eq!(session.service(), "FTP");
    assert!(session.register().await.is_err());
    assert!(session.path().is_none());
}

/// Test: Transports can be looked up by name through the client
#[tokio::test]
async fn integration_transport_registry() {
    let tc = TestClient::new();
    let found = tc.client.transports().find("Bluetooth").unwrap();
    assert_eq!(found.name(), "Bluetooth");
    assert!(tc.client.transports().register(Arc::new(tc.transport.clone())).is_err());
}

//! BlueZ kernel sockets for the Bluetooth transport: RFCOMM streams and
//! SDP over an L2CAP sequential-packet channel.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bluer::{l2cap, rfcomm, Address, AddressType};
use bytes::Bytes;
use tracing::debug;

use crate::config::ClientConfig;
use crate::connector::{BluetoothTransport, RfcommConnector, SecurityLevel};
use crate::dbus::BluezAdapters;
use crate::errors::SdpError;
use crate::sdp::{SdpChannel, SdpClient};
use crate::transport::BoxedStream;
use crate::types::BdAddr;

const SDP_PSM: u16 = 1;
const SDP_MTU: usize = 672;

fn address(addr: BdAddr) -> Address {
    Address::new(addr.0)
}

/// RFCOMM streams through the kernel socket API.
#[derive(Debug, Clone, Copy, Default)]
pub struct BluerRfcomm;

#[async_trait]
impl RfcommConnector for BluerRfcomm {
    async fn connect(&self, src: BdAddr, dst: BdAddr, channel: u8, security: SecurityLevel) -> io::Result<BoxedStream> {
        let socket = rfcomm::Socket::new()?;
        socket.bind(rfcomm::SocketAddr::new(address(src), 0))?;
        socket.set_security(rfcomm::Security {
            level: match security {
                SecurityLevel::Low => rfcomm::SecurityLevel::Low,
                SecurityLevel::Medium => rfcomm::SecurityLevel::Medium,
                SecurityLevel::High => rfcomm::SecurityLevel::High,
            },
            key_size: 0,
        })?;

        debug!(dst = %dst, channel, "rfcomm connect");
        let stream = socket.connect(rfcomm::SocketAddr::new(address(dst), channel)).await?;
        Ok(Box::new(stream))
    }
}

/// SDP client over L2CAP PSM 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2capSdpClient;

struct L2capSdpChannel {
    socket: l2cap::SeqPacket,
}

#[async_trait]
impl SdpChannel for L2capSdpChannel {
    async fn send(&mut self, pdu: &[u8]) -> Result<(), SdpError> {
        self.socket.send(pdu).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes, SdpError> {
        let mut buf = vec![0u8; SDP_MTU];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl SdpClient for L2capSdpClient {
    async fn connect(&self, src: BdAddr, dst: BdAddr) -> Result<Box<dyn SdpChannel>, SdpError> {
        let socket = l2cap::Socket::new_seq_packet()?;
        socket.bind(l2cap::SocketAddr::new(address(src), AddressType::BrEdr, 0))?;
        let seq = socket
            .connect(l2cap::SocketAddr::new(address(dst), AddressType::BrEdr, SDP_PSM))
            .await?;
        debug!(dst = %dst, "sdp channel open");
        Ok(Box::new(L2capSdpChannel { socket: seq }))
    }
}

/// The Bluetooth transport wired to BlueZ on the system bus.
pub async fn system_transport(config: &ClientConfig) -> zbus::Result<BluetoothTransport> {
    let adapters = BluezAdapters::system().await?;
    Ok(BluetoothTransport::new(
        Arc::new(adapters),
        Arc::new(L2capSdpClient),
        Arc::new(BluerRfcomm),
        config.connector_config(),
    ))
}

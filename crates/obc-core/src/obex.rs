//! OBEX engine seam and a minimal CONNECT implementation.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::errors::ObexError;
use crate::transport::BoxedStream;

pub const OBEX_VERSION: u8 = 0x10;
pub const OP_CONNECT: u8 = 0x80;
/// Success response code, final bit masked off.
pub const RSP_SUCCESS: u8 = 0x20;
pub const FINAL_BIT: u8 = 0x80;

pub const HDR_TARGET: u8 = 0x46;
pub const HDR_WHO: u8 = 0x4A;
pub const HDR_CONNECTION_ID: u8 = 0xCB;

/// Smallest packet size a peer may advertise.
pub const MIN_MTU: u16 = 255;

/// A connected OBEX link.
pub struct ObexLink {
    stream: Mutex<BoxedStream>,
    mtu: u16,
    connection_id: Option<u32>,
    target: Option<Bytes>,
}

impl ObexLink {
    pub fn new(stream: BoxedStream, mtu: u16, connection_id: Option<u32>, target: Option<Bytes>) -> Self {
        Self {
            stream: Mutex::new(stream),
            mtu,
            connection_id,
            target,
        }
    }

    /// Negotiated packet size.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.connection_id
    }

    pub fn target(&self) -> Option<&[u8]> {
        self.target.as_deref()
    }

    /// Exclusive access to the underlying stream.
    pub async fn stream(&self) -> MutexGuard<'_, BoxedStream> {
        self.stream.lock().await
    }
}

impl std::fmt::Debug for ObexLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObexLink")
            .field("mtu", &self.mtu)
            .field("connection_id", &self.connection_id)
            .field("target", &self.target.as_ref().map(hex::encode))
            .finish()
    }
}

/// Performs the OBEX CONNECT handshake over a raw stream.
#[async_trait]
pub trait ObexEngine: Send + Sync {
    async fn connect(&self, stream: BoxedStream, target: Option<&[u8]>) -> Result<ObexLink, ObexError>;
}

/// CONNECT over any byte stream.
#[derive(Debug, Clone)]
pub struct StreamEngine {
    pub mtu: u16,
}

impl Default for StreamEngine {
    fn default() -> Self {
        Self { mtu: 4096 }
    }
}

/// Encode a CONNECT request.
pub fn encode_connect(mtu: u16, target: Option<&[u8]>) -> Bytes {
    let mut out = BytesMut::new();
    out.put_u8(OP_CONNECT);
    out.put_u16(0); // patched below
    out.put_u8(OBEX_VERSION);
    out.put_u8(0x00);
    out.put_u16(mtu);
    if let Some(t) = target {
        out.put_u8(HDR_TARGET);
        out.put_u16((t.len() + 3) as u16);
        out.put_slice(t);
    }
    let len = out.len() as u16;
    out[1..3].copy_from_slice(&len.to_be_bytes());
    out.freeze()
}

/// Fields of a successful CONNECT response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub version: u8,
    pub mtu: u16,
    pub connection_id: Option<u32>,
    pub who: Option<Bytes>,
}

/// Decode a complete CONNECT response packet.
pub fn decode_connect_response(packet: &[u8]) -> Result<ConnectResponse, ObexError> {
    if packet.len() < 3 {
        return Err(ObexError::Malformed("short response".into()));
    }
    let code = packet[0];
    if code != (RSP_SUCCESS | FINAL_BIT) {
        return Err(ObexError::Rejected(code & !FINAL_BIT));
    }

    let mut body = &packet[3..];
    if body.len() < 4 {
        return Err(ObexError::Malformed("connect response without parameters".into()));
    }
    let version = body.get_u8();
    let _flags = body.get_u8();
    let mtu = body.get_u16();

    let mut connection_id = None;
    let mut who = None;
    while body.has_remaining() {
        let id = body.get_u8();
        match id >> 6 {
            // Length-prefixed: unicode text or byte sequence.
            0 | 1 => {
                if body.remaining() < 2 {
                    return Err(ObexError::Malformed("truncated header length".into()));
                }
                let len = body.get_u16() as usize;
                let data_len = len
                    .checked_sub(3)
                    .filter(|n| *n <= body.remaining())
                    .ok_or_else(|| ObexError::Malformed(format!("bad length for header 0x{id:02x}")))?;
                if id == HDR_WHO {
                    who = Some(Bytes::copy_from_slice(&body[..data_len]));
                }
                body.advance(data_len);
            }
            2 => {
                if !body.has_remaining() {
                    return Err(ObexError::Malformed("truncated byte header".into()));
                }
                body.advance(1);
            }
            _ => {
                if body.remaining() < 4 {
                    return Err(ObexError::Malformed("truncated quad header".into()));
                }
                let v = body.get_u32();
                if id == HDR_CONNECTION_ID {
                    connection_id = Some(v);
                }
            }
        }
    }

    Ok(ConnectResponse {
        version,
        mtu,
        connection_id,
        who,
    })
}

#[async_trait]
impl ObexEngine for StreamEngine {
    async fn connect(&self, mut stream: BoxedStream, target: Option<&[u8]>) -> Result<ObexLink, ObexError> {
        let req = encode_connect(self.mtu, target);
        debug!(target = ?target.map(hex::encode), mtu = self.mtu, "obex connect");
        stream.write_all(&req).await?;
        stream.flush().await?;

        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        let len = u16::from_be_bytes([head[1], head[2]]) as usize;
        if len < 3 {
            return Err(ObexError::Malformed(format!("packet length {len}")));
        }
        let mut packet = vec![0u8; len];
        packet[..3].copy_from_slice(&head);
        stream.read_exact(&mut packet[3..]).await?;

        let rsp = decode_connect_response(&packet).map_err(|e| {
            warn!(error = %e, "obex connect refused");
            e
        })?;
        if rsp.mtu < MIN_MTU {
            return Err(ObexError::Malformed(format!("peer mtu {} below minimum", rsp.mtu)));
        }

        let mtu = self.mtu.min(rsp.mtu);
        debug!(mtu, connection_id = ?rsp.connection_id, "obex connected");
        Ok(ObexLink::new(
            stream,
            mtu,
            rsp.connection_id,
            target.map(Bytes::copy_from_slice),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn success(mtu: u16, conn_id: Option<u32>) -> Vec<u8> {
        let mut p = vec![0xA0, 0, 0, OBEX_VERSION, 0, (mtu >> 8) as u8, mtu as u8];
        if let Some(id) = conn_id {
            p.push(HDR_CONNECTION_ID);
            p.extend_from_slice(&id.to_be_bytes());
        }
        let len = p.len() as u16;
        p[1..3].copy_from_slice(&len.to_be_bytes());
        p
    }

    #[test]
    fn test_encode_connect_with_target() {
        let target = [0xF9, 0xEC, 0x7B, 0xC4];
        let pkt = encode_connect(4096, Some(&target));
        assert_eq!(&pkt[..], &[0x80, 0x00, 0x0E, 0x10, 0x00, 0x10, 0x00, 0x46, 0x00, 0x07, 0xF9, 0xEC, 0x7B, 0xC4]);
        assert_eq!(encode_connect(255, None).len(), 7);
    }

    #[test]
    fn test_decode_success() {
        let rsp = decode_connect_response(&success(1024, Some(7))).unwrap();
        assert_eq!(rsp.mtu, 1024);
        assert_eq!(rsp.connection_id, Some(7));
    }

    #[test]
    fn test_decode_rejected() {
        assert_eq!(decode_connect_response(&[0xC3, 0x00, 0x03]), Err(ObexError::Rejected(0x43)));
    }

    #[test]
    fn test_decode_truncated_header() {
        let mut p = success(1024, None);
        p.extend_from_slice(&[HDR_WHO, 0x00, 0x09, 0x01]);
        assert!(matches!(decode_connect_response(&p), Err(ObexError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_engine_negotiates_mtu() {
        let (local, mut peer) = duplex(1024);
        tokio::spawn(async move {
            let mut req = [0u8; 14];
            peer.read_exact(&mut req).await.unwrap();
            assert_eq!(req[0], OP_CONNECT);
            peer.write_all(&success(512, Some(0x1234))).await.unwrap();
            // Keep the peer open until the link is dropped.
            let mut rest = Vec::new();
            let _ = peer.read_to_end(&mut rest).await;
        });

        let engine = StreamEngine { mtu: 4096 };
        let link = engine.connect(Box::new(local), Some(&[1, 2, 3, 4])).await.unwrap();
        assert_eq!(link.mtu(), 512);
        assert_eq!(link.connection_id(), Some(0x1234));
        assert_eq!(link.target(), Some(&[1u8, 2, 3, 4][..]));
    }

    #[tokio::test]
    async fn test_engine_rejected() {
        let (local, mut peer) = duplex(1024);
        tokio::spawn(async move {
            let mut req = [0u8; 7];
            peer.read_exact(&mut req).await.unwrap();
            peer.write_all(&[0xC1, 0x00, 0x03]).await.unwrap();
        });

        let err = StreamEngine::default().connect(Box::new(local), None).await.unwrap_err();
        assert_eq!(err, ObexError::Rejected(0x41));
    }

    #[tokio::test]
    async fn test_engine_peer_hangs_up() {
        let (local, peer) = duplex(64);
        drop(peer);
        let err = StreamEngine::default().connect(Box::new(local), None).await.unwrap_err();
        assert!(matches!(err, ObexError::Io(_)));
    }
}

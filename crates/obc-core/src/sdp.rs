//! SDP service resolution.
//!
//! A small SDP client: the data element codec, the ServiceSearchAttribute
//! PDU exchange (with continuation), and the walk over the returned
//! attribute lists that extracts the first RFCOMM channel. Socket I/O is
//! behind [`SdpClient`] / [`SdpChannel`].

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::errors::SdpError;
use crate::types::{BdAddr, Uuid128};

/// ProtocolDescriptorList attribute id.
pub const ATTR_PROTOCOL_DESCRIPTOR_LIST: u16 = 0x0004;
/// RFCOMM protocol UUID (16-bit alias).
pub const RFCOMM_UUID: u16 = 0x0003;
/// L2CAP protocol UUID (16-bit alias).
pub const L2CAP_UUID: u16 = 0x0100;

const PDU_ERROR_RSP: u8 = 0x01;
const PDU_SEARCH_ATTR_REQ: u8 = 0x06;
const PDU_SEARCH_ATTR_RSP: u8 = 0x07;

const MAX_DEPTH: usize = 16;
const MAX_CONTINUATION_LEN: usize = 16;
const MAX_ROUNDS: usize = 64;
const MAX_ATTR_BYTES: u16 = 0xFFFF;

/// Full attribute range `0x0000..=0xFFFF`, encoded as a 32-bit range value.
pub const FULL_RANGE: u32 = 0x0000_FFFF;

// ============================================================================
// Data elements
// ============================================================================

/// UUID as carried in an SDP data element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpUuid {
    U16(u16),
    U32(u32),
    U128(Uuid128),
}

impl SdpUuid {
    /// 16-bit alias, when the UUID has one.
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            SdpUuid::U16(v) => Some(*v),
            SdpUuid::U32(v) => u16::try_from(*v).ok(),
            SdpUuid::U128(u) => u.as_u16(),
        }
    }
}

/// An SDP data element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataElement {
    Nil,
    /// Unsigned integer; `width` is 1, 2, 4, 8 or 16 bytes
    Unsigned { width: u8, value: u128 },
    /// Signed integer; `width` is 1, 2, 4, 8 or 16 bytes
    Signed { width: u8, value: i128 },
    Uuid(SdpUuid),
    /// Text string; not required to be UTF-8
    Text(Vec<u8>),
    Bool(bool),
    Sequence(Vec<DataElement>),
    Alternative(Vec<DataElement>),
    Url(Vec<u8>),
}

impl DataElement {
    pub fn u8(v: u8) -> Self {
        DataElement::Unsigned { width: 1, value: v as u128 }
    }

    pub fn u16(v: u16) -> Self {
        DataElement::Unsigned { width: 2, value: v as u128 }
    }

    pub fn u32(v: u32) -> Self {
        DataElement::Unsigned { width: 4, value: v as u128 }
    }

    pub fn uuid16(v: u16) -> Self {
        DataElement::Uuid(SdpUuid::U16(v))
    }

    /// Parse one element from the front of `buf`, returning it and the
    /// number of bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<(DataElement, usize), SdpError> {
        Self::parse_at_depth(buf, 0)
    }

    fn parse_at_depth(buf: &[u8], depth: usize) -> Result<(DataElement, usize), SdpError> {
        if depth > MAX_DEPTH {
            return Err(SdpError::Malformed("nesting too deep".into()));
        }
        let (kind, len, hdr) = read_header(buf)?;
        let body = buf
            .get(hdr..hdr + len)
            .ok_or_else(|| SdpError::Malformed(format!("element truncated: need {} bytes", hdr + len)))?;

        let elem = match kind {
            0 => DataElement::Nil,
            1 => DataElement::Unsigned { width: len as u8, value: be_uint(body) },
            2 => {
                let raw = be_uint(body);
                let shift = 128 - 8 * len as u32;
                let value = if shift >= 128 { 0 } else { ((raw << shift) as i128) >> shift };
                DataElement::Signed { width: len as u8, value }
            }
            3 => DataElement::Uuid(match len {
                2 => SdpUuid::U16(be_uint(body) as u16),
                4 => SdpUuid::U32(be_uint(body) as u32),
                16 => {
                    let mut b = [0u8; 16];
                    b.copy_from_slice(body);
                    SdpUuid::U128(Uuid128(b))
                }
                _ => return Err(SdpError::Malformed(format!("uuid of {len} bytes"))),
            }),
            4 => DataElement::Text(body.to_vec()),
            5 => DataElement::Bool(body.first().copied().unwrap_or(0) != 0),
            6 | 7 => {
                let mut items = Vec::new();
                let mut off = 0;
                while off < body.len() {
                    let (item, used) = Self::parse_at_depth(&body[off..], depth + 1)?;
                    items.push(item);
                    off += used;
                }
                if kind == 6 {
                    DataElement::Sequence(items)
                } else {
                    DataElement::Alternative(items)
                }
            }
            8 => DataElement::Url(body.to_vec()),
            other => return Err(SdpError::Malformed(format!("unknown element type {other}"))),
        };
        Ok((elem, hdr + len))
    }

    /// Append the wire encoding of this element to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            DataElement::Nil => out.put_u8(0),
            DataElement::Unsigned { width, value } => {
                out.put_u8((1 << 3) | fixed_size_index(*width));
                put_be_uint(out, *value, *width);
            }
            DataElement::Signed { width, value } => {
                out.put_u8((2 << 3) | fixed_size_index(*width));
                put_be_uint(out, *value as u128, *width);
            }
            DataElement::Uuid(SdpUuid::U16(v)) => {
                out.put_u8((3 << 3) | 1);
                out.put_u16(*v);
            }
            DataElement::Uuid(SdpUuid::U32(v)) => {
                out.put_u8((3 << 3) | 2);
                out.put_u32(*v);
            }
            DataElement::Uuid(SdpUuid::U128(u)) => {
                out.put_u8((3 << 3) | 4);
                out.put_slice(u.as_bytes());
            }
            DataElement::Text(t) => put_variable(out, 4, t),
            DataElement::Bool(b) => {
                out.put_u8(5 << 3);
                out.put_u8(*b as u8);
            }
            DataElement::Sequence(items) | DataElement::Alternative(items) => {
                let kind = if matches!(self, DataElement::Sequence(_)) { 6 } else { 7 };
                let mut body = BytesMut::new();
                for item in items {
                    item.encode(&mut body);
                }
                put_variable(out, kind, &body);
            }
            DataElement::Url(u) => put_variable(out, 8, u),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }

    fn items(&self) -> Option<&[DataElement]> {
        match self {
            DataElement::Sequence(v) | DataElement::Alternative(v) => Some(v),
            _ => None,
        }
    }
}

/// Decode a data element header: (type, body length, header length).
fn read_header(buf: &[u8]) -> Result<(u8, usize, usize), SdpError> {
    let d = *buf.first().ok_or_else(|| SdpError::Malformed("empty element".into()))?;
    let kind = d >> 3;
    let index = d & 0x07;

    if kind == 0 {
        return Ok((0, 0, 1));
    }

    let (len, hdr) = match index {
        0 => (1, 1),
        1 => (2, 1),
        2 => (4, 1),
        3 => (8, 1),
        4 => (16, 1),
        5 | 6 | 7 => {
            let n = 1usize << (index - 5);
            let raw = buf
                .get(1..1 + n)
                .ok_or_else(|| SdpError::Malformed("truncated length".into()))?;
            (be_uint(raw) as usize, 1 + n)
        }
        _ => unreachable!(),
    };

    let fixed = matches!(kind, 1 | 2 | 3 | 5);
    if fixed && index > 4 {
        return Err(SdpError::Malformed(format!("type {kind} with variable size")));
    }
    if !fixed && index < 5 {
        return Err(SdpError::Malformed(format!("type {kind} with fixed size")));
    }
    Ok((kind, len, hdr))
}

fn be_uint(b: &[u8]) -> u128 {
    b.iter().fold(0u128, |acc, x| (acc << 8) | *x as u128)
}

fn put_be_uint(out: &mut BytesMut, value: u128, width: u8) {
    let bytes = value.to_be_bytes();
    out.put_slice(&bytes[16 - width as usize..]);
}

fn fixed_size_index(width: u8) -> u8 {
    match width {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => 4,
    }
}

fn put_variable(out: &mut BytesMut, kind: u8, body: &[u8]) {
    let len = body.len();
    if len <= u8::MAX as usize {
        out.put_u8((kind << 3) | 5);
        out.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8((kind << 3) | 6);
        out.put_u16(len as u16);
    } else {
        out.put_u8((kind << 3) | 7);
        out.put_u32(len as u32);
    }
    out.put_slice(body);
}

// ============================================================================
// PDUs
// ============================================================================

/// A ServiceSearchAttributeRequest.
#[derive(Debug, Clone)]
pub struct SearchAttrRequest {
    pub transaction: u16,
    pub uuid: Uuid128,
    pub max_bytes: u16,
    pub range: u32,
    pub continuation: Vec<u8>,
}

impl SearchAttrRequest {
    pub fn encode(&self) -> Bytes {
        let mut params = BytesMut::new();
        DataElement::Sequence(vec![DataElement::Uuid(SdpUuid::U128(self.uuid))]).encode(&mut params);
        params.put_u16(self.max_bytes);
        DataElement::Sequence(vec![DataElement::u32(self.range)]).encode(&mut params);
        params.put_u8(self.continuation.len() as u8);
        params.put_slice(&self.continuation);

        let mut out = BytesMut::with_capacity(5 + params.len());
        out.put_u8(PDU_SEARCH_ATTR_REQ);
        out.put_u16(self.transaction);
        out.put_u16(params.len() as u16);
        out.put_slice(&params);
        out.freeze()
    }
}

/// A decoded response PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchAttrResponse {
    Attributes { lists: Bytes, continuation: Vec<u8> },
    Error(u16),
}

impl SearchAttrResponse {
    /// Encode as the response to transaction `tid`.
    pub fn encode(&self, tid: u16) -> Bytes {
        let mut params = BytesMut::new();
        let id = match self {
            SearchAttrResponse::Error(code) => {
                params.put_u16(*code);
                PDU_ERROR_RSP
            }
            SearchAttrResponse::Attributes { lists, continuation } => {
                params.put_u16(lists.len() as u16);
                params.put_slice(lists);
                params.put_u8(continuation.len() as u8);
                params.put_slice(continuation);
                PDU_SEARCH_ATTR_RSP
            }
        };
        let mut out = BytesMut::with_capacity(5 + params.len());
        out.put_u8(id);
        out.put_u16(tid);
        out.put_u16(params.len() as u16);
        out.put_slice(&params);
        out.freeze()
    }

    /// Decode a response, checking it answers transaction `tid`.
    pub fn decode(pdu: &[u8], tid: u16) -> Result<Self, SdpError> {
        if pdu.len() < 5 {
            return Err(SdpError::Malformed("short pdu".into()));
        }
        let id = pdu[0];
        let rsp_tid = u16::from_be_bytes([pdu[1], pdu[2]]);
        let plen = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
        let params = pdu
            .get(5..5 + plen)
            .ok_or_else(|| SdpError::Malformed("parameters truncated".into()))?;

        if rsp_tid != tid {
            return Err(SdpError::Malformed(format!("transaction {rsp_tid} does not match {tid}")));
        }

        match id {
            PDU_ERROR_RSP => {
                let code = params
                    .get(0..2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]))
                    .ok_or_else(|| SdpError::Malformed("error pdu without code".into()))?;
                Ok(SearchAttrResponse::Error(code))
            }
            PDU_SEARCH_ATTR_RSP => {
                let count = params
                    .get(0..2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
                    .ok_or_else(|| SdpError::Malformed("missing byte count".into()))?;
                let lists = params
                    .get(2..2 + count)
                    .ok_or_else(|| SdpError::Malformed("attribute lists truncated".into()))?;
                let cont_len = *params
                    .get(2 + count)
                    .ok_or_else(|| SdpError::Malformed("missing continuation".into()))?
                    as usize;
                if cont_len > MAX_CONTINUATION_LEN {
                    return Err(SdpError::Malformed("continuation state too long".into()));
                }
                let continuation = params
                    .get(3 + count..3 + count + cont_len)
                    .ok_or_else(|| SdpError::Malformed("continuation truncated".into()))?
                    .to_vec();
                Ok(SearchAttrResponse::Attributes {
                    lists: Bytes::copy_from_slice(lists),
                    continuation,
                })
            }
            other => Err(SdpError::Malformed(format!("unexpected pdu 0x{other:02x}"))),
        }
    }
}

// ============================================================================
// Client seam
// ============================================================================

/// An open SDP session exchanging whole PDUs.
#[async_trait]
pub trait SdpChannel: Send {
    async fn send(&mut self, pdu: &[u8]) -> Result<(), SdpError>;
    async fn recv(&mut self) -> Result<Bytes, SdpError>;
}

/// Opens SDP sessions to remote devices.
#[async_trait]
pub trait SdpClient: Send + Sync {
    async fn connect(&self, src: BdAddr, dst: BdAddr) -> Result<Box<dyn SdpChannel>, SdpError>;
}

/// Run a ServiceSearchAttribute query for `uuid` over the full attribute
/// range, following continuation states, and return the concatenated
/// attribute lists.
pub async fn service_search_attr(chan: &mut dyn SdpChannel, uuid: &Uuid128) -> Result<Bytes, SdpError> {
    let mut collected = BytesMut::new();
    let mut continuation = Vec::new();

    for round in 0..MAX_ROUNDS {
        let tid = round as u16 + 1;
        let req = SearchAttrRequest {
            transaction: tid,
            uuid: *uuid,
            max_bytes: MAX_ATTR_BYTES,
            range: FULL_RANGE,
            continuation,
        };
        let pdu = req.encode();
        trace!(pdu = %hex::encode(&pdu), "sdp request");
        chan.send(&pdu).await?;

        let rsp = chan.recv().await?;
        trace!(pdu = %hex::encode(&rsp), "sdp response");

        match SearchAttrResponse::decode(&rsp, tid)? {
            SearchAttrResponse::Error(code) => return Err(SdpError::ErrorResponse(code)),
            SearchAttrResponse::Attributes { lists, continuation: next } => {
                collected.extend_from_slice(&lists);
                if next.is_empty() {
                    debug!(bytes = collected.len(), rounds = round + 1, "sdp search complete");
                    return Ok(collected.freeze());
                }
                continuation = next;
            }
        }
    }
    Err(SdpError::Malformed("too many continuation rounds".into()))
}

// ============================================================================
// Record walk
// ============================================================================

/// Extract the first RFCOMM channel from a ServiceSearchAttribute result.
///
/// The result must be a non-empty sequence of records. Records are checked
/// in order and the walk stops at the first one that does not parse.
pub fn first_rfcomm_channel(lists: &[u8]) -> Result<u8, SdpError> {
    let (kind, len, hdr) = read_header(lists)?;
    if kind != 6 || len == 0 {
        return Err(SdpError::Malformed("attribute lists are not a sequence".into()));
    }

    let mut rest = &lists[hdr..];
    while !rest.is_empty() {
        let (record, used) = match DataElement::parse(rest) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "stopping at malformed sdp record");
                break;
            }
        };
        if used == 0 {
            break;
        }
        let Some(attrs) = record.items().filter(|_| matches!(record, DataElement::Sequence(_))) else {
            break;
        };
        if let Some(ch) = record_rfcomm_channel(attrs) {
            return Ok(ch);
        }
        rest = &rest[used..];
    }
    Err(SdpError::NoChannel)
}

fn record_rfcomm_channel(attrs: &[DataElement]) -> Option<u8> {
    let protos = attrs.chunks(2).find_map(|pair| match pair {
        [DataElement::Unsigned { value, .. }, v] if *value == ATTR_PROTOCOL_DESCRIPTOR_LIST as u128 => Some(v),
        _ => None,
    })?;

    // A single stack, or an alternative of stacks.
    let stacks: Vec<&[DataElement]> = match protos {
        DataElement::Alternative(alts) => alts.iter().filter_map(|s| s.items()).collect(),
        DataElement::Sequence(stack) => vec![stack.as_slice()],
        _ => return None,
    };

    stacks
        .into_iter()
        .flat_map(|stack| stack.iter())
        .filter_map(|proto| proto.items())
        .find_map(|proto| match proto {
            [DataElement::Uuid(u), DataElement::Unsigned { value, .. }, ..]
                if u.as_u16() == Some(RFCOMM_UUID) && *value > 0 && *value <= u8::MAX as u128 =>
            {
                Some(*value as u8)
            }
            _ => None,
        })
}

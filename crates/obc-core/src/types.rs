//! Shared value types: Bluetooth device addresses and 128-bit UUIDs.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error parsing an address or UUID string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid bluetooth address: {0}")]
    Address(String),
    #[error("invalid uuid: {0}")]
    Uuid(String),
}

// ============================================================================
// BdAddr
// ============================================================================

/// A Bluetooth device address, stored most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    /// The wildcard address (`00:00:00:00:00:00`), used when binding to any adapter.
    pub const ANY: BdAddr = BdAddr([0; 6]);

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }
}

impl FromStr for BdAddr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseError::Address(s.to_string()));
        }
        let mut out = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 || !part.bytes().all(|c| c.is_ascii_hexdigit()) {
                return Err(ParseError::Address(s.to_string()));
            }
            out[i] = u8::from_str_radix(part, 16).map_err(|_| ParseError::Address(s.to_string()))?;
        }
        Ok(BdAddr(out))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

// ============================================================================
// Uuid128
// ============================================================================

/// Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`.
const BASE_UUID: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
];

/// A 128-bit UUID in network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uuid128(pub [u8; 16]);

impl Uuid128 {
    /// Expand a 16-bit assigned number onto the Bluetooth base UUID.
    pub fn from_u16(short: u16) -> Self {
        Self::from_u32(short as u32)
    }

    /// Expand a 32-bit assigned number onto the Bluetooth base UUID.
    pub fn from_u32(short: u32) -> Self {
        let mut b = BASE_UUID;
        b[..4].copy_from_slice(&short.to_be_bytes());
        Uuid128(b)
    }

    /// The 16-bit alias, if this UUID lies on the base UUID with a 16-bit value.
    pub fn as_u16(&self) -> Option<u16> {
        if self.0[4..] != BASE_UUID[4..] || self.0[0] != 0 || self.0[1] != 0 {
            return None;
        }
        Some(u16::from_be_bytes([self.0[2], self.0[3]]))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl FromStr for Uuid128 {
    type Err = ParseError;

    /// Only the canonical `8-4-4-4-12` form is accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];

        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != GROUPS.len() {
            return Err(ParseError::Uuid(s.to_string()));
        }

        let mut out = [0u8; 16];
        let mut idx = 0;
        for (part, len) in parts.iter().zip(GROUPS) {
            if part.len() != len || !part.bytes().all(|c| c.is_ascii_hexdigit()) {
                return Err(ParseError::Uuid(s.to_string()));
            }
            let bytes = hex::decode(part).map_err(|_| ParseError::Uuid(s.to_string()))?;
            out[idx..idx + bytes.len()].copy_from_slice(&bytes);
            idx += bytes.len();
        }
        Ok(Uuid128(out))
    }
}

impl fmt::Display for Uuid128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = hex::encode(self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &h[0..8],
            &h[8..12],
            &h[12..16],
            &h[16..20],
            &h[20..32]
        )
    }
}

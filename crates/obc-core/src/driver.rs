//! Service drivers.
//!
//! A driver describes one OBEX profile: its service name, the UUID the
//! transport resolves, and the optional Target header sent on CONNECT.

use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::errors::BusError;
use crate::session::Session;

/// Object Push.
pub const OPP_UUID: &str = "00001105-0000-1000-8000-00805f9b34fb";
/// File Transfer.
pub const FTP_UUID: &str = "00001106-0000-1000-8000-00805f9b34fb";
/// Phonebook Access (server role).
pub const PBAP_UUID: &str = "0000112f-0000-1000-8000-00805f9b34fb";
/// IrMC Sync.
pub const SYNC_UUID: &str = "00001104-0000-1000-8000-00805f9b34fb";
/// Message Access (server role).
pub const MAP_UUID: &str = "00001132-0000-1000-8000-00805f9b34fb";
/// Nokia PC Suite.
pub const PCSUITE_UUID: &str = "00005005-0000-1000-8000-0002ee000001";

const FTP_TARGET: [u8; 16] = [
    0xF9, 0xEC, 0x7B, 0xC4, 0x95, 0x3C, 0x11, 0xD2, 0x98, 0x4E, 0x52, 0x54, 0x00, 0xDC, 0x9E, 0x09,
];
const PBAP_TARGET: [u8; 16] = [
    0x79, 0x61, 0x35, 0xF0, 0xF0, 0xC5, 0x11, 0xD8, 0x09, 0x66, 0x08, 0x00, 0x20, 0x0C, 0x9A, 0x66,
];
const SYNC_TARGET: &[u8] = b"IRMC-SYNC";
const MAP_TARGET: [u8; 16] = [
    0xBB, 0x58, 0x2B, 0x40, 0x42, 0x0C, 0x11, 0xDB, 0xB0, 0xDE, 0x08, 0x00, 0x20, 0x0C, 0x9A, 0x66,
];

/// A profile driver.
pub trait Driver: Send + Sync {
    fn service(&self) -> &str;

    fn uuid(&self) -> &str;

    fn target(&self) -> Option<&[u8]>;

    /// Called once the session object is exported at `path`.
    fn probe(&self, _path: &str, _session: &Session) -> Result<(), BusError> {
        Ok(())
    }

    /// Called before the session object at `path` is retracted.
    fn remove(&self, _path: &str) {}

    /// Whether `pattern` names this driver, by service or UUID.
    fn matches(&self, pattern: &str) -> bool {
        self.service().eq_ignore_ascii_case(pattern) || self.uuid().eq_ignore_ascii_case(pattern)
    }
}

/// A driver with no probe/remove behaviour beyond its descriptor.
#[derive(Debug, Clone)]
pub struct ServiceDriver {
    service: String,
    uuid: String,
    target: Option<Bytes>,
}

impl ServiceDriver {
    pub fn new(service: &str, uuid: &str, target: Option<&[u8]>) -> Self {
        Self {
            service: service.to_string(),
            uuid: uuid.to_string(),
            target: target.map(Bytes::copy_from_slice),
        }
    }
}

impl Driver for ServiceDriver {
    fn service(&self) -> &str {
        &self.service
    }

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn target(&self) -> Option<&[u8]> {
        self.target.as_deref()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("driver {0} already registered")]
    Duplicate(String),
}

/// Known drivers, in registration order.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<Vec<Arc<dyn Driver>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the stock OPP, FTP, PBAP, SYNC, MAP and PCSUITE drivers.
    pub fn with_defaults() -> Self {
        let reg = Self::new();
        let stock = [
            ServiceDriver::new("OPP", OPP_UUID, None),
            ServiceDriver::new("FTP", FTP_UUID, Some(&FTP_TARGET)),
            ServiceDriver::new("PBAP", PBAP_UUID, Some(&PBAP_TARGET)),
            ServiceDriver::new("SYNC", SYNC_UUID, Some(SYNC_TARGET)),
            ServiceDriver::new("MAP", MAP_UUID, Some(&MAP_TARGET)),
            ServiceDriver::new("PCSUITE", PCSUITE_UUID, Some(&FTP_TARGET)),
        ];
        {
            let mut drivers = reg.drivers.write().unwrap_or_else(PoisonError::into_inner);
            for d in stock {
                drivers.push(Arc::new(d));
            }
        }
        reg
    }

    pub fn register(&self, driver: Arc<dyn Driver>) -> Result<(), DriverError> {
        let mut drivers = self.drivers.write().unwrap_or_else(PoisonError::into_inner);
        if drivers.iter().any(|d| d.service().eq_ignore_ascii_case(driver.service())) {
            return Err(DriverError::Duplicate(driver.service().to_string()));
        }
        debug!(service = driver.service(), uuid = driver.uuid(), "driver registered");
        drivers.push(driver);
        Ok(())
    }

    pub fn unregister(&self, service: &str) -> Option<Arc<dyn Driver>> {
        let mut drivers = self.drivers.write().unwrap_or_else(PoisonError::into_inner);
        let idx = drivers.iter().position(|d| d.service().eq_ignore_ascii_case(service))?;
        Some(drivers.remove(idx))
    }

    /// Find a driver by service name or UUID, ignoring case.
    pub fn find(&self, pattern: &str) -> Option<Arc<dyn Driver>> {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|d| d.matches(pattern))
            .cloned()
    }
}

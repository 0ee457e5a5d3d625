//! OBC Core - OBEX client session management.
//!
//! This crate implements:
//! - OBEX client sessions (connect, transfer queue, agent authorization)
//! - The session registry with reuse of matching sessions
//! - Bluetooth transport negotiation (adapter lease, SDP, RFCOMM)
//! - A minimal OBEX CONNECT engine
//! - Profile drivers (OPP, FTP, PBAP, SYNC, MAP, PCSUITE)

#![forbid(unsafe_code)]

// Core state machines
pub mod client;
pub mod session;

// Transport negotiation
pub mod adapter;
pub mod connector;
pub mod sdp;
pub mod transport;

// Protocol and collaborators
pub mod agent;
pub mod bus;
pub mod driver;
pub mod obex;
pub mod transfer;

// Supporting modules
pub mod config;
pub mod errors;
pub mod types;
pub mod harness;

// Optional D-Bus collaborators
#[cfg(feature = "dbus")]
pub mod dbus;

// Optional BlueZ sockets
#[cfg(feature = "bluez")]
pub mod bluez;

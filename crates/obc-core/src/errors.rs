//! Error types for the OBEX client core.
//!
//! Failures are split by the observer that receives them: connection
//! lifecycle errors reach the connect callback, transfer errors reach the
//! agent and the stored session callback, and synchronous operation errors
//! are returned directly as [`SessionError`].

use thiserror::Error;

// errno values surfaced through `SessionError::errno`.
const EPERM: i32 = 1;
const EIO: i32 = 5;
const EINVAL: i32 = 22;
const EISCONN: i32 = 106;
const ENOTCONN: i32 = 107;
const EALREADY: i32 = 114;
const ECANCELED: i32 = 125;

// ============================================================================
// Connection lifecycle
// ============================================================================

/// Errors delivered once through a session's connect callback.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Neither the default nor the named adapter could be resolved
    #[error("No adapter found")]
    NoAdapter,

    /// The adapter refused the session lease
    #[error("Unable to request session")]
    SessionRequest,

    /// SDP yielded no RFCOMM channel for the service
    #[error("Unable to find service record")]
    ServiceNotFound,

    /// RFCOMM connect failed
    #[error("rfcomm connect failed: {0}")]
    Rfcomm(String),

    /// OBEX CONNECT answered with a non-success response code
    #[error("OBEX Connect failed with 0x{0:02x}")]
    ObexRejected(u8),

    /// The OBEX transport failed during CONNECT
    #[error("obex transport error: {0}")]
    Obex(String),

    /// The overall connect deadline elapsed
    #[error("connection timed out")]
    Timeout,

    /// The session was shut down before the connect completed
    #[error("connection cancelled")]
    Cancelled,

    /// The request could not be started
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<ObexError> for ConnectError {
    fn from(e: ObexError) -> Self {
        match e {
            ObexError::Rejected(code) => ConnectError::ObexRejected(code),
            other => ConnectError::Obex(other.to_string()),
        }
    }
}

// ============================================================================
// Transfer lifecycle
// ============================================================================

/// Errors terminating a single transfer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The agent rejected or failed the authorization request
    #[error("{0}")]
    Rejected(String),

    /// The transfer subsystem refused to start, carrying a negative errno
    #[error("transfer failed to start ({0})")]
    Start(i32),

    /// I/O failure while the transfer was running
    #[error("transfer i/o error: {0}")]
    Io(String),

    /// Invalid transfer parameters
    #[error("invalid transfer arguments: {0}")]
    InvalidArguments(String),

    /// The session shut down with the transfer still queued
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn errno(&self) -> i32 {
        match self {
            TransferError::Rejected(_) | TransferError::Cancelled => -ECANCELED,
            TransferError::Start(code) => *code,
            TransferError::Io(_) => -EIO,
            TransferError::InvalidArguments(_) => -EINVAL,
        }
    }
}

// ============================================================================
// Synchronous session operations
// ============================================================================

/// Errors returned directly from session and client operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No OBEX link yet
    #[error("session is not connected")]
    NotConnected,

    /// A raw buffer put was issued while transfers are pending
    #[error("session is busy")]
    Busy,

    /// An agent is already bound
    #[error("already exists")]
    AlreadyExists,

    /// Missing destination or malformed request
    #[error("invalid arguments")]
    InvalidArguments,

    /// Caller does not own the binding it tried to change
    #[error("not authorized")]
    NotAuthorized,

    /// The transfer subsystem could not register the transfer
    #[error("i/o error")]
    Io,

    /// No driver for the requested service
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// No transport registered under the configured name
    #[error("no transport named {0}")]
    NoTransport(String),

    /// The transport refused to start the connect
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A transfer-level failure reported synchronously
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The exported object could not be registered
    #[error(transparent)]
    Bus(#[from] BusError),

    /// The session has already been destroyed
    #[error("session is gone")]
    Gone,
}

impl SessionError {
    /// Negative errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            SessionError::NotConnected | SessionError::Gone => -ENOTCONN,
            SessionError::Busy => -EISCONN,
            SessionError::AlreadyExists => -EALREADY,
            SessionError::InvalidArguments
            | SessionError::UnknownService(_)
            | SessionError::NoTransport(_) => -EINVAL,
            SessionError::NotAuthorized => -EPERM,
            SessionError::Io | SessionError::Connect(_) | SessionError::Bus(_) => -EIO,
            SessionError::Transfer(e) => e.errno(),
        }
    }
}

// ============================================================================
// Collaborator errors
// ============================================================================

/// Errors from an agent endpoint.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The agent replied with an error
    #[error("agent replied with an error: {name}: {message}")]
    Replied { name: String, message: String },

    /// The agent could not be reached
    #[error("agent unreachable: {0}")]
    Unreachable(String),
}

impl AgentError {
    /// Human readable message, without the error name.
    pub fn message(&self) -> &str {
        match self {
            AgentError::Replied { message, .. } => message,
            AgentError::Unreachable(m) => m,
        }
    }
}

/// Errors from the IPC layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("object already exported at {0}")]
    AlreadyExported(String),
    #[error("export failed: {0}")]
    Export(String),
    #[error("driver probe failed: {0}")]
    Probe(String),
    #[error("bus call failed: {0}")]
    Call(String),
}

/// Errors from the OBEX engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObexError {
    /// Non-success response code, with the final bit masked off
    #[error("OBEX Connect failed with 0x{0:02x}")]
    Rejected(u8),
    #[error("obex i/o error: {0}")]
    Io(String),
    #[error("malformed obex packet: {0}")]
    Malformed(String),
}

impl From<std::io::Error> for ObexError {
    fn from(e: std::io::Error) -> Self {
        ObexError::Io(e.to_string())
    }
}

/// Errors from SDP resolution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("malformed sdp data: {0}")]
    Malformed(String),
    #[error("sdp error response 0x{0:04x}")]
    ErrorResponse(u16),
    #[error("no rfcomm channel in service records")]
    NoChannel,
    #[error("sdp i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SdpError {
    fn from(e: std::io::Error) -> Self {
        SdpError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(SessionError::NotConnected.errno(), -107);
        assert_eq!(SessionError::Busy.errno(), -106);
        assert_eq!(SessionError::AlreadyExists.errno(), -114);
        assert_eq!(SessionError::NotAuthorized.errno(), -1);
        assert_eq!(SessionError::Io.errno(), -5);
        assert_eq!(SessionError::Transfer(TransferError::Start(-2)).errno(), -2);
        assert_eq!(SessionError::Transfer(TransferError::Cancelled).errno(), -125);
    }

    #[test]
    fn test_connect_error_messages() {
        assert_eq!(ConnectError::NoAdapter.to_string(), "No adapter found");
        assert_eq!(ConnectError::SessionRequest.to_string(), "Unable to request session");
        assert_eq!(ConnectError::ServiceNotFound.to_string(), "Unable to find service record");
        assert_eq!(ConnectError::ObexRejected(0x43).to_string(), "OBEX Connect failed with 0x43");
    }

    #[test]
    fn test_obex_error_conversion() {
        assert_eq!(ConnectError::from(ObexError::Rejected(0x41)), ConnectError::ObexRejected(0x41));
        assert!(matches!(
            ConnectError::from(ObexError::Io("reset".into())),
            ConnectError::Obex(_)
        ));
    }
}

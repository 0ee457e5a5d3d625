//! Transfer subsystem seam.
//!
//! Transfers are created by a [`TransferFactory`] over a connected OBEX link
//! and driven by the session: it starts them once authorized and receives
//! their progress through a [`ProgressReporter`].

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::errors::TransferError;
use crate::obex::ObexLink;

/// Parameters for registering a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSpec {
    /// Bus name of the session's agent, if one is bound
    pub agent: Option<String>,
    /// Local file backing the transfer
    pub filename: Option<String>,
    /// Remote object name
    pub name: Option<String>,
    /// Object MIME type
    pub mime_type: Option<String>,
    /// OBEX application parameters
    pub params: Option<Bytes>,
}

/// A progress event from a running transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferProgress {
    /// Total bytes transferred so far
    Transferred(u64),
    /// The transfer failed
    Failed(TransferError),
}

/// Reports progress of one transfer back to its session.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(TransferProgress) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(TransferProgress) + Send + Sync + 'static) -> Self {
        Self { sink: Arc::new(sink) }
    }

    pub fn progress(&self, transferred: u64) {
        (self.sink)(TransferProgress::Transferred(transferred));
    }

    pub fn fail(&self, error: TransferError) {
        (self.sink)(TransferProgress::Failed(error));
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressReporter")
    }
}

/// A single object transfer.
///
/// Implementations use interior mutability; the session shares them
/// behind `Arc`.
pub trait Transfer: Send + Sync {
    /// Externally addressable path; transfers without one skip the agent.
    fn path(&self) -> Option<String>;

    /// Declared total size, when known.
    fn size(&self) -> Option<u64>;

    fn name(&self) -> Option<String>;

    /// Rename the remote object (agent suggestion).
    fn set_name(&self, name: &str);

    fn filename(&self) -> Option<String>;

    /// Open the backing file for sending.
    fn set_file(&self) -> Result<(), TransferError>;

    /// Use a caller supplied buffer as the object body.
    fn set_buffer(&self, buffer: Bytes);

    fn buffer(&self) -> Option<Bytes>;

    fn clear_buffer(&self);

    fn params(&self) -> Option<Bytes>;

    fn start_get(&self, progress: ProgressReporter) -> Result<(), TransferError>;

    fn start_put(&self, progress: ProgressReporter) -> Result<(), TransferError>;

    /// Release everything the transfer holds.
    fn unregister(&self);
}

/// Creates transfers over a connected link.
pub trait TransferFactory: Send + Sync {
    fn register(&self, link: &Arc<ObexLink>, spec: TransferSpec) -> Result<Arc<dyn Transfer>, TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_reporter_forwards_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::new(move |p| sink.lock().unwrap().push(p));

        reporter.progress(10);
        reporter.clone().fail(TransferError::Io("reset".into()));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                TransferProgress::Transferred(10),
                TransferProgress::Failed(TransferError::Io("reset".into()))
            ]
        );
    }
}

//! Agent binding.
//!
//! An agent is an external endpoint that authorizes transfers and is told
//! about their progress. A session holds at most one [`AgentBinding`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::errors::AgentError;

/// An authorization and notification endpoint.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Ask whether `transfer` may proceed. An empty string approves
    /// as-is, anything else is a suggested object name.
    async fn request(&self, transfer: &str) -> Result<String, AgentError>;

    async fn progress(&self, transfer: &str, transferred: u64);

    async fn complete(&self, transfer: &str);

    async fn error(&self, transfer: &str, message: &str);

    /// The session holding this agent is going away.
    async fn release(&self);
}

enum Notice {
    Progress(String, u64),
    Complete(String),
    Error(String, String),
    Release,
}

/// A session's bound agent: the owning bus name, the agent's object path,
/// and an ordered notification queue.
pub struct AgentBinding {
    name: String,
    path: String,
    agent: Arc<dyn Agent>,
    notices: mpsc::UnboundedSender<Notice>,
    watch: Option<AbortHandle>,
}

impl AgentBinding {
    /// Bind `agent`, spawning its notifier on `runtime`.
    pub fn new(name: &str, path: &str, agent: Arc<dyn Agent>, runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notice>();
        let target = agent.clone();
        runtime.spawn(async move {
            while let Some(notice) = rx.recv().await {
                match notice {
                    Notice::Progress(t, n) => target.progress(&t, n).await,
                    Notice::Complete(t) => target.complete(&t).await,
                    Notice::Error(t, m) => target.error(&t, &m).await,
                    Notice::Release => target.release().await,
                }
            }
        });

        Self {
            name: name.to_string(),
            path: path.to_string(),
            agent,
            notices: tx,
            watch: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn agent(&self) -> Arc<dyn Agent> {
        self.agent.clone()
    }

    /// Whether `sender` at `path` is the endpoint this binding describes.
    pub fn matches(&self, sender: &str, path: &str) -> bool {
        self.name == sender && self.path == path
    }

    /// Attach the liveness watch; it is aborted when the binding drops.
    pub(crate) fn set_watch(&mut self, watch: AbortHandle) {
        if let Some(old) = self.watch.replace(watch) {
            old.abort();
        }
    }

    pub fn notify_progress(&self, transfer: &str, transferred: u64) {
        let _ = self.notices.send(Notice::Progress(transfer.to_string(), transferred));
    }

    pub fn notify_complete(&self, transfer: &str) {
        let _ = self.notices.send(Notice::Complete(transfer.to_string()));
    }

    pub fn notify_error(&self, transfer: &str, message: &str) {
        let _ = self.notices.send(Notice::Error(transfer.to_string(), message.to_string()));
    }

    /// Tell the agent it is released, after any queued notifications.
    /// Dropping a binding without calling this sends nothing further.
    pub fn release(self) {
        debug!(agent = %self.name, path = %self.path, "releasing agent");
        let _ = self.notices.send(Notice::Release);
    }
}

impl Drop for AgentBinding {
    fn drop(&mut self) {
        if let Some(watch) = self.watch.take() {
            watch.abort();
        }
    }
}

impl std::fmt::Debug for AgentBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBinding")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

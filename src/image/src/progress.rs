//! Progress events for registry transfers.
//!
//! Transfers report [`Update`]s on a single unbounded channel. The command
//! line drains that channel with one passive logger task that lives for the
//! rest of the process.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A progress event emitted during a network transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    /// Bytes transferred so far.
    pub complete: u64,
    /// Total bytes expected for the transfer.
    pub total: u64,
    /// Error that ended the transfer, if any.
    pub error: Option<String>,
}

impl std::fmt::Display for Update {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.error {
            Some(ref error) => write!(f, "{}/{} bytes (error: {})", self.complete, self.total, error),
            None => write!(f, "{}/{} bytes", self.complete, self.total),
        }
    }
}

/// Sending half of the progress channel.
pub type ProgressSender = mpsc::UnboundedSender<Update>;

/// Receiving half of the progress channel.
pub type ProgressReceiver = mpsc::UnboundedReceiver<Update>;

/// Create a progress channel.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Spawn the task that logs every update it receives.
///
/// The task ends once every sender has been dropped; callers normally never
/// join it.
pub fn spawn_logger(mut updates: ProgressReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            match update.error {
                Some(ref error) => tracing::warn!(
                    complete = update.complete,
                    total = update.total,
                    error = %error,
                    "Transfer failed"
                ),
                None => tracing::info!(
                    complete = update.complete,
                    total = update.total,
                    "{}",
                    update
                ),
            }
        }
    })
}

/// Running byte counter for one transfer, reporting to an optional channel.
#[derive(Debug)]
pub(crate) struct Progress {
    sender: Option<ProgressSender>,
    complete: u64,
    total: u64,
}

impl Progress {
    pub(crate) fn new(sender: Option<ProgressSender>, total: u64) -> Self {
        Self {
            sender,
            complete: 0,
            total,
        }
    }

    /// Record `bytes` more transferred and emit an update.
    pub(crate) fn advance(&mut self, bytes: u64) {
        self.complete = self.complete.saturating_add(bytes);
        self.send(None);
    }

    /// Emit a terminal update carrying the error message.
    pub(crate) fn fail(&self, error: impl std::fmt::Display) {
        self.send(Some(error.to_string()));
    }

    fn send(&self, error: Option<String>) {
        if let Some(ref sender) = self.sender {
            // A closed channel only means nobody is listening any more.
            let _ = sender.send(Update {
                complete: self.complete,
                total: self.total,
                error,
            });
        }
    }
}

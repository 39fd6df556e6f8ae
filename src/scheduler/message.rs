//! Scheduler message types.
//!
//! Everything that can wake the scheduler (producers, host monitors and the
//! scheduler's own deferred passes) posts one of these onto a single
//! channel, so passes are strictly serialized.

use tokio::sync::mpsc;
use tracing::trace;

use crate::host::ActivityEvent;

/// Messages processed by the scheduler task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerMessage {
    /// Requests were added; `depth` is the queue length afterwards.
    Enqueued { depth: usize },

    /// Drain now, ignoring the flush criteria.
    Flush,

    /// A deferred pass came due.
    ///
    /// Ignored unless `ticket` matches the most recently armed deferral, so
    /// a pass cancelled just as it fired cannot run twice.
    Tick { ticket: u64 },

    /// Reachability changed.
    NetworkChanged { connected: bool },

    Lifecycle(ActivityEvent),

    /// Persist the index and stop.
    Shutdown,
}

/// Cheap, cloneable sender for [`SchedulerMessage`]s.
///
/// Sending never blocks and never fails from the caller's point of view:
/// once the scheduler has stopped, messages are dropped.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerMessage>,
}

impl SchedulerHandle {
    pub fn new(tx: mpsc::UnboundedSender<SchedulerMessage>) -> Self {
        SchedulerHandle { tx }
    }

    /// Creates a handle together with the receiving end for the scheduler.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SchedulerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, message: SchedulerMessage) {
        if self.tx.send(message).is_err() {
            trace!("Scheduler stopped, message dropped");
        }
    }

    pub fn notify_enqueued(&self, depth: usize) {
        self.send(SchedulerMessage::Enqueued { depth });
    }

    pub fn flush(&self) {
        self.send(SchedulerMessage::Flush);
    }

    pub fn network_changed(&self, connected: bool) {
        self.send(SchedulerMessage::NetworkChanged { connected });
    }

    pub fn lifecycle(&self, event: ActivityEvent) {
        self.send(SchedulerMessage::Lifecycle(event));
    }

    pub fn shutdown(&self) {
        self.send(SchedulerMessage::Shutdown);
    }

    pub(crate) fn tick(&self, ticket: u64) {
        self.send(SchedulerMessage::Tick { ticket });
    }

    /// Returns true once the scheduler's receiver is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

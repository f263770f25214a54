use crate::attribute_store::AttributeEntry;
use std::collections::BTreeMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Paths changed by one frame, with their new value and text
pub type ChangeBatch = BTreeMap<String, AttributeEntry>;

/// Hands change batches from the receive loop to whoever publishes them on the bus.
/// One non-empty batch becomes exactly one notification event.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    sender: UnboundedSender<ChangeBatch>,
}

impl ChangeNotifier {
    pub fn new() -> (Self, UnboundedReceiver<ChangeBatch>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queues `batch` for publishing. Empty batches are dropped.
    ///
    /// Returns `true` if an event was queued.
    pub fn notify(&self, batch: ChangeBatch) -> bool {
        if batch.is_empty() {
            return false;
        }
        let count = batch.len();
        match self.sender.send(batch) {
            Ok(()) => {
                tracing::trace!("Queued change notification for {count} paths");
                true
            }
            Err(_) => {
                tracing::warn!("Change notification receiver is gone, dropping {count} changes");
                false
            }
        }
    }
}

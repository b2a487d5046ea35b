// Communication channels for the bootstrap lifecycle
use super::types::{LifecycleCommand, StarterEvent};
use tokio::sync::mpsc;

/// Helper function to create lifecycle channels. Both queues are unbounded;
/// senders on platform threads must never wait on the worker.
pub fn create_lifecycle_channels() -> (
    mpsc::UnboundedSender<LifecycleCommand>,
    mpsc::UnboundedReceiver<LifecycleCommand>,
    mpsc::UnboundedSender<StarterEvent>,
    mpsc::UnboundedReceiver<StarterEvent>,
) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (cmd_tx, cmd_rx, event_tx, event_rx)
}

//! Fan-out of invoice events from the node to the ledger

use super::{InvoiceEvent, InvoiceState};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 1024;

/// Broadcast hub for invoice state changes
///
/// Event sources (the RabbitMQ consumer, or a test node) publish here and
/// every subscriber receives each event. A subscriber that falls behind by
/// more than the channel capacity sees `RecvError::Lagged`.
#[derive(Clone)]
pub struct InvoiceEventHub {
    sender: broadcast::Sender<InvoiceEvent>,
}

impl InvoiceEventHub {
    /// Create a hub with no subscribers
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: InvoiceEvent) {
        match event.state {
            InvoiceState::Settled => info!(
                "Invoice settled: {} (amount: {} msat)",
                event.payment_hash, event.amount_paid_msat
            ),
            InvoiceState::Canceled => info!("Invoice canceled: {}", event.payment_hash),
            InvoiceState::Open => debug!("Invoice open: {}", event.payment_hash),
        }

        if let Err(e) = self.sender.send(event) {
            warn!("No subscribers for invoice event {}", e.0.payment_hash);
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<InvoiceEvent> {
        self.sender.subscribe()
    }
}

impl Default for InvoiceEventHub {
    fn default() -> Self {
        Self::new()
    }
}

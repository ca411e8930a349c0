//! Background tasks that follow the node
//!
//! One tracker per in-flight payment, plus the long-lived invoice event
//! subscription. Finalization after the node already settled a payment or an
//! invoice must not be lost, so failed finalizations are retried with
//! exponential backoff until they succeed or the manager shuts down.
//! A payment the node never saw, such as one reserved right before a crash,
//! is released instead of finalized.

use super::{PaymentManager, PaymentOutcome};
use crate::{
    db::PendingPaymentModel,
    node::{InvoiceEvent, InvoiceState, PaymentStatus, PaymentUpdate},
    LedgerResult,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Run `op` until it succeeds, doubling the pause after each failure
///
/// Returns `None` if cancelled first.
async fn with_backoff<T, F, Fut>(cancel: &CancellationToken, what: &str, mut op: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let mut delay = INITIAL_BACKOFF;
    loop {
        match op().await {
            Ok(value) => return Some(value),
            Err(e) => {
                error!("{} failed, retrying in {:?}: {}", what, delay, e);
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(MAX_BACKOFF);
            }
        }
    }
}

impl PaymentManager {
    /// Spawn a tracker for a pending payment
    ///
    /// `updates` is the stream returned by dispatch; recovered payments pass
    /// `None` and are re-attached with `track_payment`.
    pub(super) async fn spawn_tracker(
        self: &Arc<Self>,
        pending: PendingPaymentModel,
        updates: Option<mpsc::Receiver<PaymentUpdate>>,
    ) -> JoinHandle<Option<PaymentOutcome>> {
        self.trackers.lock().await.insert(pending.payment_hash.clone());

        let manager = self.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let payment_hash = pending.payment_hash.clone();
            let outcome = manager.track(pending, updates, &cancel).await;
            manager.trackers.lock().await.remove(&payment_hash);
            outcome
        })
    }

    async fn track(
        &self,
        pending: PendingPaymentModel,
        mut updates: Option<mpsc::Receiver<PaymentUpdate>>,
        cancel: &CancellationToken,
    ) -> Option<PaymentOutcome> {
        let payment_hash = pending.payment_hash.as_str();
        let terminal = loop {
            let stream = match updates.take() {
                Some(stream) => stream,
                None => {
                    let what = format!("Tracking payment {}", payment_hash);
                    with_backoff(cancel, &what, || self.node.track_payment(payment_hash)).await?
                }
            };
            if let Some(update) = Self::next_terminal(stream, cancel).await? {
                break update;
            }
            warn!("Status stream for payment {} ended early, re-attaching", payment_hash);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(INITIAL_BACKOFF) => {}
            }
        };

        if terminal.status == PaymentStatus::Unknown {
            warn!(
                "Payment {} was never seen by the node, releasing its reservation",
                payment_hash
            );
            let what = format!("Releasing payment {}", payment_hash);
            with_backoff(cancel, &what, || self.release(payment_hash)).await?;
            return Some(PaymentOutcome {
                payment_hash: payment_hash.to_string(),
                amount_msat: pending.amount_msat,
                fee_msat: 0,
                success: false,
                failure_reason: terminal.failure_reason,
            });
        }

        let success = terminal.status == PaymentStatus::Succeeded;
        debug!(
            "Pending payment update: hash={}, success={}, fee={} msat, reason={:?}",
            payment_hash, success, terminal.fee_paid_msat, terminal.failure_reason
        );

        let what = format!("Finalizing payment {}", payment_hash);
        with_backoff(cancel, &what, || {
            self.finalize_payment(payment_hash, success, terminal.fee_paid_msat)
        })
        .await?;

        Some(PaymentOutcome {
            payment_hash: payment_hash.to_string(),
            amount_msat: pending.amount_msat,
            fee_msat: terminal.fee_paid_msat,
            success,
            failure_reason: terminal.failure_reason,
        })
    }

    /// Read a status stream until its terminal update
    ///
    /// `Some(None)` means the stream closed first; `None` means cancelled.
    async fn next_terminal(
        mut stream: mpsc::Receiver<PaymentUpdate>,
        cancel: &CancellationToken,
    ) -> Option<Option<PaymentUpdate>> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                update = stream.recv() => match update {
                    Some(update) if update.is_terminal() => return Some(Some(update)),
                    Some(update) => debug!("Payment {} in flight", update.payment_hash),
                    None => return Some(None),
                },
            }
        }
    }

    /// Finalize an invoice, retrying until it sticks
    pub(super) async fn finalize_invoice_until_done(&self, event: &InvoiceEvent) {
        let what = format!("Finalizing invoice {}", event.payment_hash);
        with_backoff(&self.cancel, &what, || self.finalize_invoice(event)).await;
    }

    /// Consume invoice events until shutdown
    ///
    /// Resubscribes with backoff when the stream closes, and replays invoice
    /// recovery when events were dropped because this loop fell behind.
    pub(super) async fn run_invoice_subscription(self: Arc<Self>, events: broadcast::Receiver<InvoiceEvent>) {
        let mut events = Some(events);
        let mut delay = INITIAL_BACKOFF;

        loop {
            let mut stream = match events.take() {
                Some(stream) => stream,
                None => match self.node.subscribe_invoice_events().await {
                    Ok(stream) => {
                        info!("Resubscribed to invoice events");
                        delay = INITIAL_BACKOFF;
                        stream
                    }
                    Err(e) => {
                        error!("Failed to subscribe to invoice events, retrying in {:?}: {}", delay, e);
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay = (delay * 2).min(MAX_BACKOFF);
                        continue;
                    }
                },
            };

            loop {
                let event = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!("Invoice subscription stopped");
                        return;
                    }
                    event = stream.recv() => event,
                };

                match event {
                    Ok(event) => {
                        debug!("Received invoice event: hash={}, state={:?}", event.payment_hash, event.state);
                        if event.state != InvoiceState::Open {
                            self.finalize_invoice_until_done(&event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} invoice events, replaying invoice recovery", missed);
                        if let Err(e) = self.recover_invoices().await {
                            error!("Invoice recovery failed: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Invoice event stream closed");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

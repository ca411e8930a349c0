//! Payment network integration
//!
//! The ledger only needs a narrow contract from the Lightning node: mint and
//! decode invoices, send a payment and follow its status, and report when
//! invoices settle. [`PaymentNetworkClient`] is that contract. With the
//! `ldk-server` feature, [`LdkServerClient`] implements it on top of an LDK
//! Server instance.

use crate::LedgerResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

#[cfg(feature = "ldk-server")]
mod client;
mod events;

#[cfg(feature = "ldk-server")]
pub use client::LdkServerClient;
pub use events::InvoiceEventHub;

/// An invoice minted by the node
#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    /// BOLT11 payment request
    pub payment_request: String,
    /// Payment hash (hex)
    pub payment_hash: String,
    /// Our node's public key
    pub pubkey: String,
}

/// The parts of a payment request the ledger cares about
#[derive(Debug, Clone)]
pub struct DecodedPaymentRequest {
    /// Payment hash (hex)
    pub payment_hash: String,
    /// Requested amount in millisatoshis (0 when the request has none)
    pub amount_msat: u64,
    /// Destination node public key
    pub destination: String,
}

/// Parameters for an outbound payment
#[derive(Debug, Clone)]
pub struct SendPaymentRequest {
    /// BOLT11 payment request
    pub payment_request: String,
    /// Amount to pay in millisatoshis
    pub amount_msat: u64,
    /// Routing fee ceiling in millisatoshis
    pub fee_limit_msat: u64,
    /// Time allowed for the node to accept the payment
    pub timeout: Duration,
}

/// Outbound payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    /// Accepted by the node, not yet resolved
    InFlight,
    /// Delivered
    Succeeded,
    /// Gave up
    Failed,
    /// The node has no record of the payment
    Unknown,
}

/// One status report for an outbound payment
#[derive(Debug, Clone)]
pub struct PaymentUpdate {
    /// Payment hash (hex)
    pub payment_hash: String,
    /// Current status
    pub status: PaymentStatus,
    /// Routing fees paid in millisatoshis
    pub fee_paid_msat: u64,
    /// Why the payment failed
    pub failure_reason: Option<String>,
}

impl PaymentUpdate {
    /// Whether no further updates will follow
    pub fn is_terminal(&self) -> bool {
        self.status != PaymentStatus::InFlight
    }
}

/// Invoice lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
    /// Awaiting payment
    Open,
    /// Paid in full
    Settled,
    /// Expired or cancelled
    Canceled,
}

/// Invoice state change reported by the node
#[derive(Debug, Clone)]
pub struct InvoiceEvent {
    /// Payment hash (hex)
    pub payment_hash: String,
    /// New state
    pub state: InvoiceState,
    /// Amount received in millisatoshis
    pub amount_paid_msat: u64,
}

/// Contract the ledger requires from the Lightning node
#[async_trait]
pub trait PaymentNetworkClient: Send + Sync {
    /// Mint an invoice
    async fn create_invoice(&self, memo: &str, amount_msat: u64, expiry_secs: u32) -> LedgerResult<CreatedInvoice>;

    /// Decode a payment request
    async fn decode_payment_request(&self, payment_request: &str) -> LedgerResult<DecodedPaymentRequest>;

    /// Dispatch a payment
    ///
    /// Returns once the node has accepted the payment. The first update on
    /// the returned stream is that acknowledgment; the stream ends after a
    /// terminal update.
    async fn send_payment(&self, request: SendPaymentRequest) -> LedgerResult<mpsc::Receiver<PaymentUpdate>>;

    /// Follow an already dispatched payment
    ///
    /// A hash the node still has no record of after its grace period ends
    /// the stream with [`PaymentStatus::Unknown`].
    async fn track_payment(&self, payment_hash: &str) -> LedgerResult<mpsc::Receiver<PaymentUpdate>>;

    /// Current state of an invoice we issued
    async fn lookup_invoice(&self, payment_hash: &str) -> LedgerResult<InvoiceEvent>;

    /// Stream of invoice state changes
    async fn subscribe_invoice_events(&self) -> LedgerResult<broadcast::Receiver<InvoiceEvent>>;
}

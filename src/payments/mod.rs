//! Invoice and payment reconciliation
//!
//! This module bridges the payment network into the ledger:
//! - Invoice creation for wallets, settled into balances as the node reports them
//! - Outbound payments, reserved against the payer's confirmed balance before
//!   dispatch and finalized when the node reports a terminal status
//! - Payments to invoices issued by this ledger, settled without the network
//! - Startup recovery of every pending invoice and payment
//!
//! The store is the source of truth. The in-memory pending caches only save
//! store round-trips; every cache miss falls back to the store.

use crate::{
    cache::TtlCache,
    config::Config,
    db::{
        Database, InvoiceModel, InvoiceQueries, PendingInvoiceModel, PendingInvoiceQueries, PendingPaymentModel,
        PendingPaymentQueries, TransactionQueries, WalletQueries, WalletRef, WithdrawQueries,
    },
    node::{DecodedPaymentRequest, InvoiceEvent, InvoiceState, PaymentNetworkClient, SendPaymentRequest},
    LedgerError, LedgerResult,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod self_payment;
mod tracker;

/// Result of a payment that reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentOutcome {
    /// Payment hash (hex)
    pub payment_hash: String,
    /// Amount paid in millisatoshis
    pub amount_msat: u64,
    /// Routing fees paid in millisatoshis
    pub fee_msat: u64,
    /// Whether the payment went through
    pub success: bool,
    /// Why the payment failed
    pub failure_reason: Option<String>,
}

/// A payment that left the caller's hands
enum Dispatched {
    /// Settled internally, already final
    Settled(PaymentOutcome),
    /// Sent to the network; the tracker resolves to the outcome
    Tracking(JoinHandle<Option<PaymentOutcome>>),
}

/// Invoice and payment manager
pub struct PaymentManager {
    config: Arc<Config>,
    db: Arc<Database>,
    node: Arc<dyn PaymentNetworkClient>,
    pending_invoices: TtlCache<String, PendingInvoiceModel>,
    pending_payments: TtlCache<String, PendingPaymentModel>,
    /// Payment hashes with a live tracker
    trackers: Mutex<HashSet<String>>,
    cancel: CancellationToken,
}

impl PaymentManager {
    /// Create a new payment manager
    pub fn new(config: Arc<Config>, db: Arc<Database>, node: Arc<dyn PaymentNetworkClient>) -> Arc<Self> {
        let ttl = Duration::from_secs(config.ledger.pending_cache_ttl_seconds);
        let purge = Duration::from_secs(config.ledger.pending_cache_purge_seconds);

        Arc::new(Self {
            pending_invoices: TtlCache::new("pending_invoices", ttl, purge),
            pending_payments: TtlCache::new("pending_payments", ttl, purge),
            trackers: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            config,
            db,
            node,
        })
    }

    /// Start the background tasks
    ///
    /// Subscribes to invoice events before the recovery sweep starts, so no
    /// settlement falls between the two.
    pub async fn start(self: &Arc<Self>) -> LedgerResult<()> {
        info!("Starting payment manager...");

        let events = self.node.subscribe_invoice_events().await?;

        self.pending_invoices.spawn_janitor(self.cancel.child_token());
        self.pending_payments.spawn_janitor(self.cancel.child_token());

        let manager = self.clone();
        tokio::spawn(async move { manager.run_invoice_subscription(events).await });

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.recover().await {
                error!("Recovery of pending invoices and payments failed: {}", e);
            }
        });

        info!("Payment manager started");
        Ok(())
    }

    /// Cancel every background task
    pub fn shutdown(&self) {
        info!("Stopping payment manager...");
        self.cancel.cancel();
    }

    /// Re-attach to every pending payment and invoice in the store
    ///
    /// Payments get a tracker unless one is already running; invoices are
    /// looked up on the node and finalized if they reached a terminal state.
    /// Calls to the node are paced by `ledger.recovery_pacing_ms`. Running
    /// this more than once never finalizes a record twice.
    pub async fn recover(self: &Arc<Self>) -> LedgerResult<()> {
        let payments = self
            .db
            .read(|conn| PendingPaymentQueries::new(conn).list_all())
            .await?;

        if !payments.is_empty() {
            info!("Recovering {} pending payments", payments.len());
        }

        let total = payments.len();
        for (i, pending) in payments.into_iter().enumerate() {
            info!("[Recovery {}/{}] Tracking payment {}", i + 1, total, pending.payment_hash);
            self.pending_payments
                .insert(pending.payment_hash.clone(), pending.clone())
                .await;

            if self.trackers.lock().await.contains(&pending.payment_hash) {
                debug!("Payment {} already tracked", pending.payment_hash);
                continue;
            }
            self.spawn_tracker(pending, None).await;

            if i + 1 < total && !self.pace().await {
                return Ok(());
            }
        }

        self.recover_invoices().await
    }

    /// Look up every pending invoice on the node and finalize the settled ones
    async fn recover_invoices(&self) -> LedgerResult<()> {
        let invoices = self
            .db
            .read(|conn| PendingInvoiceQueries::new(conn).list_all())
            .await?;

        if !invoices.is_empty() {
            info!("Recovering {} pending invoices", invoices.len());
        }

        let total = invoices.len();
        for (i, pending) in invoices.into_iter().enumerate() {
            info!("[Recovery {}/{}] Looking up invoice {}", i + 1, total, pending.payment_hash);
            self.pending_invoices
                .insert(pending.payment_hash.clone(), pending.clone())
                .await;

            match self.node.lookup_invoice(&pending.payment_hash).await {
                Ok(event) if event.state != InvoiceState::Open => {
                    self.finalize_invoice_until_done(&event).await;
                }
                Ok(_) => debug!("Invoice {} still open", pending.payment_hash),
                Err(e) => warn!("Failed to look up invoice {}: {}", pending.payment_hash, e),
            }

            if i + 1 < total && !self.pace().await {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Sleep between recovery calls; false once cancelled
    async fn pace(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.ledger.recovery_pacing()) => true,
        }
    }

    /// Create an invoice payable to a wallet
    pub async fn create_invoice(
        &self,
        wallet: &WalletRef,
        memo: &str,
        amount_msat: u64,
        expiry_secs: u32,
    ) -> LedgerResult<InvoiceModel> {
        if amount_msat > self.config.ledger.max_payment_msat {
            warn!("CreateInvoice called with too large a value: {} msat", amount_msat);
            return Err(LedgerError::Validation(format!(
                "invoice of size {} msat is greater than the maximum payment size",
                amount_msat
            )));
        }
        self.transactable_wallet(wallet).await?;

        let created = self.node.create_invoice(memo, amount_msat, expiry_secs).await?;

        let invoice = InvoiceModel {
            payment_hash: created.payment_hash,
            payment_request: created.payment_request,
            memo: memo.to_string(),
            amount_msat,
            pubkey: created.pubkey,
            sender: None,
            recipient: Some(wallet.clone()),
            settled_at: None,
            created_at: Utc::now(),
        };

        let record = invoice.clone();
        let recipient = wallet.clone();
        let pending = self
            .db
            .transaction(move |tx| {
                let pending = PendingInvoiceQueries::new(tx).create(&record.payment_hash, &recipient, amount_msat)?;
                InvoiceQueries::new(tx).create(&record)?;
                Ok(pending)
            })
            .await?;
        self.pending_invoices
            .insert(pending.payment_hash.clone(), pending)
            .await;

        info!("Created invoice {} for {} ({} msat)", invoice.payment_hash, wallet, amount_msat);
        Ok(invoice)
    }

    /// Get an invoice the wallet sent or received
    pub async fn get_invoice(&self, wallet: &WalletRef, payment_hash: &str) -> LedgerResult<InvoiceModel> {
        let wallet = wallet.clone();
        let payment_hash = payment_hash.to_lowercase();
        self.db
            .read(move |conn| InvoiceQueries::new(conn).get_for_wallet(&wallet, &payment_hash))
            .await
    }

    /// List invoices the wallet sent or received
    pub async fn list_invoices(&self, wallet: &WalletRef) -> LedgerResult<Vec<InvoiceModel>> {
        let wallet = wallet.clone();
        self.db
            .read(move |conn| InvoiceQueries::new(conn).list_for_wallet(&wallet))
            .await
    }

    /// List the wallet's invoices awaiting settlement
    pub async fn list_pending_invoices(&self, wallet: &WalletRef) -> LedgerResult<Vec<PendingInvoiceModel>> {
        let wallet = wallet.clone();
        self.db
            .read(move |conn| PendingInvoiceQueries::new(conn).list_for_wallet(&wallet))
            .await
    }

    /// List the wallet's payments awaiting a terminal status
    pub async fn list_pending_payments(&self, wallet: &WalletRef) -> LedgerResult<Vec<PendingPaymentModel>> {
        let wallet = wallet.clone();
        self.db
            .read(move |conn| PendingPaymentQueries::new(conn).list_for_wallet(&wallet))
            .await
    }

    /// Pay a payment request that carries its own amount
    ///
    /// With `synchronous` the call waits for the terminal outcome; otherwise
    /// it returns `None` once the payment is dispatched. Payments to invoices
    /// issued by this ledger always return their outcome immediately.
    pub async fn pay_invoice(
        self: &Arc<Self>,
        wallet: &WalletRef,
        payment_request: &str,
        synchronous: bool,
    ) -> LedgerResult<Option<PaymentOutcome>> {
        self.transactable_wallet(wallet).await?;
        let decoded = self.decode(payment_request).await?;
        if decoded.amount_msat == 0 {
            return Err(LedgerError::Validation(
                "amount must be specified when paying a zero amount invoice".to_string(),
            ));
        }
        let amount_msat = decoded.amount_msat;

        let dispatched = self
            .start_payment(wallet, payment_request, decoded, amount_msat, None)
            .await?;
        Self::outcome(dispatched, synchronous).await
    }

    /// Pay a payment request with an explicit amount
    ///
    /// The amount must match the request's own amount when it has one.
    pub async fn pay_invoice_amount(
        self: &Arc<Self>,
        wallet: &WalletRef,
        payment_request: &str,
        synchronous: bool,
        amount_msat: u64,
    ) -> LedgerResult<Option<PaymentOutcome>> {
        self.transactable_wallet(wallet).await?;
        let decoded = self.decode(payment_request).await?;
        if decoded.amount_msat != 0 && decoded.amount_msat != amount_msat {
            return Err(LedgerError::Validation(format!(
                "provided amount {} does not satisfy payment request amount {}",
                amount_msat, decoded.amount_msat
            )));
        }
        if amount_msat == 0 {
            return Err(LedgerError::Validation("amount must be greater than zero".to_string()));
        }

        let dispatched = self
            .start_payment(wallet, payment_request, decoded, amount_msat, None)
            .await?;
        Self::outcome(dispatched, synchronous).await
    }

    /// Pay a payment request against an LNURL-withdraw template
    ///
    /// The template's use counter is only incremented once the payment
    /// succeeds. The max-use check counts in-flight withdrawals but is not
    /// held under one lock with the increment, so concurrent withdrawals at
    /// the limit can both pass it.
    pub async fn pay_withdraw_invoice(self: &Arc<Self>, k1: &str, payment_request: &str) -> LedgerResult<()> {
        let key = k1.to_string();
        let (withdraw, in_flight) = self
            .db
            .read(move |conn| {
                let withdraw = WithdrawQueries::new(conn).get(&key)?;
                let in_flight = PendingPaymentQueries::new(conn).count_for_withdraw(&key)?;
                Ok((withdraw, in_flight))
            })
            .await?;
        self.transactable_wallet(&withdraw.wallet).await?;

        if withdraw.max_use != 0 {
            if withdraw.uses >= withdraw.max_use {
                return Err(LedgerError::Validation(
                    "exceeded maximum number of allowed withdrawals".to_string(),
                ));
            }
            if withdraw.uses + in_flight >= withdraw.max_use {
                return Err(LedgerError::Retryable("processing other withdrawals. Retry.".to_string()));
            }
        }

        let decoded = self.decode(payment_request).await?;
        let amount_msat = decoded.amount_msat;
        if amount_msat == 0 {
            return Err(LedgerError::Validation(
                "amount must be specified when paying a zero amount invoice".to_string(),
            ));
        }
        if amount_msat < withdraw.min_msat {
            return Err(LedgerError::Validation(
                "amount is below the minimum withdrawable value".to_string(),
            ));
        }
        if withdraw.max_msat != 0 && amount_msat > withdraw.max_msat {
            return Err(LedgerError::Validation(
                "amount exceeds the maximum withdrawable value".to_string(),
            ));
        }

        let dispatched = self
            .start_payment(&withdraw.wallet, payment_request, decoded, amount_msat, Some(k1))
            .await?;

        let manager = self.clone();
        let k1 = k1.to_string();
        tokio::spawn(async move {
            match Self::outcome(dispatched, true).await {
                Ok(Some(outcome)) if outcome.success => {
                    let key = k1.clone();
                    if let Err(e) = manager
                        .db
                        .transaction(move |tx| WithdrawQueries::new(tx).increment_uses(&key))
                        .await
                    {
                        error!("Failed to count withdrawal against {}: {}", k1, e);
                    }
                }
                Ok(_) => warn!("Withdrawal against {} did not succeed", k1),
                Err(e) => error!("Failed to withdraw against {}: {}", k1, e),
            }
        });

        Ok(())
    }

    /// Wait for a dispatched payment if the caller asked to
    async fn outcome(dispatched: Dispatched, synchronous: bool) -> LedgerResult<Option<PaymentOutcome>> {
        match dispatched {
            Dispatched::Settled(outcome) => Ok(Some(outcome)),
            Dispatched::Tracking(_) if !synchronous => Ok(None),
            Dispatched::Tracking(handle) => match handle.await {
                Ok(Some(outcome)) => Ok(Some(outcome)),
                Ok(None) => Err(LedgerError::Node("payment tracking was cancelled".to_string())),
                Err(e) => Err(LedgerError::Node(format!("payment tracker failed: {}", e))),
            },
        }
    }

    /// Route a validated payment internally or out to the network
    async fn start_payment(
        self: &Arc<Self>,
        wallet: &WalletRef,
        payment_request: &str,
        decoded: DecodedPaymentRequest,
        amount_msat: u64,
        withdraw_k1: Option<&str>,
    ) -> LedgerResult<Dispatched> {
        if amount_msat > self.config.ledger.max_payment_msat {
            warn!("Payment called with too large a value: {} msat", amount_msat);
            return Err(LedgerError::Validation(format!(
                "size {} msat is greater than the maximum payment size",
                amount_msat
            )));
        }

        if let Some(pending) = self.find_pending_invoice(&decoded.payment_hash).await? {
            let outcome = self.pay_self(wallet, pending, amount_msat).await?;
            return Ok(Dispatched::Settled(outcome));
        }

        info!("Processing external payment from {}: {}", wallet, decoded.payment_hash);

        let (pending, fee_limit_msat) = self
            .reserve(wallet, payment_request, &decoded, amount_msat, withdraw_k1)
            .await?;
        self.pending_payments
            .insert(pending.payment_hash.clone(), pending.clone())
            .await;

        let request = SendPaymentRequest {
            payment_request: payment_request.to_string(),
            amount_msat,
            fee_limit_msat,
            timeout: self.config.ledger.payment_timeout(),
        };

        let timeout = request.timeout;
        let dispatched = match tokio::time::timeout(timeout, self.node.send_payment(request)).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Node(format!(
                "payment was not acknowledged within {:?}",
                timeout
            ))),
        };
        let updates = match dispatched {
            Ok(updates) => updates,
            Err(e) => {
                error!("Failed to dispatch payment {} from {}: {}", pending.payment_hash, wallet, e);
                if let Err(release_error) = self.release(&pending.payment_hash).await {
                    error!(
                        "Failed to release reservation for {}: {}",
                        pending.payment_hash, release_error
                    );
                }
                return Err(e);
            }
        };

        let handle = self.spawn_tracker(pending, Some(updates)).await;
        Ok(Dispatched::Tracking(handle))
    }

    /// Reserve the payment amount and record the outgoing invoice
    ///
    /// Runs in one transaction with the confirmed-balance check, so two
    /// payments can never reserve the same funds.
    async fn reserve(
        &self,
        wallet: &WalletRef,
        payment_request: &str,
        decoded: &DecodedPaymentRequest,
        amount_msat: u64,
        withdraw_k1: Option<&str>,
    ) -> LedgerResult<(PendingPaymentModel, u64)> {
        let config = self.config.clone();
        let sender = wallet.clone();
        let withdraw_k1 = withdraw_k1.map(str::to_string);
        let invoice = InvoiceModel {
            payment_hash: decoded.payment_hash.clone(),
            payment_request: payment_request.to_string(),
            memo: String::new(),
            amount_msat,
            pubkey: decoded.destination.clone(),
            sender: Some(wallet.clone()),
            recipient: None,
            settled_at: None,
            created_at: Utc::now(),
        };

        self.db
            .transaction(move |tx| {
                let confirmed = WalletQueries::new(tx).confirmed_balance(&sender)?;
                if confirmed < amount_msat {
                    warn!("Wallet {} attempted payment with insufficient funds", sender);
                    return Err(LedgerError::InsufficientBalance);
                }
                let fee_limit_msat = config.ledger.fee_limit_msat(amount_msat, confirmed);

                let pending = PendingPaymentQueries::new(tx).create(
                    &invoice.payment_hash,
                    &sender,
                    amount_msat,
                    withdraw_k1.as_deref(),
                )?;
                InvoiceQueries::new(tx).upsert_outgoing(&invoice)?;
                Ok((pending, fee_limit_msat))
            })
            .await
    }

    /// Undo the reservation of a payment the node never accepted
    ///
    /// Deletes the pending payment and the unsettled outgoing invoice row.
    pub(super) async fn release(&self, payment_hash: &str) -> LedgerResult<()> {
        self.pending_payments.remove(&payment_hash.to_string()).await;
        let hash = payment_hash.to_string();
        self.db
            .transaction(move |tx| {
                match PendingPaymentQueries::new(tx).delete(&hash) {
                    Ok(()) | Err(LedgerError::PendingPaymentNotFound) => {}
                    Err(e) => return Err(e),
                }
                let invoices = InvoiceQueries::new(tx);
                match invoices.get(&hash) {
                    Ok(invoice) if !invoice.is_settled() && invoice.recipient.is_none() => invoices.delete(&hash),
                    Ok(_) | Err(LedgerError::InvoiceNotFound) => Ok(()),
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Pending invoice issued by this ledger, cache first
    async fn find_pending_invoice(&self, payment_hash: &str) -> LedgerResult<Option<PendingInvoiceModel>> {
        let key = payment_hash.to_string();
        if let Some(pending) = self.pending_invoices.get(&key).await {
            return Ok(Some(pending));
        }
        match self
            .db
            .read(move |conn| PendingInvoiceQueries::new(conn).get(&key))
            .await
        {
            Ok(pending) => Ok(Some(pending)),
            Err(LedgerError::PendingInvoiceNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn decode(&self, payment_request: &str) -> LedgerResult<DecodedPaymentRequest> {
        let mut decoded = self.node.decode_payment_request(payment_request).await.map_err(|e| {
            warn!("Invalid payment request {}: {}", payment_request, e);
            LedgerError::Validation("invalid payment request format".to_string())
        })?;
        decoded.payment_hash = decoded.payment_hash.to_lowercase();
        Ok(decoded)
    }

    /// Load a wallet that may move funds
    async fn transactable_wallet(&self, wallet: &WalletRef) -> LedgerResult<()> {
        let key = wallet.clone();
        let model = self
            .db
            .read(move |conn| WalletQueries::new(conn).get(&key))
            .await?;
        if model.locked {
            info!("Cannot transact with locked wallet {}", wallet);
            return Err(LedgerError::CannotTransactWithLockedWallet);
        }
        Ok(())
    }

    /// Settle or cancel a pending invoice
    ///
    /// Returns whether this call finalized it. Events for invoices this
    /// ledger does not know, or already finalized, are ignored.
    pub async fn finalize_invoice(&self, event: &InvoiceEvent) -> LedgerResult<bool> {
        if event.state == InvoiceState::Open {
            return Ok(false);
        }
        let payment_hash = event.payment_hash.to_lowercase();

        let pending = match self.pending_invoices.remove(&payment_hash).await {
            Some(pending) => pending,
            None => {
                debug!("Cache miss for pending invoice {} when finalizing", payment_hash);
                let key = payment_hash.clone();
                match self
                    .db
                    .read(move |conn| PendingInvoiceQueries::new(conn).get(&key))
                    .await
                {
                    Ok(pending) => pending,
                    Err(LedgerError::PendingInvoiceNotFound) => {
                        debug!("Invoice {} is not pending on this ledger", payment_hash);
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let settled = event.state == InvoiceState::Settled;
        // Some event sources do not report the received amount
        let amount_msat = if event.amount_paid_msat > 0 {
            event.amount_paid_msat
        } else {
            pending.amount_msat
        };

        let hash = payment_hash.clone();
        let recipient = pending.wallet.clone();
        let finalized = self
            .db
            .transaction(move |tx| {
                match PendingInvoiceQueries::new(tx).delete(&hash) {
                    Ok(()) => {}
                    Err(LedgerError::PendingInvoiceNotFound) => return Ok(false),
                    Err(e) => return Err(e),
                }
                if !settled {
                    return Ok(true);
                }

                WalletQueries::new(tx).increment_balance(&recipient, amount_msat)?;
                TransactionQueries::new(tx).create(None, Some(&recipient), amount_msat, 0, Some(&hash))?;
                InvoiceQueries::new(tx).set_settled(&hash, Utc::now())?;
                Ok(true)
            })
            .await?;

        if finalized {
            if settled {
                info!("Invoice {} settled: credited {} msat to {}", payment_hash, amount_msat, pending.wallet);
            } else {
                info!("Invoice {} canceled", payment_hash);
            }
        }
        Ok(finalized)
    }

    /// Resolve a pending payment
    ///
    /// On success the payer is debited `amount - fee`, a payment transaction
    /// carrying the fee is written and the outgoing invoice is marked
    /// settled. Returns whether this call finalized it.
    pub async fn finalize_payment(&self, payment_hash: &str, success: bool, fee_msat: u64) -> LedgerResult<bool> {
        let payment_hash = payment_hash.to_lowercase();

        let pending = match self.pending_payments.remove(&payment_hash).await {
            Some(pending) => pending,
            None => {
                debug!("Cache miss for pending payment {} when finalizing", payment_hash);
                let key = payment_hash.clone();
                match self
                    .db
                    .read(move |conn| PendingPaymentQueries::new(conn).get(&key))
                    .await
                {
                    Ok(pending) => pending,
                    Err(LedgerError::PendingPaymentNotFound) => {
                        debug!("Payment {} already finalized", payment_hash);
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let hash = payment_hash.clone();
        let payer = pending.wallet.clone();
        let amount_msat = pending.amount_msat;
        let finalized = self
            .db
            .transaction(move |tx| {
                match PendingPaymentQueries::new(tx).delete(&hash) {
                    Ok(()) => {}
                    Err(LedgerError::PendingPaymentNotFound) => return Ok(false),
                    Err(e) => return Err(e),
                }
                if !success {
                    return Ok(true);
                }

                WalletQueries::new(tx).decrement_balance(&payer, amount_msat.saturating_sub(fee_msat))?;
                TransactionQueries::new(tx).create(Some(&payer), None, amount_msat, fee_msat, Some(&hash))?;
                InvoiceQueries::new(tx).set_settled(&hash, Utc::now())?;
                Ok(true)
            })
            .await?;

        if finalized {
            info!(
                "Payment {} from {} finalized: success={}, fee={} msat",
                payment_hash, pending.wallet, success, fee_msat
            );
        }
        Ok(finalized)
    }
}

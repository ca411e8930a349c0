//! Payments between wallets of this ledger
//!
//! When the payment hash belongs to an invoice one of our wallets is waiting
//! on, both ends live in this store and the node cannot route to itself. The
//! payment is settled as a single internal transfer with no fee.

use super::{PaymentManager, PaymentOutcome};
use crate::{
    db::{InvoiceQueries, PendingInvoiceModel, PendingInvoiceQueries, TransactionQueries, WalletQueries, WalletRef},
    LedgerError, LedgerResult,
};
use chrono::Utc;
use tracing::{info, warn};

impl PaymentManager {
    /// Settle an invoice issued by this ledger from one of its wallets
    pub(super) async fn pay_self(
        &self,
        sender: &WalletRef,
        pending: PendingInvoiceModel,
        amount_msat: u64,
    ) -> LedgerResult<PaymentOutcome> {
        let payment_hash = pending.payment_hash.clone();
        info!("Settling invoice {} internally from {} to {}", payment_hash, sender, pending.wallet);

        let payer = sender.clone();
        let recipient = pending.wallet.clone();
        let hash = payment_hash.clone();
        self.db
            .transaction(move |tx| {
                let wallets = WalletQueries::new(tx);
                let confirmed = wallets.confirmed_balance(&payer)?;
                if confirmed < amount_msat {
                    warn!("Wallet {} attempted payment with insufficient funds", payer);
                    return Err(LedgerError::InsufficientBalance);
                }

                InvoiceQueries::new(tx).set_sender_amount(&hash, &payer, amount_msat, Utc::now())?;
                TransactionQueries::new(tx).create(Some(&payer), Some(&recipient), amount_msat, 0, Some(&hash))?;
                PendingInvoiceQueries::new(tx).delete(&hash)?;
                wallets.increment_balance(&recipient, amount_msat)?;
                wallets.decrement_balance(&payer, amount_msat)?;
                Ok(())
            })
            .await?;

        if self.pending_invoices.remove(&payment_hash).await.is_none() {
            warn!("Paid invoice {} internally, but it was not in the pending invoice cache", payment_hash);
        }

        Ok(PaymentOutcome {
            payment_hash,
            amount_msat,
            fee_msat: 0,
            success: true,
            failure_reason: None,
        })
    }
}

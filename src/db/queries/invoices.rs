//! Invoice queries

use crate::db::{sql_u64, u64_column, InvoiceModel, WalletRef};
use crate::{LedgerError, LedgerResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

const INVOICE_COLUMNS: &str = "payment_hash, payment_request, memo, amount, pubkey, sender_username, sender_wallet, recipient_username, recipient_wallet, settled_at, created_at";

fn invoice_from_row(row: &Row<'_>) -> rusqlite::Result<InvoiceModel> {
    Ok(InvoiceModel {
        payment_hash: row.get(0)?,
        payment_request: row.get(1)?,
        memo: row.get(2)?,
        amount_msat: u64_column(row, 3)?,
        pubkey: row.get(4)?,
        sender: WalletRef::from_columns(row.get(5)?, row.get(6)?),
        recipient: WalletRef::from_columns(row.get(7)?, row.get(8)?),
        settled_at: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// Invoice queries
pub struct InvoiceQueries<'a> {
    conn: &'a Connection,
}

impl<'a> InvoiceQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Record an invoice issued by one of our wallets
    pub fn create(&self, invoice: &InvoiceModel) -> LedgerResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO invoices ({INVOICE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                invoice.payment_hash,
                invoice.payment_request,
                invoice.memo,
                sql_u64(invoice.amount_msat)?,
                invoice.pubkey,
                invoice.sender.as_ref().map(|w| &w.username),
                invoice.sender.as_ref().map(|w| &w.wallet_id),
                invoice.recipient.as_ref().map(|w| &w.username),
                invoice.recipient.as_ref().map(|w| &w.wallet_id),
                invoice.settled_at,
                invoice.created_at,
            ],
        )?;
        info!("DB: Created invoice: payment_hash={}", invoice.payment_hash);
        Ok(())
    }

    /// Record an invoice one of our wallets is about to pay
    ///
    /// A row left behind by an earlier failed attempt is taken over. A
    /// settled row means the invoice was already paid, and an unsettled row
    /// with a recipient is one of our own invoices that is no longer pending.
    pub fn upsert_outgoing(&self, invoice: &InvoiceModel) -> LedgerResult<()> {
        let written = self.conn.execute(
            &format!(
                r#"
                INSERT INTO invoices ({INVOICE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(payment_hash) DO UPDATE SET
                    sender_username = excluded.sender_username,
                    sender_wallet = excluded.sender_wallet,
                    amount = excluded.amount
                WHERE invoices.settled_at IS NULL AND invoices.recipient_username IS NULL
                "#
            ),
            params![
                invoice.payment_hash,
                invoice.payment_request,
                invoice.memo,
                sql_u64(invoice.amount_msat)?,
                invoice.pubkey,
                invoice.sender.as_ref().map(|w| &w.username),
                invoice.sender.as_ref().map(|w| &w.wallet_id),
                invoice.recipient.as_ref().map(|w| &w.username),
                invoice.recipient.as_ref().map(|w| &w.wallet_id),
                invoice.settled_at,
                invoice.created_at,
            ],
        )?;
        if written == 0 {
            let existing = self.get(&invoice.payment_hash)?;
            if existing.is_settled() {
                return Err(LedgerError::Validation("invoice has already been paid".to_string()));
            }
            return Err(LedgerError::Validation(
                "invoice was issued by this ledger and is no longer payable".to_string(),
            ));
        }
        info!("DB: Recorded outgoing invoice: payment_hash={}", invoice.payment_hash);
        Ok(())
    }

    /// Get an invoice by payment hash
    pub fn get(&self, payment_hash: &str) -> LedgerResult<InvoiceModel> {
        self.conn
            .query_row(
                &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE payment_hash = ?1"),
                [payment_hash],
                invoice_from_row,
            )
            .optional()?
            .ok_or(LedgerError::InvoiceNotFound)
    }

    /// Get an invoice the wallet sent or received
    pub fn get_for_wallet(&self, wallet: &WalletRef, payment_hash: &str) -> LedgerResult<InvoiceModel> {
        self.conn
            .query_row(
                &format!(
                    r#"
                    SELECT {INVOICE_COLUMNS} FROM invoices
                    WHERE payment_hash = ?1
                      AND ((sender_username = ?2 AND sender_wallet = ?3)
                        OR (recipient_username = ?2 AND recipient_wallet = ?3))
                    "#
                ),
                params![payment_hash, wallet.username, wallet.wallet_id],
                invoice_from_row,
            )
            .optional()?
            .ok_or(LedgerError::InvoiceNotFound)
    }

    /// List invoices the wallet sent or received, newest first
    pub fn list_for_wallet(&self, wallet: &WalletRef) -> LedgerResult<Vec<InvoiceModel>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE (sender_username = ?1 AND sender_wallet = ?2)
               OR (recipient_username = ?1 AND recipient_wallet = ?2)
            ORDER BY created_at DESC
            "#
        ))?;
        let invoices = stmt
            .query_map(params![wallet.username, wallet.wallet_id], invoice_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(invoices)
    }

    /// Set the settlement time unless it is already set
    ///
    /// Returns whether this call settled the invoice.
    pub fn set_settled(&self, payment_hash: &str, settled_at: DateTime<Utc>) -> LedgerResult<bool> {
        let updated = self.conn.execute(
            "UPDATE invoices SET settled_at = ?1 WHERE payment_hash = ?2 AND settled_at IS NULL",
            params![settled_at, payment_hash],
        )?;
        if updated == 0 {
            self.get(payment_hash)?;
            return Ok(false);
        }
        info!("DB: Settled invoice: payment_hash={}", payment_hash);
        Ok(true)
    }

    /// Mark an unsettled invoice as paid by one of our wallets
    pub fn set_sender_amount(
        &self,
        payment_hash: &str,
        sender: &WalletRef,
        amount_msat: u64,
        settled_at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let updated = self.conn.execute(
            r#"
            UPDATE invoices SET sender_username = ?1, sender_wallet = ?2, amount = ?3, settled_at = ?4
            WHERE payment_hash = ?5 AND settled_at IS NULL
            "#,
            params![sender.username, sender.wallet_id, sql_u64(amount_msat)?, settled_at, payment_hash],
        )?;
        if updated == 0 {
            self.get(payment_hash)?;
            return Err(LedgerError::Validation("invoice has already been paid".to_string()));
        }
        info!("DB: Invoice {} paid by {}", payment_hash, sender);
        Ok(())
    }

    /// Delete an invoice
    pub fn delete(&self, payment_hash: &str) -> LedgerResult<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM invoices WHERE payment_hash = ?1", [payment_hash])?;
        if deleted == 0 {
            return Err(LedgerError::InvoiceNotFound);
        }
        Ok(())
    }
}

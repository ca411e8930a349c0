//! Pending invoice and payment queries

use crate::db::{is_unique_violation, sql_u64, u64_column, PendingInvoiceModel, PendingPaymentModel, WalletRef};
use crate::{LedgerError, LedgerResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

const PENDING_INVOICE_COLUMNS: &str = "payment_hash, username, wallet_id, amount, created_at";
const PENDING_PAYMENT_COLUMNS: &str = "payment_hash, username, wallet_id, amount, withdraw_k1, created_at";

fn pending_invoice_from_row(row: &Row<'_>) -> rusqlite::Result<PendingInvoiceModel> {
    Ok(PendingInvoiceModel {
        payment_hash: row.get(0)?,
        wallet: WalletRef::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
        amount_msat: u64_column(row, 3)?,
        created_at: row.get(4)?,
    })
}

fn pending_payment_from_row(row: &Row<'_>) -> rusqlite::Result<PendingPaymentModel> {
    Ok(PendingPaymentModel {
        payment_hash: row.get(0)?,
        wallet: WalletRef::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
        amount_msat: u64_column(row, 3)?,
        withdraw_k1: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Pending invoice queries
pub struct PendingInvoiceQueries<'a> {
    conn: &'a Connection,
}

impl<'a> PendingInvoiceQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Start waiting for an invoice to settle
    pub fn create(&self, payment_hash: &str, wallet: &WalletRef, amount_msat: u64) -> LedgerResult<PendingInvoiceModel> {
        let pending = PendingInvoiceModel {
            payment_hash: payment_hash.to_string(),
            wallet: wallet.clone(),
            amount_msat,
            created_at: Utc::now(),
        };
        self.conn.execute(
            &format!("INSERT INTO pending_invoices ({PENDING_INVOICE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
            params![
                pending.payment_hash,
                wallet.username,
                wallet.wallet_id,
                sql_u64(amount_msat)?,
                pending.created_at
            ],
        )?;
        info!("DB: Created pending invoice: payment_hash={}", payment_hash);
        Ok(pending)
    }

    /// Get a pending invoice
    pub fn get(&self, payment_hash: &str) -> LedgerResult<PendingInvoiceModel> {
        self.conn
            .query_row(
                &format!("SELECT {PENDING_INVOICE_COLUMNS} FROM pending_invoices WHERE payment_hash = ?1"),
                [payment_hash],
                pending_invoice_from_row,
            )
            .optional()?
            .ok_or(LedgerError::PendingInvoiceNotFound)
    }

    /// Stop waiting for an invoice
    pub fn delete(&self, payment_hash: &str) -> LedgerResult<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM pending_invoices WHERE payment_hash = ?1", [payment_hash])?;
        if deleted == 0 {
            return Err(LedgerError::PendingInvoiceNotFound);
        }
        info!("DB: Deleted pending invoice: payment_hash={}", payment_hash);
        Ok(())
    }

    /// List every pending invoice
    pub fn list_all(&self) -> LedgerResult<Vec<PendingInvoiceModel>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PENDING_INVOICE_COLUMNS} FROM pending_invoices ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map([], pending_invoice_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// List a wallet's pending invoices
    pub fn list_for_wallet(&self, wallet: &WalletRef) -> LedgerResult<Vec<PendingInvoiceModel>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PENDING_INVOICE_COLUMNS} FROM pending_invoices WHERE username = ?1 AND wallet_id = ?2 ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![wallet.username, wallet.wallet_id], pending_invoice_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Pending payment queries
pub struct PendingPaymentQueries<'a> {
    conn: &'a Connection,
}

impl<'a> PendingPaymentQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Reserve funds for an outbound payment
    pub fn create(
        &self,
        payment_hash: &str,
        wallet: &WalletRef,
        amount_msat: u64,
        withdraw_k1: Option<&str>,
    ) -> LedgerResult<PendingPaymentModel> {
        let pending = PendingPaymentModel {
            payment_hash: payment_hash.to_string(),
            wallet: wallet.clone(),
            amount_msat,
            withdraw_k1: withdraw_k1.map(str::to_string),
            created_at: Utc::now(),
        };
        self.conn
            .execute(
                &format!("INSERT INTO pending_payments ({PENDING_PAYMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    pending.payment_hash,
                    wallet.username,
                    wallet.wallet_id,
                    sql_u64(amount_msat)?,
                    pending.withdraw_k1,
                    pending.created_at
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LedgerError::PaymentInFlight
                } else {
                    e.into()
                }
            })?;
        info!("DB: Created pending payment: payment_hash={}, amount={} msat", payment_hash, amount_msat);
        Ok(pending)
    }

    /// Get a pending payment
    pub fn get(&self, payment_hash: &str) -> LedgerResult<PendingPaymentModel> {
        self.conn
            .query_row(
                &format!("SELECT {PENDING_PAYMENT_COLUMNS} FROM pending_payments WHERE payment_hash = ?1"),
                [payment_hash],
                pending_payment_from_row,
            )
            .optional()?
            .ok_or(LedgerError::PendingPaymentNotFound)
    }

    /// Release a reservation
    pub fn delete(&self, payment_hash: &str) -> LedgerResult<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM pending_payments WHERE payment_hash = ?1", [payment_hash])?;
        if deleted == 0 {
            return Err(LedgerError::PendingPaymentNotFound);
        }
        info!("DB: Deleted pending payment: payment_hash={}", payment_hash);
        Ok(())
    }

    /// List every pending payment
    pub fn list_all(&self) -> LedgerResult<Vec<PendingPaymentModel>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PENDING_PAYMENT_COLUMNS} FROM pending_payments ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map([], pending_payment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// List a wallet's pending payments
    pub fn list_for_wallet(&self, wallet: &WalletRef) -> LedgerResult<Vec<PendingPaymentModel>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PENDING_PAYMENT_COLUMNS} FROM pending_payments WHERE username = ?1 AND wallet_id = ?2 ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![wallet.username, wallet.wallet_id], pending_payment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count in-flight payments drawing on a withdraw template
    pub fn count_for_withdraw(&self, k1: &str) -> LedgerResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_payments WHERE withdraw_k1 = ?1",
            [k1],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

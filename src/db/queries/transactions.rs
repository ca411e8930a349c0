//! Ledger transaction queries

use crate::db::{sql_u64, u64_column, TransactionFilter, TransactionModel, TransactionPage, WalletRef};
use crate::{LedgerError, LedgerResult};
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};
use tracing::info;

const TRANSACTION_COLUMNS: &str =
    "id, from_username, from_wallet, to_username, to_wallet, amount, fees_paid, invoice_id, created_at";

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<TransactionModel> {
    Ok(TransactionModel {
        id: row.get(0)?,
        from: WalletRef::from_columns(row.get(1)?, row.get(2)?),
        to: WalletRef::from_columns(row.get(3)?, row.get(4)?),
        amount_msat: u64_column(row, 5)?,
        fees_paid_msat: u64_column(row, 6)?,
        invoice_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// Ledger transaction queries
pub struct TransactionQueries<'a> {
    conn: &'a Connection,
}

impl<'a> TransactionQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Record a balance movement
    pub fn create(
        &self,
        from: Option<&WalletRef>,
        to: Option<&WalletRef>,
        amount_msat: u64,
        fees_paid_msat: u64,
        invoice_id: Option<&str>,
    ) -> LedgerResult<TransactionModel> {
        let transaction = TransactionModel {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.cloned(),
            to: to.cloned(),
            amount_msat,
            fees_paid_msat,
            invoice_id: invoice_id.map(str::to_string),
            created_at: Utc::now(),
        };

        self.conn.execute(
            r#"
            INSERT INTO transactions (id, from_username, from_wallet, to_username, to_wallet, amount, fees_paid, invoice_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                transaction.id,
                from.map(|w| &w.username),
                from.map(|w| &w.wallet_id),
                to.map(|w| &w.username),
                to.map(|w| &w.wallet_id),
                sql_u64(amount_msat)?,
                sql_u64(fees_paid_msat)?,
                transaction.invoice_id,
                transaction.created_at,
            ],
        )?;

        info!(
            "DB: Created transaction {}: amount={} msat, fees={} msat",
            transaction.id, amount_msat, fees_paid_msat
        );
        Ok(transaction)
    }

    /// Get a transaction the wallet took part in
    pub fn get_for_wallet(&self, wallet: &WalletRef, id: &str) -> LedgerResult<TransactionModel> {
        self.conn
            .query_row(
                &format!(
                    r#"
                    SELECT {TRANSACTION_COLUMNS} FROM transactions
                    WHERE id = ?1
                      AND ((from_username = ?2 AND from_wallet = ?3) OR (to_username = ?2 AND to_wallet = ?3))
                    "#
                ),
                params![id, wallet.username, wallet.wallet_id],
                transaction_from_row,
            )
            .optional()?
            .ok_or(LedgerError::TransactionNotFound)
    }

    /// List a wallet's transactions
    pub fn list_for_wallet(&self, wallet: &WalletRef, filter: &TransactionFilter) -> LedgerResult<TransactionPage> {
        self.list(
            "((from_username = ?1 AND from_wallet = ?2) OR (to_username = ?1 AND to_wallet = ?2))",
            vec![
                Box::new(wallet.username.clone()) as Box<dyn ToSql>,
                Box::new(wallet.wallet_id.clone()),
            ],
            filter,
        )
    }

    /// List transactions touching any of a user's wallets
    pub fn list_for_user(&self, username: &str, filter: &TransactionFilter) -> LedgerResult<TransactionPage> {
        self.list(
            "(from_username = ?1 OR to_username = ?1)",
            vec![Box::new(username.to_string()) as Box<dyn ToSql>],
            filter,
        )
    }

    fn list(&self, owner_clause: &str, mut args: Vec<Box<dyn ToSql>>, filter: &TransactionFilter) -> LedgerResult<TransactionPage> {
        if let (Some(start), Some(end)) = (filter.start, filter.end) {
            if start > end {
                return Err(LedgerError::Validation("invalid time range: start is after end".to_string()));
            }
        }

        let mut clause = owner_clause.to_string();
        if let Some(start) = filter.start {
            args.push(Box::new(start));
            clause.push_str(&format!(" AND created_at >= ?{}", args.len()));
        }
        if let Some(end) = filter.end {
            args.push(Box::new(end));
            clause.push_str(&format!(" AND created_at < ?{}", args.len()));
        }

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM transactions WHERE {clause}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;
        let total = u64::try_from(total).unwrap_or(0);

        let order = if filter.descending { "DESC" } else { "ASC" };
        let limit = if filter.limit == 0 { -1 } else { sql_u64(filter.limit)? };
        args.push(Box::new(limit));
        args.push(Box::new(sql_u64(filter.offset)?));
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE {clause} ORDER BY created_at {order}, id {order} LIMIT ?{} OFFSET ?{}",
            args.len() - 1,
            args.len()
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let transactions = stmt
            .query_map(params_from_iter(args.iter()), transaction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let seen = filter.offset + transactions.len() as u64;
        let next_offset = if seen < total { sql_u64(seen)? } else { -1 };

        Ok(TransactionPage {
            transactions,
            next_offset,
            total,
        })
    }
}

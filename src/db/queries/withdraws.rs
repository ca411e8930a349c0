//! LNURL-withdraw template queries

use crate::db::{sql_u64, u64_column, WalletRef, WithdrawModel};
use crate::{LedgerError, LedgerResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

const WITHDRAW_COLUMNS: &str =
    "k1, username, wallet_id, description, min_amount, max_amount, max_use, uses, expires_at, created_at";

fn withdraw_from_row(row: &Row<'_>) -> rusqlite::Result<WithdrawModel> {
    Ok(WithdrawModel {
        k1: row.get(0)?,
        wallet: WalletRef::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
        description: row.get(3)?,
        min_msat: u64_column(row, 4)?,
        max_msat: u64_column(row, 5)?,
        max_use: u64_column(row, 6)?,
        uses: u64_column(row, 7)?,
        expires_at: row.get(8)?,
        created_at: row.get(9)?,
    })
}

/// Withdraw template queries
pub struct WithdrawQueries<'a> {
    conn: &'a Connection,
}

impl<'a> WithdrawQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Store a new template
    pub fn create(&self, withdraw: &WithdrawModel) -> LedgerResult<()> {
        self.conn.execute(
            &format!("INSERT INTO withdraws ({WITHDRAW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                withdraw.k1,
                withdraw.wallet.username,
                withdraw.wallet.wallet_id,
                withdraw.description,
                sql_u64(withdraw.min_msat)?,
                sql_u64(withdraw.max_msat)?,
                sql_u64(withdraw.max_use)?,
                sql_u64(withdraw.uses)?,
                withdraw.expires_at,
                withdraw.created_at,
            ],
        )?;
        info!("DB: Created withdraw template for {}", withdraw.wallet);
        Ok(())
    }

    /// Get an unexpired template by k1
    pub fn get(&self, k1: &str) -> LedgerResult<WithdrawModel> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {WITHDRAW_COLUMNS} FROM withdraws WHERE k1 = ?1 AND (expires_at IS NULL OR expires_at >= ?2)"
                ),
                params![k1, Utc::now()],
                withdraw_from_row,
            )
            .optional()?
            .ok_or(LedgerError::WithdrawNotFound)
    }

    /// Get a template belonging to a wallet, expired or not
    pub fn get_for_wallet(&self, wallet: &WalletRef, k1: &str) -> LedgerResult<WithdrawModel> {
        self.conn
            .query_row(
                &format!("SELECT {WITHDRAW_COLUMNS} FROM withdraws WHERE k1 = ?1 AND username = ?2 AND wallet_id = ?3"),
                params![k1, wallet.username, wallet.wallet_id],
                withdraw_from_row,
            )
            .optional()?
            .ok_or(LedgerError::WithdrawNotFound)
    }

    /// Count one completed withdrawal
    pub fn increment_uses(&self, k1: &str) -> LedgerResult<()> {
        let updated = self
            .conn
            .execute("UPDATE withdraws SET uses = uses + 1 WHERE k1 = ?1", [k1])?;
        if updated == 0 {
            return Err(LedgerError::WithdrawNotFound);
        }
        info!("DB: Incremented withdraw uses: k1={}", k1);
        Ok(())
    }
}

//! Wallet queries and the atomic balance primitives

use crate::db::{is_unique_violation, sql_u64, u64_column, TransactionModel, TransactionQueries, WalletModel, WalletRef};
use crate::{LedgerError, LedgerResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

const WALLET_COLUMNS: &str =
    "username, id, name, api_key, balance, locked, link_key, link_label, created_at, updated_at";

fn wallet_from_row(row: &Row<'_>) -> rusqlite::Result<WalletModel> {
    Ok(WalletModel {
        username: row.get(0)?,
        id: row.get(1)?,
        name: row.get(2)?,
        api_key: row.get(3)?,
        balance_msat: u64_column(row, 4)?,
        locked: row.get(5)?,
        link_key: row.get(6)?,
        link_label: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

/// Wallet queries
pub struct WalletQueries<'a> {
    conn: &'a Connection,
}

impl<'a> WalletQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Create a wallet with a zero balance
    pub fn create(&self, username: &str, id: &str, name: &str, api_key: &str) -> LedgerResult<WalletModel> {
        let now = Utc::now();
        self.conn
            .execute(
                r#"
                INSERT INTO wallets (username, id, name, api_key, balance, locked, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?5)
                "#,
                params![username, id, name, api_key, now],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LedgerError::WalletAlreadyExists
                } else {
                    e.into()
                }
            })?;

        info!("DB: Created wallet: {}/{}", username, id);

        Ok(WalletModel {
            username: username.to_string(),
            id: id.to_string(),
            name: name.to_string(),
            api_key: api_key.to_string(),
            balance_msat: 0,
            locked: false,
            link_key: None,
            link_label: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a wallet
    pub fn get(&self, wallet: &WalletRef) -> LedgerResult<WalletModel> {
        self.conn
            .query_row(
                &format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE username = ?1 AND id = ?2"),
                params![wallet.username, wallet.wallet_id],
                wallet_from_row,
            )
            .optional()?
            .ok_or(LedgerError::WalletNotFound)
    }

    /// Get the wallet owning an API key
    pub fn get_by_api_key(&self, api_key: &str) -> LedgerResult<WalletModel> {
        self.conn
            .query_row(
                &format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE api_key = ?1"),
                [api_key],
                wallet_from_row,
            )
            .optional()?
            .ok_or(LedgerError::WalletNotFound)
    }

    /// List a user's wallets
    pub fn list(&self, username: &str) -> LedgerResult<Vec<WalletModel>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE username = ?1 ORDER BY created_at, id"
        ))?;
        let wallets = stmt
            .query_map([username], wallet_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(wallets)
    }

    /// Read the wallet for mutation, refusing locked wallets
    ///
    /// The surrounding immediate transaction already holds the write lock;
    /// a `CannotUpdateLockedWallet` failure leaves it untouched so callers
    /// performing an unlock can carry on.
    pub fn lock_for_update(&self, wallet: &WalletRef) -> LedgerResult<WalletModel> {
        let model = self.get(wallet)?;
        if model.locked {
            return Err(LedgerError::CannotUpdateLockedWallet);
        }
        Ok(model)
    }

    /// Sum of amounts reserved by in-flight payments
    pub fn pending_total(&self, wallet: &WalletRef) -> LedgerResult<u64> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM pending_payments WHERE username = ?1 AND wallet_id = ?2",
            params![wallet.username, wallet.wallet_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    /// Balance minus in-flight reservations
    pub fn confirmed_balance(&self, wallet: &WalletRef) -> LedgerResult<u64> {
        let model = self.get(wallet)?;
        let pending = self.pending_total(wallet)?;
        Ok(model.balance_msat.saturating_sub(pending))
    }

    /// Add to a wallet's balance
    pub fn increment_balance(&self, wallet: &WalletRef, amount_msat: u64) -> LedgerResult<()> {
        let amount = sql_u64(amount_msat)?;
        let updated = self.conn.execute(
            r#"
            UPDATE wallets SET balance = balance + ?1, updated_at = ?2
            WHERE username = ?3 AND id = ?4 AND balance <= ?5
            "#,
            params![amount, Utc::now(), wallet.username, wallet.wallet_id, i64::MAX - amount],
        )?;
        if updated == 0 {
            self.get(wallet)?;
            return Err(LedgerError::Validation("balance would exceed the maximum".to_string()));
        }
        debug!("DB: Credited {} msat to {}", amount_msat, wallet);
        Ok(())
    }

    /// Subtract from a wallet's balance, keeping in-flight reservations covered
    pub fn decrement_balance(&self, wallet: &WalletRef, amount_msat: u64) -> LedgerResult<()> {
        let pending = self.pending_total(wallet)?;
        let required = amount_msat.saturating_add(pending);

        let updated = self.conn.execute(
            r#"
            UPDATE wallets SET balance = balance - ?1, updated_at = ?2
            WHERE username = ?3 AND id = ?4 AND balance >= ?5
            "#,
            params![
                sql_u64(amount_msat)?,
                Utc::now(),
                wallet.username,
                wallet.wallet_id,
                sql_u64(required)?
            ],
        )?;
        if updated == 0 {
            // distinguish a missing row from an uncovered amount
            self.get(wallet)?;
            return Err(LedgerError::InsufficientBalance);
        }
        debug!("DB: Debited {} msat from {}", amount_msat, wallet);
        Ok(())
    }

    /// Move funds between two wallets of the same user
    pub fn transfer(
        &self,
        username: &str,
        from_id: &str,
        to_id: &str,
        amount_msat: u64,
    ) -> LedgerResult<TransactionModel> {
        if amount_msat == 0 {
            return Err(LedgerError::Validation("transfer amount must be greater than zero".to_string()));
        }
        if from_id == to_id {
            return Err(LedgerError::Validation("cannot transfer to the same wallet".to_string()));
        }

        let from = WalletRef::new(username, from_id);
        let to = WalletRef::new(username, to_id);

        for wallet in [&from, &to] {
            self.lock_for_update(wallet).map_err(|e| match e {
                LedgerError::CannotUpdateLockedWallet => LedgerError::CannotTransactWithLockedWallet,
                other => other,
            })?;
        }

        self.decrement_balance(&from, amount_msat)?;
        self.increment_balance(&to, amount_msat)?;
        let transaction =
            TransactionQueries::new(self.conn).create(Some(&from), Some(&to), amount_msat, 0, None)?;

        info!("DB: Transferred {} msat from {} to {}", amount_msat, from, to);
        Ok(transaction)
    }

    /// Rename a wallet
    pub fn update_name(&self, wallet: &WalletRef, name: &str) -> LedgerResult<()> {
        self.update(wallet, "name", rusqlite::types::Value::Text(name.to_string()))
    }

    /// Lock or unlock a wallet
    pub fn set_locked(&self, wallet: &WalletRef, locked: bool) -> LedgerResult<()> {
        self.update(wallet, "locked", rusqlite::types::Value::Integer(locked.into()))
    }

    /// Overwrite a wallet's balance
    pub fn set_balance(&self, wallet: &WalletRef, balance_msat: u64) -> LedgerResult<()> {
        self.update(wallet, "balance", rusqlite::types::Value::Integer(sql_u64(balance_msat)?))
    }

    fn update(&self, wallet: &WalletRef, column: &'static str, value: rusqlite::types::Value) -> LedgerResult<()> {
        let updated = self.conn.execute(
            &format!("UPDATE wallets SET {column} = ?1, updated_at = ?2 WHERE username = ?3 AND id = ?4"),
            params![value, Utc::now(), wallet.username, wallet.wallet_id],
        )?;
        if updated == 0 {
            return Err(LedgerError::WalletNotFound);
        }
        info!("DB: Updated wallet {}: {}", wallet, column);
        Ok(())
    }

    /// Set the linked LNURL-auth key and label
    pub fn update_link(&self, wallet: &WalletRef, link_key: &str, link_label: Option<&str>) -> LedgerResult<()> {
        let updated = self.conn.execute(
            r#"
            UPDATE wallets SET link_key = ?1, link_label = ?2, updated_at = ?3
            WHERE username = ?4 AND id = ?5
            "#,
            params![link_key, link_label, Utc::now(), wallet.username, wallet.wallet_id],
        )?;
        if updated == 0 {
            return Err(LedgerError::WalletNotFound);
        }
        info!("DB: Linked key to wallet: {}", wallet);
        Ok(())
    }

    /// Delete a wallet
    ///
    /// Removes the wallet's pending invoices, withdraw templates and auth
    /// challenges, and nulls references held by transactions and invoices.
    pub fn delete(&self, wallet: &WalletRef) -> LedgerResult<()> {
        let deleted = self.conn.execute(
            "DELETE FROM wallets WHERE username = ?1 AND id = ?2",
            params![wallet.username, wallet.wallet_id],
        )?;
        if deleted == 0 {
            return Err(LedgerError::WalletNotFound);
        }

        let key = params![wallet.username, wallet.wallet_id];
        self.conn
            .execute("DELETE FROM pending_invoices WHERE username = ?1 AND wallet_id = ?2", key)?;
        self.conn
            .execute("DELETE FROM withdraws WHERE username = ?1 AND wallet_id = ?2", key)?;
        self.conn
            .execute("DELETE FROM auths WHERE wallet_username = ?1 AND wallet_id = ?2", key)?;
        self.conn.execute(
            "UPDATE transactions SET from_username = NULL, from_wallet = NULL WHERE from_username = ?1 AND from_wallet = ?2",
            key,
        )?;
        self.conn.execute(
            "UPDATE transactions SET to_username = NULL, to_wallet = NULL WHERE to_username = ?1 AND to_wallet = ?2",
            key,
        )?;
        self.conn.execute(
            "UPDATE invoices SET sender_username = NULL, sender_wallet = NULL WHERE sender_username = ?1 AND sender_wallet = ?2",
            key,
        )?;
        self.conn.execute(
            "UPDATE invoices SET recipient_username = NULL, recipient_wallet = NULL WHERE recipient_username = ?1 AND recipient_wallet = ?2",
            key,
        )?;

        info!("DB: Deleted wallet: {}", wallet);
        Ok(())
    }
}

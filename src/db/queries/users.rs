//! User queries

use crate::db::{is_unique_violation, UserModel, WalletQueries};
use crate::{LedgerError, LedgerResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

const USER_COLUMNS: &str = "username, api_key, link_key, created_at, updated_at, deleted_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserModel> {
    Ok(UserModel {
        username: row.get(0)?,
        api_key: row.get(1)?,
        link_key: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        deleted_at: row.get(5)?,
    })
}

/// User queries
pub struct UserQueries<'a> {
    conn: &'a Connection,
}

impl<'a> UserQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Create a user
    pub fn create(&self, username: &str, api_key: &str) -> LedgerResult<UserModel> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO users (username, api_key, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![username, api_key, now],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LedgerError::UserAlreadyExists
                } else {
                    e.into()
                }
            })?;

        info!("DB: Created user: username={}", username);

        Ok(UserModel {
            username: username.to_string(),
            api_key: api_key.to_string(),
            link_key: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    /// Get a live (not deleted) user
    pub fn get(&self, username: &str) -> LedgerResult<UserModel> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1 AND deleted_at IS NULL"),
                [username],
                user_from_row,
            )
            .optional()?
            .ok_or(LedgerError::UserNotFound)
    }

    /// Get the live user owning an API key
    pub fn get_by_api_key(&self, api_key: &str) -> LedgerResult<UserModel> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE api_key = ?1 AND deleted_at IS NULL"),
                [api_key],
                user_from_row,
            )
            .optional()?
            .ok_or(LedgerError::UserNotFound)
    }

    /// List live users
    pub fn list(&self) -> LedgerResult<Vec<UserModel>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE deleted_at IS NULL ORDER BY username"
        ))?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Set the linked LNURL-auth key
    pub fn update_link_key(&self, username: &str, link_key: &str) -> LedgerResult<()> {
        let updated = self.conn.execute(
            "UPDATE users SET link_key = ?1, updated_at = ?2 WHERE username = ?3 AND deleted_at IS NULL",
            params![link_key, Utc::now(), username],
        )?;
        if updated == 0 {
            return Err(LedgerError::UserNotFound);
        }
        info!("DB: Linked key to user: username={}", username);
        Ok(())
    }

    /// Tombstone a user and delete its wallets
    ///
    /// Wallet deletion nulls the references held by transactions and
    /// invoices, so history survives without pointing at the user.
    pub fn soft_delete(&self, username: &str) -> LedgerResult<()> {
        let now = Utc::now();
        let updated = self.conn.execute(
            "UPDATE users SET deleted_at = ?1, updated_at = ?1 WHERE username = ?2 AND deleted_at IS NULL",
            params![now, username],
        )?;
        if updated == 0 {
            return Err(LedgerError::UserNotFound);
        }

        let wallets = WalletQueries::new(self.conn);
        for wallet in wallets.list(username)? {
            wallets.delete(&wallet.wallet_ref())?;
        }

        self.conn
            .execute("DELETE FROM auths WHERE user_username = ?1", [username])?;

        info!("DB: Deleted user: username={}", username);
        Ok(())
    }
}

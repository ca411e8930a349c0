//! LNURL-auth challenge queries

use crate::db::{AuthModel, AuthSubject, WalletRef};
use crate::{LedgerError, LedgerResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

const AUTH_COLUMNS: &str =
    "k1, user_username, wallet_username, wallet_id, link, link_label, authed, expires_at, created_at";

fn auth_from_row(row: &Row<'_>) -> rusqlite::Result<AuthModel> {
    let user: Option<String> = row.get(1)?;
    let wallet = WalletRef::from_columns(row.get(2)?, row.get(3)?);
    let subject = match (user, wallet) {
        (Some(username), None) => AuthSubject::User(username),
        (None, Some(wallet)) => AuthSubject::Wallet(wallet),
        _ => {
            return Err(rusqlite::Error::InvalidColumnType(
                1,
                "user_username".to_string(),
                rusqlite::types::Type::Null,
            ))
        }
    };

    Ok(AuthModel {
        k1: row.get(0)?,
        subject,
        link: row.get(4)?,
        link_label: row.get(5)?,
        authed: row.get(6)?,
        expires_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// Auth challenge queries
pub struct AuthQueries<'a> {
    conn: &'a Connection,
}

impl<'a> AuthQueries<'a> {
    /// Create a new query instance
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Store a new challenge
    pub fn create(&self, auth: &AuthModel) -> LedgerResult<()> {
        let (user, wallet) = match &auth.subject {
            AuthSubject::User(username) => (Some(username), None),
            AuthSubject::Wallet(wallet) => (None, Some(wallet)),
        };
        self.conn.execute(
            &format!("INSERT INTO auths ({AUTH_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                auth.k1,
                user,
                wallet.map(|w| &w.username),
                wallet.map(|w| &w.wallet_id),
                auth.link,
                auth.link_label,
                auth.authed,
                auth.expires_at,
                auth.created_at,
            ],
        )?;
        info!("DB: Created auth challenge: link={}", auth.link);
        Ok(())
    }

    /// Get an unexpired challenge
    pub fn get(&self, k1: &str) -> LedgerResult<AuthModel> {
        self.conn
            .query_row(
                &format!("SELECT {AUTH_COLUMNS} FROM auths WHERE k1 = ?1 AND expires_at >= ?2"),
                params![k1, Utc::now()],
                auth_from_row,
            )
            .optional()?
            .ok_or(LedgerError::AuthNotFound)
    }

    /// Record a valid signature
    pub fn set_authed(&self, k1: &str) -> LedgerResult<()> {
        let updated = self
            .conn
            .execute("UPDATE auths SET authed = 1 WHERE k1 = ?1", [k1])?;
        if updated == 0 {
            return Err(LedgerError::AuthNotFound);
        }
        info!("DB: Auth challenge authenticated");
        Ok(())
    }
}

//! Ledger store
//!
//! This module handles persistent storage for:
//! - Users and their wallets (balances, lock state, API keys)
//! - Ledger transactions and invoices
//! - Pending invoices and payments awaiting settlement
//! - LNURL withdraw templates and auth challenges
//!
//! Every mutation runs inside [`Database::transaction`]. The scope is a
//! `BEGIN IMMEDIATE` transaction on the single connection, so the closure
//! holds the write lock on every row it touches until it returns.

use crate::LedgerResult;
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod models;
mod queries;

pub use models::*;
pub use queries::*;

/// Ledger database
#[derive(Clone)]
pub struct Database {
    /// SQLite connection (wrapped in Arc<Mutex> for thread safety)
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to database at {}", database_url);

        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Self::run_migrations(&conn)?;

        info!("Database connected successfully");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations
    fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
        debug!("Running database migrations...");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                api_key TEXT NOT NULL UNIQUE,
                link_key TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                deleted_at DATETIME
            );

            CREATE TABLE IF NOT EXISTS wallets (
                username TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                api_key TEXT NOT NULL UNIQUE,
                balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
                locked BOOLEAN NOT NULL DEFAULT 0,
                link_key TEXT,
                link_label TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (username, id)
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                from_username TEXT,
                from_wallet TEXT,
                to_username TEXT,
                to_wallet TEXT,
                amount INTEGER NOT NULL CHECK (amount >= 0),
                fees_paid INTEGER NOT NULL DEFAULT 0 CHECK (fees_paid >= 0),
                invoice_id TEXT,
                created_at DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_from ON transactions(from_username, from_wallet);
            CREATE INDEX IF NOT EXISTS idx_transactions_to ON transactions(to_username, to_wallet);
            CREATE INDEX IF NOT EXISTS idx_transactions_created ON transactions(created_at);

            CREATE TABLE IF NOT EXISTS invoices (
                payment_hash TEXT PRIMARY KEY,
                payment_request TEXT NOT NULL,
                memo TEXT NOT NULL DEFAULT '',
                amount INTEGER NOT NULL,
                pubkey TEXT NOT NULL,
                sender_username TEXT,
                sender_wallet TEXT,
                recipient_username TEXT,
                recipient_wallet TEXT,
                settled_at DATETIME,
                created_at DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_invoices_sender ON invoices(sender_username, sender_wallet);
            CREATE INDEX IF NOT EXISTS idx_invoices_recipient ON invoices(recipient_username, recipient_wallet);

            CREATE TABLE IF NOT EXISTS pending_invoices (
                payment_hash TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                wallet_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending_payments (
                payment_hash TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                wallet_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                withdraw_k1 TEXT,
                created_at DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pending_payments_wallet ON pending_payments(username, wallet_id);
            CREATE INDEX IF NOT EXISTS idx_pending_payments_k1 ON pending_payments(withdraw_k1);

            CREATE TABLE IF NOT EXISTS withdraws (
                k1 TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                wallet_id TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                min_amount INTEGER NOT NULL,
                max_amount INTEGER NOT NULL,
                max_use INTEGER NOT NULL,
                uses INTEGER NOT NULL DEFAULT 0,
                expires_at DATETIME,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS auths (
                k1 TEXT PRIMARY KEY,
                user_username TEXT,
                wallet_username TEXT,
                wallet_id TEXT,
                link BOOLEAN NOT NULL DEFAULT 0,
                link_label TEXT,
                authed BOOLEAN NOT NULL DEFAULT 0,
                expires_at DATETIME NOT NULL,
                created_at DATETIME NOT NULL,
                CHECK ((user_username IS NULL) <> (wallet_username IS NULL))
            );
            "#,
        )?;

        debug!("Database migrations completed");
        Ok(())
    }

    /// Run `f` inside one immediate transaction
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back on `Err`.
    pub async fn transaction<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&Connection) -> LedgerResult<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run read-only queries outside an explicit transaction
    pub async fn read<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&Connection) -> LedgerResult<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Close the database connection
    pub async fn close(&self) {
        info!("Closing database connection...");
        // The connection will be closed when the Arc is dropped
        info!("Database connection closed");
    }
}

/// Whether `e` is a primary key or unique constraint violation
pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => matches!(
            err.extended_code,
            rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        ),
        _ => false,
    }
}

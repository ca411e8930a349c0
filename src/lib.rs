//! LDK-Ledger: a multi-tenant custodial ledger on top of one Lightning node
//!
//! Many users and wallets share a single LDK Server node. This crate keeps a
//! per-wallet balance that stays consistent with the node's in-flight and
//! settled payments and invoices, across restarts and concurrent requests.
//!
//! - **Ledger store**: users, wallets, transactions, invoices and pending
//!   records in SQLite, with atomic balance primitives
//! - **Reconciliation**: invoice creation, payment execution, settlement
//!   tracking, startup recovery and the same-node self-payment path
//! - **Auth**: layered admin / user / wallet API key resolution
//! - **LNURL**: withdraw templates and auth challenges
//!
//! # Architecture
//!
//! 1. Every write goes through [`db::Database::transaction`], which runs a
//!    closure inside one immediate SQLite transaction
//! 2. The [`payments::PaymentManager`] talks to the node through the
//!    [`node::PaymentNetworkClient`] trait and finalizes pending records as
//!    settlement events arrive
//! 3. With the `ldk-server` feature the node is an LDK Server instance and
//!    settlement events are consumed from its RabbitMQ exchange
//!
#![warn(missing_docs)]

pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod keys;
pub mod ledger;
pub mod lnurl;
pub mod node;
pub mod payments;
#[cfg(feature = "ldk-server")]
pub mod rabbitmq;
pub mod validation;

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

pub use config::Config;
use auth::AuthService;
use db::Database;
use ledger::{UserManager, WalletManager};
use lnurl::{LnurlAuthManager, WithdrawManager};
use node::PaymentNetworkClient;
use payments::PaymentManager;

/// The main ledger application state
#[derive(Clone)]
pub struct LedgerApp {
    /// Application configuration
    pub config: Arc<Config>,
    /// Ledger store
    pub db: Arc<Database>,
    /// Payment network client
    pub node: Arc<dyn PaymentNetworkClient>,
    /// Credential resolution
    pub auth: Arc<AuthService>,
    /// User lifecycle
    pub users: Arc<UserManager>,
    /// Wallet lifecycle, transfers and transaction history
    pub wallets: Arc<WalletManager>,
    /// Invoice and payment reconciliation
    pub payments: Arc<PaymentManager>,
    /// LNURL-withdraw templates
    pub withdraws: Arc<WithdrawManager>,
    /// LNURL-auth challenges
    pub lnurl_auth: Arc<LnurlAuthManager>,
    #[cfg(feature = "ldk-server")]
    events: Arc<tokio::sync::Mutex<Option<rabbitmq::RabbitMqConsumer>>>,
}

impl LedgerApp {
    /// Create a new ledger application connected to LDK Server
    #[cfg(feature = "ldk-server")]
    pub async fn new(config: Config) -> Result<Self> {
        let hub = node::InvoiceEventHub::new();
        let client = node::LdkServerClient::connect(&config.ldk_server, hub.clone()).await?;
        let consumer = config
            .ldk_server
            .rabbitmq
            .clone()
            .map(|rabbitmq| rabbitmq::RabbitMqConsumer::new(rabbitmq, hub));

        let mut app = Self::with_node(config, Arc::new(client)).await?;
        app.events = Arc::new(tokio::sync::Mutex::new(consumer));
        Ok(app)
    }

    /// Create a new ledger application on top of any payment network client
    pub async fn with_node(config: Config, node: Arc<dyn PaymentNetworkClient>) -> Result<Self> {
        info!("Initializing LDK-Ledger application...");

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
        let config = Arc::new(config);

        let db_url = config.resolve_database_url();
        info!("Connecting to database at: {}", db_url);
        let db = Arc::new(Database::connect(&db_url).await?);

        let auth = Arc::new(AuthService::new(&config, db.clone()));
        let users = Arc::new(UserManager::new(db.clone(), auth.credentials()));
        let wallets = Arc::new(WalletManager::new(db.clone(), auth.credentials()));
        let payments = PaymentManager::new(config.clone(), db.clone(), node.clone());
        let withdraws = Arc::new(WithdrawManager::new(config.clone(), db.clone()));
        let lnurl_auth = Arc::new(LnurlAuthManager::new(config.clone(), db.clone()));

        info!("LDK-Ledger application initialized successfully");

        Ok(Self {
            config,
            db,
            node,
            auth,
            users,
            wallets,
            payments,
            withdraws,
            lnurl_auth,
            #[cfg(feature = "ldk-server")]
            events: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    /// Start the background tasks
    pub async fn start(&self) -> Result<()> {
        #[cfg(feature = "ldk-server")]
        {
            let mut events = self.events.lock().await;
            match events.as_mut() {
                Some(consumer) => {
                    info!("Starting RabbitMQ event consumer...");
                    consumer.start().await?;
                }
                None => info!("RabbitMQ not configured, invoices are only settled by recovery"),
            }
        }

        self.auth.start_janitor();
        if let Err(e) = self.payments.start().await {
            error!("Failed to start payment manager: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Start the application and run until the shutdown signal fires
    pub async fn run_with_shutdown(&self, shutdown_rx: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        info!("Starting LDK-Ledger application...");
        self.start().await?;
        info!("LDK-Ledger running");

        let _ = shutdown_rx.await;
        self.shutdown().await
    }

    /// Stop the background tasks
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down LDK-Ledger...");
        self.payments.shutdown();
        self.auth.shutdown();
        self.db.close().await;
        info!("LDK-Ledger shutdown complete");
        Ok(())
    }
}

/// Error classes as seen by a transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A referenced record does not exist
    NotFound,
    /// A record with the same identity already exists
    Conflict,
    /// A business rule rejected the request
    BusinessRule,
    /// The wallet is locked
    Locked,
    /// Credentials were wrong or missing
    Unauthenticated,
    /// Credentials were malformed
    InvalidFormat,
    /// The caller should try again later
    Retryable,
    /// Storage or node failure
    Internal,
}

/// Ledger error types
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// No such user
    #[error("user not found")]
    UserNotFound,

    /// No such wallet
    #[error("wallet not found")]
    WalletNotFound,

    /// No such transaction
    #[error("transaction not found")]
    TransactionNotFound,

    /// No such invoice
    #[error("invoice not found")]
    InvoiceNotFound,

    /// No pending invoice with that hash
    #[error("pending invoice not found")]
    PendingInvoiceNotFound,

    /// No pending payment with that hash
    #[error("pending payment not found")]
    PendingPaymentNotFound,

    /// No unexpired withdraw template with that k1
    #[error("withdraw request not found")]
    WithdrawNotFound,

    /// No unexpired auth challenge with that k1
    #[error("auth token not found")]
    AuthNotFound,

    /// Duplicate username
    #[error("user with that username already exists")]
    UserAlreadyExists,

    /// Duplicate wallet id for the same user
    #[error("wallet with that id already exists")]
    WalletAlreadyExists,

    /// A payment with the same hash is already in flight
    #[error("a payment for that invoice is already in flight")]
    PaymentInFlight,

    /// Spendable balance does not cover the request
    #[error("wallet has insufficient balance")]
    InsufficientBalance,

    /// Wallet must be empty before it can be deleted
    #[error("wallet balance must be zero")]
    NonZeroBalance,

    /// Wallet is locked
    #[error("wallet is locked")]
    WalletLocked,

    /// Mutation refused because the wallet is locked
    #[error("cannot update locked wallet")]
    CannotUpdateLockedWallet,

    /// Balance movement refused because a wallet is locked
    #[error("cannot transact with locked wallet")]
    CannotTransactWithLockedWallet,

    /// Wrong credentials
    #[error("unauthenticated")]
    Unauthenticated,

    /// Malformed credential headers
    #[error("invalid header format")]
    InvalidHeaderFormat,

    /// Username header required but absent
    #[error("missing username")]
    MissingUsername,

    /// Invalid request parameters
    #[error("{0}")]
    Validation(String),

    /// Transient business condition
    #[error("{0}")]
    Retryable(String),

    /// Storage failure; the cause is kept for logs only
    #[error("internal database error")]
    Database(#[source] rusqlite::Error),

    /// Payment network failure
    #[error("Lightning node error: {0}")]
    Node(String),
}

impl LedgerError {
    /// Classify this error for the transport boundary
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UserNotFound
            | Self::WalletNotFound
            | Self::TransactionNotFound
            | Self::InvoiceNotFound
            | Self::PendingInvoiceNotFound
            | Self::PendingPaymentNotFound
            | Self::WithdrawNotFound
            | Self::AuthNotFound => ErrorKind::NotFound,
            Self::UserAlreadyExists | Self::WalletAlreadyExists | Self::PaymentInFlight => {
                ErrorKind::Conflict
            }
            Self::InsufficientBalance | Self::NonZeroBalance | Self::Validation(_) => {
                ErrorKind::BusinessRule
            }
            Self::WalletLocked
            | Self::CannotUpdateLockedWallet
            | Self::CannotTransactWithLockedWallet => ErrorKind::Locked,
            Self::Unauthenticated => ErrorKind::Unauthenticated,
            Self::InvalidHeaderFormat | Self::MissingUsername => ErrorKind::InvalidFormat,
            Self::Retryable(_) => ErrorKind::Retryable,
            Self::Database(_) | Self::Node(_) => ErrorKind::Internal,
        }
    }

    /// Whether this is a not-found sentinel
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e)
    }
}

/// Result type alias for ledger operations
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(LedgerError::WalletNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(LedgerError::UserAlreadyExists.kind(), ErrorKind::Conflict);
        assert_eq!(LedgerError::InsufficientBalance.kind(), ErrorKind::BusinessRule);
        assert_eq!(LedgerError::CannotUpdateLockedWallet.kind(), ErrorKind::Locked);
        assert_eq!(LedgerError::MissingUsername.kind(), ErrorKind::InvalidFormat);
        assert_eq!(
            LedgerError::Retryable("processing other withdrawals. Retry.".into()).kind(),
            ErrorKind::Retryable
        );
        assert!(LedgerError::PendingInvoiceNotFound.is_not_found());
    }

    #[test]
    fn test_database_error_is_opaque() {
        let err = LedgerError::from(rusqlite::Error::InvalidQuery);
        assert_eq!(err.to_string(), "internal database error");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}

//! User management

use super::ensure_no_payments_in_flight;
use crate::{
    auth::CredentialStore,
    db::{Database, TransactionFilter, TransactionPage, TransactionQueries, UserModel, UserQueries, WalletModel, WalletQueries},
    keys::generate_api_key,
    validation::validate_username,
    LedgerError, LedgerResult,
};
use std::sync::Arc;
use tracing::{info, warn};

/// A new user with its default wallet
///
/// The API keys are only ever handed out here.
#[derive(Debug, Clone)]
pub struct CreatedUser {
    /// The user
    pub user: UserModel,
    /// Default wallet, whose id and name equal the username
    pub wallet: WalletModel,
}

/// User manager
pub struct UserManager {
    db: Arc<Database>,
    credentials: Arc<CredentialStore>,
}

impl UserManager {
    /// Create a new user manager
    pub fn new(db: Arc<Database>, credentials: Arc<CredentialStore>) -> Self {
        Self { db, credentials }
    }

    /// Create a user and its default wallet
    ///
    /// Without a username, a random one is generated.
    pub async fn create_user(&self, username: Option<&str>) -> LedgerResult<CreatedUser> {
        let username = match username.map(str::trim).filter(|u| !u.is_empty()) {
            Some(username) => username.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        validate_username(&username)?;

        let user_key = generate_api_key();
        let wallet_key = generate_api_key();
        let created = self
            .db
            .transaction(move |tx| {
                let user = UserQueries::new(tx).create(&username, &user_key)?;
                let wallet = WalletQueries::new(tx)
                    .create(&username, &username, &username, &wallet_key)
                    .map_err(|e| {
                        warn!("Failed to create default wallet for new user {}: {}", username, e);
                        e
                    })?;
                Ok(CreatedUser { user, wallet })
            })
            .await?;

        info!("Created user {}", created.user.username);
        Ok(created)
    }

    /// Get a user
    pub async fn get_user(&self, username: &str) -> LedgerResult<UserModel> {
        let username = username.to_string();
        self.db
            .read(move |conn| UserQueries::new(conn).get(&username))
            .await
    }

    /// List every user
    pub async fn list_users(&self) -> LedgerResult<Vec<UserModel>> {
        self.db.read(|conn| UserQueries::new(conn).list()).await
    }

    /// Get the user owning an API key
    pub async fn get_user_with_api_key(&self, api_key: &str) -> LedgerResult<UserModel> {
        let api_key = api_key.to_string();
        self.db
            .read(move |conn| UserQueries::new(conn).get_by_api_key(&api_key))
            .await
    }

    /// Delete a user
    ///
    /// Tombstones the user, deletes its wallets and nulls the references
    /// history rows hold to them, all in one transaction. Refused while any
    /// of the user's wallets has a payment in flight.
    pub async fn delete_user(&self, username: &str) -> LedgerResult<()> {
        let name = username.to_string();
        self.db
            .transaction(move |tx| {
                UserQueries::new(tx).get(&name)?;
                for wallet in WalletQueries::new(tx).list(&name)? {
                    ensure_no_payments_in_flight(tx, &wallet.wallet_ref())?;
                }
                UserQueries::new(tx).soft_delete(&name)
            })
            .await?;

        self.credentials.forget_user(username).await;
        info!("Deleted user {}", username);
        Ok(())
    }

    /// List transactions across all of a user's wallets
    pub async fn list_user_transactions(
        &self,
        username: &str,
        filter: &TransactionFilter,
    ) -> LedgerResult<TransactionPage> {
        if let (Some(start), Some(end)) = (filter.start, filter.end) {
            if start >= end {
                return Err(LedgerError::Validation("invalid time range".to_string()));
            }
        }
        let username = username.to_string();
        let filter = filter.clone();
        self.db
            .read(move |conn| {
                UserQueries::new(conn).get(&username)?;
                TransactionQueries::new(conn).list_for_user(&username, &filter)
            })
            .await
    }
}

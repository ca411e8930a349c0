//! Cached API keys
//!
//! Keys are read from the store on a miss and kept for
//! `auth.credential_cache_ttl_seconds`. Deleting a user or a wallet must
//! call [`CredentialStore::forget_user`] or [`CredentialStore::forget_wallet`]
//! so a deleted key stops working before its entry expires.

use crate::{
    cache::TtlCache,
    config::AuthConfig,
    db::{Database, UserQueries, WalletQueries, WalletRef},
    LedgerError, LedgerResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-user and per-wallet API keys behind a time-bounded cache
pub struct CredentialStore {
    db: Arc<Database>,
    /// username -> user key
    user_keys: TtlCache<String, String>,
    /// wallet -> wallet key
    wallet_keys: TtlCache<WalletRef, String>,
    /// wallet -> key of the user owning it
    wallet_owner_keys: TtlCache<WalletRef, String>,
}

impl CredentialStore {
    /// Create an empty credential store
    pub fn new(config: &AuthConfig, db: Arc<Database>) -> Self {
        let ttl = Duration::from_secs(config.credential_cache_ttl_seconds);
        let purge = Duration::from_secs(config.credential_cache_purge_seconds);
        Self {
            db,
            user_keys: TtlCache::new("user_keys", ttl, purge),
            wallet_keys: TtlCache::new("wallet_keys", ttl, purge),
            wallet_owner_keys: TtlCache::new("wallet_owner_keys", ttl, purge),
        }
    }

    /// Spawn the janitors of every cache
    pub fn spawn_janitors(&self, cancel: &CancellationToken) {
        self.user_keys.spawn_janitor(cancel.child_token());
        self.wallet_keys.spawn_janitor(cancel.child_token());
        self.wallet_owner_keys.spawn_janitor(cancel.child_token());
    }

    /// Whether a live user exists
    pub async fn user_exists(&self, username: &str) -> LedgerResult<bool> {
        let key = username.to_string();
        match self.db.read(move |conn| UserQueries::new(conn).get(&key)).await {
            Ok(_) => Ok(true),
            Err(LedgerError::UserNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether `api_key` is the user's key
    pub async fn user_key_matches(&self, username: &str, api_key: &str) -> LedgerResult<bool> {
        let cache_key = username.to_string();
        let stored = match self.user_keys.get(&cache_key).await {
            Some(stored) => stored,
            None => {
                debug!("Cache miss for user authentication: {}", username);
                let key = cache_key.clone();
                match self.db.read(move |conn| UserQueries::new(conn).get(&key)).await {
                    Ok(user) => {
                        self.user_keys.insert(cache_key, user.api_key.clone()).await;
                        user.api_key
                    }
                    Err(LedgerError::UserNotFound) => return Ok(false),
                    Err(e) => return Err(e),
                }
            }
        };
        Ok(stored == api_key)
    }

    /// Whether the wallet exists under the user presenting `user_key`
    ///
    /// Only meaningful once `user_key` has been matched against the user.
    pub async fn user_owns_wallet(&self, wallet: &WalletRef, user_key: &str) -> LedgerResult<bool> {
        if let Some(stored) = self.wallet_owner_keys.get(wallet).await {
            return Ok(stored == user_key);
        }

        debug!("Cache miss for wallet ownership: {}", wallet);
        let key = wallet.clone();
        match self.db.read(move |conn| WalletQueries::new(conn).get(&key)).await {
            Ok(_) => {
                self.wallet_owner_keys
                    .insert(wallet.clone(), user_key.to_string())
                    .await;
                Ok(true)
            }
            Err(LedgerError::WalletNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether `api_key` is the wallet's own key
    pub async fn wallet_key_matches(&self, wallet: &WalletRef, api_key: &str) -> LedgerResult<bool> {
        let stored = match self.wallet_keys.get(wallet).await {
            Some(stored) => stored,
            None => {
                debug!("Cache miss for wallet authentication: {}", wallet);
                let key = wallet.clone();
                match self.db.read(move |conn| WalletQueries::new(conn).get(&key)).await {
                    Ok(model) => {
                        self.wallet_keys.insert(wallet.clone(), model.api_key.clone()).await;
                        model.api_key
                    }
                    Err(LedgerError::WalletNotFound) => return Ok(false),
                    Err(e) => return Err(e),
                }
            }
        };
        Ok(stored == api_key)
    }

    /// Drop everything cached for a user and its wallets
    pub async fn forget_user(&self, username: &str) {
        self.user_keys.remove(&username.to_string()).await;
        self.wallet_keys.retain_keys(|wallet| wallet.username != username).await;
        self.wallet_owner_keys
            .retain_keys(|wallet| wallet.username != username)
            .await;
    }

    /// Drop everything cached for a wallet
    pub async fn forget_wallet(&self, wallet: &WalletRef) {
        self.wallet_keys.remove(wallet).await;
        self.wallet_owner_keys.remove(wallet).await;
    }
}

//! Wallet management

use super::ensure_no_payments_in_flight;
use crate::{
    auth::CredentialStore,
    db::{
        Database, TransactionFilter, TransactionModel, TransactionPage, TransactionQueries, UserQueries, WalletModel,
        WalletOptions, WalletQueries, WalletRef,
    },
    keys::generate_api_key,
    validation::{validate_wallet_id, validate_wallet_name},
    LedgerError, LedgerResult,
};
use std::sync::Arc;
use tracing::info;

/// Wallet manager
pub struct WalletManager {
    db: Arc<Database>,
    credentials: Arc<CredentialStore>,
}

impl WalletManager {
    /// Create a new wallet manager
    pub fn new(db: Arc<Database>, credentials: Arc<CredentialStore>) -> Self {
        Self { db, credentials }
    }

    /// Create a wallet for an existing user
    ///
    /// Without an id a random one is generated; the name defaults to the id.
    pub async fn create_wallet(&self, username: &str, id: Option<&str>, name: Option<&str>) -> LedgerResult<WalletModel> {
        let id = match id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        validate_wallet_id(&id)?;
        let name = match name.filter(|name| !name.is_empty()) {
            Some(name) => {
                validate_wallet_name(name)?;
                name.to_string()
            }
            None => id.clone(),
        };

        let username = username.to_string();
        let api_key = generate_api_key();
        let wallet = self
            .db
            .transaction(move |tx| {
                UserQueries::new(tx).get(&username)?;
                WalletQueries::new(tx).create(&username, &id, &name, &api_key)
            })
            .await?;

        info!("Created wallet {}", wallet.wallet_ref());
        Ok(wallet)
    }

    /// Get a wallet
    pub async fn get_wallet(&self, wallet: &WalletRef) -> LedgerResult<WalletModel> {
        let wallet = wallet.clone();
        self.db
            .read(move |conn| WalletQueries::new(conn).get(&wallet))
            .await
    }

    /// Get the wallet owning an API key
    pub async fn get_wallet_with_api_key(&self, api_key: &str) -> LedgerResult<WalletModel> {
        let api_key = api_key.to_string();
        self.db
            .read(move |conn| WalletQueries::new(conn).get_by_api_key(&api_key))
            .await
    }

    /// List a user's wallets
    pub async fn list_wallets(&self, username: &str) -> LedgerResult<Vec<WalletModel>> {
        let username = username.to_string();
        self.db
            .read(move |conn| {
                UserQueries::new(conn).get(&username)?;
                WalletQueries::new(conn).list(&username)
            })
            .await
    }

    /// Balance not reserved by payments in flight
    pub async fn confirmed_balance(&self, wallet: &WalletRef) -> LedgerResult<u64> {
        let wallet = wallet.clone();
        self.db
            .read(move |conn| WalletQueries::new(conn).confirmed_balance(&wallet))
            .await
    }

    /// Delete an empty, unlocked wallet
    pub async fn delete_wallet(&self, wallet: &WalletRef) -> LedgerResult<()> {
        self.delete(wallet, true).await
    }

    /// Delete an unlocked wallet regardless of its balance
    pub async fn admin_delete_wallet(&self, wallet: &WalletRef) -> LedgerResult<()> {
        self.delete(wallet, false).await
    }

    async fn delete(&self, wallet: &WalletRef, require_empty: bool) -> LedgerResult<()> {
        let target = wallet.clone();
        self.db
            .transaction(move |tx| {
                let wallets = WalletQueries::new(tx);
                let model = wallets.lock_for_update(&target)?;
                ensure_no_payments_in_flight(tx, &target)?;
                if require_empty && model.balance_msat != 0 {
                    return Err(LedgerError::NonZeroBalance);
                }
                wallets.delete(&target)
            })
            .await?;

        self.credentials.forget_wallet(wallet).await;
        info!("Deleted wallet {}", wallet);
        Ok(())
    }

    /// Change a wallet's name or lock state
    ///
    /// A locked wallet only accepts changes that include unlocking it. The
    /// default wallet cannot be renamed.
    pub async fn update_wallet_options(&self, wallet: &WalletRef, options: &WalletOptions) -> LedgerResult<()> {
        if options.balance_msat.is_some() {
            return Err(LedgerError::Validation(
                "only the admin can set a wallet balance".to_string(),
            ));
        }
        self.update(wallet, options).await
    }

    /// Change any wallet option, balance included
    pub async fn admin_update_wallet_options(&self, wallet: &WalletRef, options: &WalletOptions) -> LedgerResult<()> {
        self.update(wallet, options).await
    }

    async fn update(&self, wallet: &WalletRef, options: &WalletOptions) -> LedgerResult<()> {
        if let Some(name) = options.name.as_deref().filter(|name| !name.is_empty()) {
            if wallet.wallet_id == wallet.username {
                return Err(LedgerError::Validation(
                    "cannot edit the name of the main wallet".to_string(),
                ));
            }
            validate_wallet_name(name)?;
        }

        let target = wallet.clone();
        let options = options.clone();
        self.db
            .transaction(move |tx| {
                let wallets = WalletQueries::new(tx);
                match wallets.lock_for_update(&target) {
                    Ok(_) => {}
                    // unlocking is the one change a locked wallet accepts
                    Err(LedgerError::CannotUpdateLockedWallet) if options.locked == Some(false) => {}
                    Err(e) => return Err(e),
                }

                if let Some(name) = options.name.as_deref().filter(|name| !name.is_empty()) {
                    wallets.update_name(&target, name)?;
                }
                if let Some(locked) = options.locked {
                    wallets.set_locked(&target, locked)?;
                }
                if let Some(balance_msat) = options.balance_msat {
                    wallets.set_balance(&target, balance_msat)?;
                }
                Ok(())
            })
            .await?;

        info!("Updated options of wallet {}", wallet);
        Ok(())
    }

    /// Get a transaction the wallet took part in
    pub async fn get_transaction(&self, wallet: &WalletRef, id: &str) -> LedgerResult<TransactionModel> {
        let wallet = wallet.clone();
        let id = id.to_string();
        self.db
            .read(move |conn| TransactionQueries::new(conn).get_for_wallet(&wallet, &id))
            .await
    }

    /// List a wallet's transactions
    pub async fn list_wallet_transactions(
        &self,
        wallet: &WalletRef,
        filter: &TransactionFilter,
    ) -> LedgerResult<TransactionPage> {
        if let (Some(start), Some(end)) = (filter.start, filter.end) {
            if start >= end {
                return Err(LedgerError::Validation("invalid time range".to_string()));
            }
        }
        let wallet = wallet.clone();
        let filter = filter.clone();
        self.db
            .read(move |conn| {
                WalletQueries::new(conn).get(&wallet)?;
                TransactionQueries::new(conn).list_for_wallet(&wallet, &filter)
            })
            .await
    }

    /// Move funds between two wallets of the same user
    pub async fn transfer(
        &self,
        username: &str,
        from_id: &str,
        to_id: &str,
        amount_msat: u64,
    ) -> LedgerResult<TransactionModel> {
        let owner = username.to_string();
        let ids = [from_id.to_string(), to_id.to_string()];
        let same_user = self
            .db
            .read(move |conn| {
                let wallets = WalletQueries::new(conn);
                for id in &ids {
                    match wallets.get(&WalletRef::new(&owner, id)) {
                        Ok(_) => {}
                        Err(LedgerError::WalletNotFound) => return Ok(false),
                        Err(e) => return Err(e),
                    }
                }
                Ok(true)
            })
            .await?;
        if !same_user {
            return Err(LedgerError::Validation(
                "either wallets are not from same user or one or more wallets do not exist".to_string(),
            ));
        }

        let owner = username.to_string();
        let (from, to) = (from_id.to_string(), to_id.to_string());
        self.db
            .transaction(move |tx| WalletQueries::new(tx).transfer(&owner, &from, &to, amount_msat))
            .await
    }
}

//! LNURL-withdraw templates

use crate::{
    config::Config,
    db::{Database, WalletQueries, WalletRef, WithdrawModel, WithdrawQueries},
    keys::generate_withdraw_k1,
    LedgerError, LedgerResult,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Public view of a template, as served to a withdrawing wallet
#[derive(Debug, Clone, Serialize)]
pub struct WithdrawRequest {
    /// The template
    pub withdraw: WithdrawModel,
    /// Where the wallet submits its invoice
    pub callback: String,
}

/// Manager for withdraw templates
///
/// Paying against a template goes through
/// [`crate::payments::PaymentManager::pay_withdraw_invoice`].
pub struct WithdrawManager {
    config: Arc<Config>,
    db: Arc<Database>,
}

impl WithdrawManager {
    /// Create a new withdraw manager
    pub fn new(config: Arc<Config>, db: Arc<Database>) -> Self {
        Self { config, db }
    }

    /// Create a template on an unlocked wallet and return its request URL
    ///
    /// `max_msat` and `max_use` of 0 mean unlimited.
    pub async fn create_withdraw(
        &self,
        wallet: &WalletRef,
        description: &str,
        min_msat: u64,
        max_msat: u64,
        max_use: u64,
        expires_at: Option<DateTime<Utc>>,
    ) -> LedgerResult<String> {
        if max_msat != 0 && min_msat > max_msat {
            return Err(LedgerError::Validation(
                "minimum withdrawable cannot exceed maximum withdrawable".to_string(),
            ));
        }

        let withdraw = WithdrawModel {
            k1: generate_withdraw_k1(),
            wallet: wallet.clone(),
            description: description.to_string(),
            min_msat,
            max_msat,
            max_use,
            uses: 0,
            expires_at,
            created_at: Utc::now(),
        };
        let k1 = withdraw.k1.clone();
        self.db
            .transaction(move |tx| {
                if WalletQueries::new(tx).get(&withdraw.wallet)?.locked {
                    return Err(LedgerError::WalletLocked);
                }
                WithdrawQueries::new(tx).create(&withdraw)
            })
            .await?;

        info!("Created withdraw template for {}", wallet);
        Ok(self.request_link(&k1))
    }

    /// A template owned by the wallet, expired or not
    pub async fn get_withdraw(&self, wallet: &WalletRef, k1: &str) -> LedgerResult<WithdrawRequest> {
        let owner = wallet.clone();
        let key = k1.to_string();
        let withdraw = self
            .db
            .read(move |conn| WithdrawQueries::new(conn).get_for_wallet(&owner, &key))
            .await?;
        Ok(self.with_callback(withdraw))
    }

    /// Look up an unexpired template by k1 alone
    pub async fn get_withdraw_request(&self, k1: &str) -> LedgerResult<WithdrawRequest> {
        let key = k1.to_string();
        let withdraw = self
            .db
            .read(move |conn| WithdrawQueries::new(conn).get(&key))
            .await?;
        Ok(self.with_callback(withdraw))
    }

    fn with_callback(&self, withdraw: WithdrawModel) -> WithdrawRequest {
        WithdrawRequest {
            withdraw,
            callback: format!("https://{}/lnurl/withdraw/pay", self.config.lnurl.hostname),
        }
    }

    fn request_link(&self, k1: &str) -> String {
        format!(
            "https://{}/lnurl/withdraw/request?k1={}",
            self.config.lnurl.hostname, k1
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::UserQueries;

    async fn setup() -> (Arc<Database>, WithdrawManager) {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        db.transaction(|tx| {
            UserQueries::new(tx).create("alice", "user-key")?;
            WalletQueries::new(tx).create("alice", "alice", "alice", "wallet-key")?;
            Ok(())
        })
        .await
        .unwrap();
        let mut config = Config::default();
        config.lnurl.hostname = "ledger.example.com".to_string();
        (db.clone(), WithdrawManager::new(Arc::new(config), db))
    }

    fn k1_of(url: &str) -> String {
        let (base, k1) = url.split_once("?k1=").unwrap();
        assert_eq!(base, "https://ledger.example.com/lnurl/withdraw/request");
        k1.to_string()
    }

    #[tokio::test]
    async fn test_create_and_fetch_withdraw() {
        let (_db, withdraws) = setup().await;
        let wallet = WalletRef::new("alice", "alice");

        let lnurl = withdraws
            .create_withdraw(&wallet, "coffee", 1_000, 5_000, 2, None)
            .await
            .unwrap();
        let k1 = k1_of(&lnurl);

        let owned = withdraws.get_withdraw(&wallet, &k1).await.unwrap();
        assert_eq!(owned.withdraw.k1, k1);
        assert_eq!(owned.callback, "https://ledger.example.com/lnurl/withdraw/pay");
        assert!(matches!(
            withdraws.get_withdraw(&WalletRef::new("alice", "other"), &k1).await,
            Err(LedgerError::WithdrawNotFound)
        ));

        let request = withdraws.get_withdraw_request(&k1).await.unwrap();
        assert_eq!(request.callback, "https://ledger.example.com/lnurl/withdraw/pay");
        assert_eq!(request.withdraw.description, "coffee");
        assert_eq!(request.withdraw.max_use, 2);
        assert_eq!(request.withdraw.uses, 0);
    }

    #[tokio::test]
    async fn test_withdraw_rules() {
        let (db, withdraws) = setup().await;
        let wallet = WalletRef::new("alice", "alice");

        assert!(matches!(
            withdraws.create_withdraw(&wallet, "", 10, 5, 1, None).await,
            Err(LedgerError::Validation(_))
        ));
        // unbounded maximum
        assert!(withdraws.create_withdraw(&wallet, "", 10, 0, 0, None).await.is_ok());

        let expired = withdraws
            .create_withdraw(&wallet, "", 0, 0, 0, Some(Utc::now() - chrono::Duration::minutes(1)))
            .await
            .unwrap();
        assert!(matches!(
            withdraws.get_withdraw_request(&k1_of(&expired)).await,
            Err(LedgerError::WithdrawNotFound)
        ));
        // the owner still sees it
        assert!(withdraws.get_withdraw(&wallet, &k1_of(&expired)).await.is_ok());

        let target = wallet.clone();
        db.transaction(move |tx| {
            WalletQueries::new(tx).set_locked(&target, true)?;
            Ok(())
        })
        .await
        .unwrap();
        assert!(matches!(
            withdraws.create_withdraw(&wallet, "", 0, 0, 0, None).await,
            Err(LedgerError::WalletLocked)
        ));
        assert!(matches!(
            withdraws
                .create_withdraw(&WalletRef::new("alice", "missing"), "", 0, 0, 0, None)
                .await,
            Err(LedgerError::WalletNotFound)
        ));
    }
}

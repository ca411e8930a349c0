//! Credential resolution
//!
//! Every request carries exactly one of the admin, user or wallet API keys,
//! plus the username it acts for. Privileges nest: the admin key can act for
//! any existing user, a user key for any wallet of that user, and a wallet
//! key only for its own wallet.

use crate::{
    config::Config,
    db::{Database, UserQueries, WalletQueries, WalletRef},
    LedgerError, LedgerResult,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod credentials;
mod headers;

pub use credentials::CredentialStore;
pub use headers::{
    KeyType, RequestCredentials, ADMIN_API_KEY_HEADER, USERNAME_HEADER, USER_API_KEY_HEADER, WALLET_API_KEY_HEADER,
};

/// What an API key grants
///
/// All fields empty means the key is not recognised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// The admin key
    pub admin: bool,
    /// Owning user of a user or wallet key
    pub username: Option<String>,
    /// Wallet of a wallet key
    pub wallet_id: Option<String>,
}

/// Authentication service
pub struct AuthService {
    admin_api_key: String,
    db: Arc<Database>,
    credentials: Arc<CredentialStore>,
    cancel: CancellationToken,
}

impl AuthService {
    /// Create a new authentication service
    pub fn new(config: &Config, db: Arc<Database>) -> Self {
        Self {
            admin_api_key: config.ledger.admin_api_key.clone(),
            credentials: Arc::new(CredentialStore::new(&config.auth, db.clone())),
            db,
            cancel: CancellationToken::new(),
        }
    }

    /// Credential store shared with the user and wallet managers
    pub fn credentials(&self) -> Arc<CredentialStore> {
        self.credentials.clone()
    }

    /// Start purging expired cache entries
    pub fn start_janitor(&self) {
        self.credentials.spawn_janitors(&self.cancel);
    }

    /// Stop the cache janitors
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Require the admin key
    pub fn validate_admin_credentials(&self, credentials: &RequestCredentials) -> LedgerResult<()> {
        match credentials.api_key()? {
            (KeyType::Admin, key) if key == self.admin_api_key => Ok(()),
            (KeyType::Admin, _) => {
                warn!("Failed to authenticate admin: unrecognized api key was used");
                Err(LedgerError::Unauthenticated)
            }
            _ => Err(LedgerError::InvalidHeaderFormat),
        }
    }

    /// Require admin or user credentials for the named user
    ///
    /// Returns the username the request acts for.
    pub async fn validate_user_credentials(&self, credentials: &RequestCredentials) -> LedgerResult<String> {
        let username = credentials.username()?;
        let (kind, key) = credentials.api_key()?;

        match kind {
            KeyType::Admin => self.admin_for_user(key, username).await?,
            KeyType::User => {
                if !self.credentials.user_key_matches(username, key).await? {
                    warn!("Failed to authenticate user {}", username);
                    return Err(LedgerError::Unauthenticated);
                }
            }
            KeyType::Wallet => {
                warn!("Wallet key presented for user-scoped call by {}", username);
                return Err(LedgerError::Unauthenticated);
            }
        }
        Ok(username.to_string())
    }

    /// Require admin, owning user or wallet credentials for a wallet
    ///
    /// Returns the username the request acts for.
    pub async fn validate_wallet_credentials(
        &self,
        credentials: &RequestCredentials,
        wallet_id: &str,
    ) -> LedgerResult<String> {
        let (kind, key) = credentials.api_key()?;
        let username = credentials.username()?;
        let wallet = WalletRef::new(username, wallet_id);

        let authenticated = match kind {
            KeyType::Admin => {
                self.admin_for_user(key, username).await?;
                true
            }
            KeyType::User => {
                self.credentials.user_key_matches(username, key).await?
                    && self.credentials.user_owns_wallet(&wallet, key).await?
            }
            KeyType::Wallet => self.credentials.wallet_key_matches(&wallet, key).await?,
        };

        if !authenticated {
            warn!("Failed to authenticate wallet {}", wallet);
            return Err(LedgerError::Unauthenticated);
        }
        Ok(username.to_string())
    }

    /// The admin key acting for an existing user
    async fn admin_for_user(&self, key: &str, username: &str) -> LedgerResult<()> {
        if key != self.admin_api_key {
            warn!("Failed to authenticate admin for {}: unrecognized api key was used", username);
            return Err(LedgerError::Unauthenticated);
        }
        if !self.credentials.user_exists(username).await? {
            warn!("Admin call was attempted, but user {} not found", username);
            return Err(LedgerError::Unauthenticated);
        }
        info!("Admin successfully authorized for {}", username);
        Ok(())
    }

    /// Classify an API key
    ///
    /// Checked as admin key, then user key, then wallet key. A key that
    /// matches nothing yields an empty [`Identity`].
    pub async fn get_identity_of_api_key(&self, api_key: &str) -> LedgerResult<Identity> {
        if api_key == self.admin_api_key {
            info!("Admin requested information on its api key privileges");
            return Ok(Identity {
                admin: true,
                ..Default::default()
            });
        }

        let key = api_key.to_string();
        self.db
            .read(move |conn| {
                match UserQueries::new(conn).get_by_api_key(&key) {
                    Ok(user) => {
                        return Ok(Identity {
                            username: Some(user.username),
                            ..Default::default()
                        })
                    }
                    Err(LedgerError::UserNotFound) => {}
                    Err(e) => return Err(e),
                }
                match WalletQueries::new(conn).get_by_api_key(&key) {
                    Ok(wallet) => Ok(Identity {
                        admin: false,
                        username: Some(wallet.username),
                        wallet_id: Some(wallet.id),
                    }),
                    Err(LedgerError::WalletNotFound) => Ok(Identity::default()),
                    Err(e) => Err(e),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> AuthService {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        db.transaction(|tx| {
            UserQueries::new(tx).create("alice", "alice-key")?;
            UserQueries::new(tx).create("bob", "bob-key")?;
            let wallets = WalletQueries::new(tx);
            wallets.create("alice", "alice", "alice", "alice-wallet-key")?;
            wallets.create("alice", "savings", "savings", "savings-key")?;
            wallets.create("bob", "bob", "bob", "bob-wallet-key")?;
            Ok(())
        })
        .await
        .unwrap();

        let mut config = Config::default();
        config.ledger.admin_api_key = "admin-key".to_string();
        AuthService::new(&config, db)
    }

    #[tokio::test]
    async fn test_admin_credentials() {
        let auth = setup().await;
        assert!(auth
            .validate_admin_credentials(&RequestCredentials::admin("admin-key", None))
            .is_ok());
        assert!(matches!(
            auth.validate_admin_credentials(&RequestCredentials::admin("wrong", None)),
            Err(LedgerError::Unauthenticated)
        ));
        assert!(matches!(
            auth.validate_admin_credentials(&RequestCredentials::user("alice-key", "alice")),
            Err(LedgerError::InvalidHeaderFormat)
        ));
    }

    #[tokio::test]
    async fn test_user_credentials() {
        let auth = setup().await;

        let username = auth
            .validate_user_credentials(&RequestCredentials::user("alice-key", "alice"))
            .await
            .unwrap();
        assert_eq!(username, "alice");

        let username = auth
            .validate_user_credentials(&RequestCredentials::admin("admin-key", Some("bob")))
            .await
            .unwrap();
        assert_eq!(username, "bob");

        for credentials in [
            RequestCredentials::user("bob-key", "alice"),
            RequestCredentials::admin("admin-key", Some("carol")),
            RequestCredentials::wallet("alice-wallet-key", "alice"),
        ] {
            assert!(matches!(
                auth.validate_user_credentials(&credentials).await,
                Err(LedgerError::Unauthenticated)
            ));
        }

        assert!(matches!(
            auth.validate_user_credentials(&RequestCredentials::admin("admin-key", None))
                .await,
            Err(LedgerError::MissingUsername)
        ));
    }

    #[tokio::test]
    async fn test_wallet_credentials_layering() {
        let auth = setup().await;

        // own wallet key
        assert!(auth
            .validate_wallet_credentials(&RequestCredentials::wallet("savings-key", "alice"), "savings")
            .await
            .is_ok());
        // owning user's key
        assert!(auth
            .validate_wallet_credentials(&RequestCredentials::user("alice-key", "alice"), "savings")
            .await
            .is_ok());
        // admin for an existing user
        assert!(auth
            .validate_wallet_credentials(&RequestCredentials::admin("admin-key", Some("alice")), "savings")
            .await
            .is_ok());

        let rejected = [
            (RequestCredentials::wallet("alice-wallet-key", "alice"), "savings"),
            (RequestCredentials::admin("admin-key", Some("nobody")), "savings"),
            (RequestCredentials::user("bob-key", "bob"), "savings"),
            (RequestCredentials::user("alice-key", "alice"), "missing"),
            (RequestCredentials::wallet("bob-wallet-key", "alice"), "bob"),
        ];
        for (credentials, wallet_id) in rejected {
            assert!(matches!(
                auth.validate_wallet_credentials(&credentials, wallet_id).await,
                Err(LedgerError::Unauthenticated)
            ));
        }
    }

    #[tokio::test]
    async fn test_identity_of_api_key() {
        let auth = setup().await;

        assert!(auth.get_identity_of_api_key("admin-key").await.unwrap().admin);

        let identity = auth.get_identity_of_api_key("alice-key").await.unwrap();
        assert_eq!(identity.username.as_deref(), Some("alice"));
        assert_eq!(identity.wallet_id, None);

        let identity = auth.get_identity_of_api_key("savings-key").await.unwrap();
        assert_eq!(identity.username.as_deref(), Some("alice"));
        assert_eq!(identity.wallet_id.as_deref(), Some("savings"));

        assert_eq!(auth.get_identity_of_api_key("junk").await.unwrap(), Identity::default());
    }
}

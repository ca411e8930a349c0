//! LNURL-auth challenges
//!
//! A link challenge binds the signing key to a user or wallet; a login
//! challenge then proves possession of that key. Once a challenge is authed,
//! the API key of its subject can be collected with the same k1 until the
//! challenge expires.

use crate::{
    config::Config,
    db::{AuthModel, AuthQueries, AuthSubject, Database, UserQueries, WalletQueries, WalletRef},
    keys::generate_auth_k1,
    LedgerError, LedgerResult,
};
use chrono::{Duration, Utc};
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// What a challenge does once signed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LnurlAction {
    /// Prove possession of the linked key
    Login,
    /// Bind the signing key
    Link,
}

impl fmt::Display for LnurlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login => write!(f, "login"),
            Self::Link => write!(f, "link"),
        }
    }
}

/// Manager for LNURL-auth challenges
pub struct LnurlAuthManager {
    config: Arc<Config>,
    db: Arc<Database>,
}

impl LnurlAuthManager {
    /// Create a new auth manager
    pub fn new(config: Arc<Config>, db: Arc<Database>) -> Self {
        Self { config, db }
    }

    /// Login challenge for a user
    pub async fn user_auth(&self, username: &str) -> LedgerResult<String> {
        self.create(AuthSubject::User(username.to_string()), LnurlAction::Login, None)
            .await
    }

    /// Login challenge for a wallet
    pub async fn wallet_auth(&self, wallet: &WalletRef) -> LedgerResult<String> {
        self.create(AuthSubject::Wallet(wallet.clone()), LnurlAction::Login, None)
            .await
    }

    /// Challenge binding a key to a user
    pub async fn user_link_auth(&self, username: &str, label: &str) -> LedgerResult<String> {
        self.create(AuthSubject::User(username.to_string()), LnurlAction::Link, Some(label))
            .await
    }

    /// Challenge binding a key to a wallet
    pub async fn wallet_link_auth(&self, wallet: &WalletRef, label: &str) -> LedgerResult<String> {
        self.create(AuthSubject::Wallet(wallet.clone()), LnurlAction::Link, Some(label))
            .await
    }

    async fn create(&self, subject: AuthSubject, action: LnurlAction, label: Option<&str>) -> LedgerResult<String> {
        if let AuthSubject::User(username) = &subject {
            if username.is_empty() {
                return Err(LedgerError::Validation("username must be specified".to_string()));
            }
        }

        let now = Utc::now();
        let auth = AuthModel {
            k1: generate_auth_k1(),
            subject,
            link: action == LnurlAction::Link,
            link_label: label.filter(|l| !l.is_empty()).map(str::to_string),
            authed: false,
            expires_at: now + Duration::minutes(self.config.lnurl.auth_expiry_minutes),
            created_at: now,
        };
        let k1 = auth.k1.clone();
        self.db
            .transaction(move |tx| {
                match &auth.subject {
                    AuthSubject::User(username) => {
                        UserQueries::new(tx).get(username)?;
                    }
                    AuthSubject::Wallet(wallet) => {
                        WalletQueries::new(tx).get(wallet)?;
                    }
                }
                AuthQueries::new(tx).create(&auth)
            })
            .await?;

        Ok(format!(
            "https://{}/lnurl/auth?tag=login&k1={}&action={}",
            self.config.lnurl.hostname, k1, action
        ))
    }

    /// Check a wallet's signature over k1 and complete the challenge
    ///
    /// `sig` is a hex DER signature and `key` a hex compressed public key.
    pub async fn authenticate(&self, k1: &str, sig: &str, key: &str) -> LedgerResult<()> {
        verify_signature(k1, sig, key)?;

        let k1 = k1.to_string();
        let key = key.to_lowercase();
        self.db
            .transaction(move |tx| {
                let auth = AuthQueries::new(tx).get(&k1)?;
                if auth.link {
                    match &auth.subject {
                        AuthSubject::User(username) => UserQueries::new(tx).update_link_key(username, &key)?,
                        AuthSubject::Wallet(wallet) => {
                            WalletQueries::new(tx).update_link(wallet, &key, auth.link_label.as_deref())?
                        }
                    }
                    info!("Linked key to {:?}", auth.subject);
                } else {
                    let linked = match &auth.subject {
                        AuthSubject::User(username) => UserQueries::new(tx).get(username)?.link_key,
                        AuthSubject::Wallet(wallet) => WalletQueries::new(tx).get(wallet)?.link_key,
                    };
                    if linked.as_deref() != Some(key.as_str()) {
                        warn!("LNURL login with a key not linked to {:?}", auth.subject);
                        return Err(LedgerError::Unauthenticated);
                    }
                }
                AuthQueries::new(tx).set_authed(&k1)
            })
            .await
    }

    /// API key of the challenge's subject, once the challenge is authed
    pub async fn get_auth_key(&self, k1: &str) -> LedgerResult<String> {
        let k1 = k1.to_string();
        self.db
            .read(move |conn| {
                let auth = AuthQueries::new(conn).get(&k1)?;
                if !auth.authed {
                    return Err(LedgerError::Unauthenticated);
                }
                match &auth.subject {
                    AuthSubject::User(username) => Ok(UserQueries::new(conn).get(username)?.api_key),
                    AuthSubject::Wallet(wallet) => Ok(WalletQueries::new(conn).get(wallet)?.api_key),
                }
            })
            .await
    }
}

/// Verify a DER ECDSA signature over the 32-byte k1
fn verify_signature(k1: &str, sig: &str, key: &str) -> LedgerResult<()> {
    let invalid = |what: &str| LedgerError::Validation(format!("invalid {}", what));

    let digest = hex::decode(k1).map_err(|_| invalid("k1"))?;
    let message = Message::from_digest_slice(&digest).map_err(|_| invalid("k1"))?;
    let der = hex::decode(sig).map_err(|_| invalid("signature"))?;
    let mut signature = Signature::from_der(&der).map_err(|_| invalid("signature"))?;
    signature.normalize_s();
    let key = hex::decode(key).map_err(|_| invalid("key"))?;
    let key = PublicKey::from_slice(&key).map_err(|_| invalid("key"))?;

    Secp256k1::verification_only()
        .verify_ecdsa(&message, &signature, &key)
        .map_err(|_| LedgerError::Validation("invalid signature for key".to_string()))
}

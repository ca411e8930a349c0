//! Credential headers

use crate::{LedgerError, LedgerResult};

/// Header carrying the username a request acts for
pub const USERNAME_HEADER: &str = "x-username";
/// Header carrying the admin API key
pub const ADMIN_API_KEY_HEADER: &str = "x-admin-api-key";
/// Header carrying a user API key
pub const USER_API_KEY_HEADER: &str = "x-user-api-key";
/// Header carrying a wallet API key
pub const WALLET_API_KEY_HEADER: &str = "x-wallet-api-key";

/// Which kind of API key a request presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// The admin key
    Admin,
    /// A user key
    User,
    /// A wallet key
    Wallet,
}

/// Credentials supplied with a request
///
/// Empty header values count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCredentials {
    /// `x-admin-api-key`
    pub admin_api_key: Option<String>,
    /// `x-user-api-key`
    pub user_api_key: Option<String>,
    /// `x-wallet-api-key`
    pub wallet_api_key: Option<String>,
    /// `x-username`
    pub username: Option<String>,
}

impl RequestCredentials {
    /// Collect credentials from request headers
    ///
    /// Header names are matched case-insensitively; the first value of a
    /// repeated header wins.
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut credentials = Self::default();
        for (name, value) in headers {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let slot = match name.to_ascii_lowercase().as_str() {
                ADMIN_API_KEY_HEADER => &mut credentials.admin_api_key,
                USER_API_KEY_HEADER => &mut credentials.user_api_key,
                WALLET_API_KEY_HEADER => &mut credentials.wallet_api_key,
                USERNAME_HEADER => &mut credentials.username,
                _ => continue,
            };
            slot.get_or_insert_with(|| value.to_string());
        }
        credentials
    }

    /// Credentials carrying only the admin key
    pub fn admin(api_key: impl Into<String>, username: Option<&str>) -> Self {
        Self {
            admin_api_key: Some(api_key.into()),
            username: username.map(str::to_string),
            ..Default::default()
        }
    }

    /// Credentials carrying only a user key
    pub fn user(api_key: impl Into<String>, username: &str) -> Self {
        Self {
            user_api_key: Some(api_key.into()),
            username: Some(username.to_string()),
            ..Default::default()
        }
    }

    /// Credentials carrying only a wallet key
    pub fn wallet(api_key: impl Into<String>, username: &str) -> Self {
        Self {
            wallet_api_key: Some(api_key.into()),
            username: Some(username.to_string()),
            ..Default::default()
        }
    }

    /// The single API key presented, with its kind
    ///
    /// Fails `InvalidHeaderFormat` unless exactly one key header is set.
    pub fn api_key(&self) -> LedgerResult<(KeyType, &str)> {
        let keys = [
            (KeyType::Admin, self.admin_api_key.as_deref()),
            (KeyType::User, self.user_api_key.as_deref()),
            (KeyType::Wallet, self.wallet_api_key.as_deref()),
        ];
        let mut present = keys
            .into_iter()
            .filter_map(|(kind, key)| key.map(|key| (kind, key)));

        match (present.next(), present.next()) {
            (Some(key), None) => Ok(key),
            _ => Err(LedgerError::InvalidHeaderFormat),
        }
    }

    /// The username header
    pub fn username(&self) -> LedgerResult<&str> {
        self.username.as_deref().ok_or(LedgerError::MissingUsername)
    }
}

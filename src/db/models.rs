//! Database models

use crate::{LedgerError, LedgerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a wallet: the owning username plus the wallet id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletRef {
    /// Owning user
    pub username: String,
    /// Wallet id, unique per user
    pub wallet_id: String,
}

impl WalletRef {
    /// Build a wallet reference
    pub fn new(username: impl Into<String>, wallet_id: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            wallet_id: wallet_id.into(),
        }
    }

    /// Build a reference from two nullable columns
    pub(crate) fn from_columns(username: Option<String>, wallet_id: Option<String>) -> Option<Self> {
        Some(Self::new(username?, wallet_id?))
    }
}

impl fmt::Display for WalletRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.username, self.wallet_id)
    }
}

/// User database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserModel {
    /// Unique username
    pub username: String,
    /// User API key (only returned to the caller on creation)
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Linked LNURL-auth public key
    pub link_key: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Tombstone
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Wallet database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletModel {
    /// Owning user
    pub username: String,
    /// Wallet id
    pub id: String,
    /// Display name
    pub name: String,
    /// Wallet API key (only returned to the caller on creation)
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Balance in millisatoshis
    pub balance_msat: u64,
    /// Locked wallets refuse balance movements
    pub locked: bool,
    /// Linked LNURL-auth public key
    pub link_key: Option<String>,
    /// Label of the linked key
    pub link_label: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl WalletModel {
    /// Reference to this wallet
    pub fn wallet_ref(&self) -> WalletRef {
        WalletRef::new(&self.username, &self.id)
    }

    /// Whether this is the wallet created together with its user
    pub fn is_default(&self) -> bool {
        self.id == self.username
    }
}

/// Ledger transaction database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionModel {
    /// Transaction ID
    pub id: String,
    /// Debited wallet (absent for receipts)
    pub from: Option<WalletRef>,
    /// Credited wallet (absent for external payments)
    pub to: Option<WalletRef>,
    /// Amount in millisatoshis
    pub amount_msat: u64,
    /// Routing fees paid in millisatoshis
    pub fees_paid_msat: u64,
    /// Payment hash of the related invoice
    pub invoice_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Invoice database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceModel {
    /// Payment hash (hex)
    pub payment_hash: String,
    /// BOLT11 payment request
    pub payment_request: String,
    /// Description
    pub memo: String,
    /// Amount in millisatoshis
    pub amount_msat: u64,
    /// Destination node public key
    pub pubkey: String,
    /// Paying wallet, when paid from this ledger
    pub sender: Option<WalletRef>,
    /// Receiving wallet, when issued by this ledger
    pub recipient: Option<WalletRef>,
    /// Settlement time
    pub settled_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl InvoiceModel {
    /// Whether the invoice has settled
    pub fn is_settled(&self) -> bool {
        self.settled_at.is_some()
    }
}

/// Invoice awaiting settlement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInvoiceModel {
    /// Payment hash (hex)
    pub payment_hash: String,
    /// Receiving wallet
    pub wallet: WalletRef,
    /// Invoice amount in millisatoshis
    pub amount_msat: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Outbound payment awaiting its terminal status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPaymentModel {
    /// Payment hash (hex)
    pub payment_hash: String,
    /// Paying wallet
    pub wallet: WalletRef,
    /// Reserved amount in millisatoshis
    pub amount_msat: u64,
    /// Withdraw template this payment draws on
    pub withdraw_k1: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// LNURL-withdraw template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawModel {
    /// Random token
    pub k1: String,
    /// Wallet paying the withdrawals
    pub wallet: WalletRef,
    /// Default invoice description
    pub description: String,
    /// Smallest withdrawable amount in millisatoshis
    pub min_msat: u64,
    /// Largest withdrawable amount in millisatoshis (0 = unlimited)
    pub max_msat: u64,
    /// Allowed number of withdrawals (0 = unlimited)
    pub max_use: u64,
    /// Completed withdrawals
    pub uses: u64,
    /// Expiry, if any
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Owner of an LNURL-auth challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthSubject {
    /// A user
    User(String),
    /// A single wallet
    Wallet(WalletRef),
}

/// LNURL-auth challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthModel {
    /// Random token (hex)
    pub k1: String,
    /// User or wallet this challenge belongs to
    pub subject: AuthSubject,
    /// Link challenges bind a key; login challenges require one
    pub link: bool,
    /// Label for the key being linked
    pub link_label: Option<String>,
    /// Set once a valid signature was presented
    pub authed: bool,
    /// Expiry
    pub expires_at: DateTime<Utc>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Wallet option changes; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletOptions {
    /// New display name
    pub name: Option<String>,
    /// New lock state
    pub locked: Option<bool>,
    /// Balance override (admin only)
    pub balance_msat: Option<u64>,
}

/// Transaction listing parameters
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    /// Inclusive lower bound on creation time
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound on creation time
    pub end: Option<DateTime<Utc>>,
    /// Rows to skip
    pub offset: u64,
    /// Page size (0 = no limit)
    pub limit: u64,
    /// Newest first
    pub descending: bool,
}

/// A page of transactions
#[derive(Debug, Clone, Serialize)]
pub struct TransactionPage {
    /// Rows in this page
    pub transactions: Vec<TransactionModel>,
    /// Offset of the next page, or -1 when this page is the last
    pub next_offset: i64,
    /// Rows matching the filter in total
    pub total: u64,
}

/// Unsigned amount or counter as stored in SQLite
///
/// SQLite integers are signed, so values above `i64::MAX` are rejected.
pub(crate) fn sql_u64(value: u64) -> LedgerResult<i64> {
    i64::try_from(value).map_err(|_| LedgerError::Validation(format!("value {} is out of range", value)))
}

/// Unsigned amount or counter read back from SQLite
pub(crate) fn u64_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(e)))
}

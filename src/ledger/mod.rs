//! User and wallet lifecycle
//!
//! Direct store operations on users and wallets: creation, deletion, wallet
//! options, internal transfers and transaction history. Deleting a user or
//! wallet also invalidates its cached credentials.

mod users;
mod wallets;

pub use users::{CreatedUser, UserManager};
pub use wallets::WalletManager;

use crate::db::{PendingPaymentQueries, WalletRef};
use crate::{LedgerError, LedgerResult};
use rusqlite::Connection;

/// Refuse to remove a wallet that still has payments in flight
fn ensure_no_payments_in_flight(conn: &Connection, wallet: &WalletRef) -> LedgerResult<()> {
    if PendingPaymentQueries::new(conn).list_for_wallet(wallet)?.is_empty() {
        Ok(())
    } else {
        Err(LedgerError::PaymentInFlight)
    }
}

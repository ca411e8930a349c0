//! Database queries
//!
//! Each query struct borrows a connection. Inside [`super::Database::transaction`]
//! that connection is the open transaction, so several query structs can be
//! composed into one atomic unit.

mod auths;
mod invoices;
mod pending;
mod transactions;
mod users;
mod wallets;
mod withdraws;

pub use auths::AuthQueries;
pub use invoices::InvoiceQueries;
pub use pending::{PendingInvoiceQueries, PendingPaymentQueries};
pub use transactions::TransactionQueries;
pub use users::UserQueries;
pub use wallets::WalletQueries;
pub use withdraws::WithdrawQueries;

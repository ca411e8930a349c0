//! LNURL withdraw templates and auth challenges
//!
//! Links handed to wallets are plain https URLs on the configured
//! `lnurl.hostname`.

mod auth;
mod withdraw;

pub use auth::{LnurlAction, LnurlAuthManager};
pub use withdraw::{WithdrawManager, WithdrawRequest};

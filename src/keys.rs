//! Random key material for API keys and LNURL tokens

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

const KEY_BYTES: usize = 32;

fn random_bytes() -> [u8; KEY_BYTES] {
    let mut bytes = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// New user or wallet API key
pub fn generate_api_key() -> String {
    STANDARD.encode(random_bytes())
}

/// New LNURL-withdraw k1, safe to embed in a URL
pub fn generate_withdraw_k1() -> String {
    URL_SAFE.encode(random_bytes())
}

/// New LNURL-auth k1 (hex, signed by the wallet as a 32-byte digest)
pub fn generate_auth_k1() -> String {
    hex::encode(random_bytes())
}

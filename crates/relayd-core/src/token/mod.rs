//! Worker credentials for the local control surface.
//!
//! Every launched worker receives a token scoped to its worker name. The
//! dispatcher only accepts registration, polling and result submission for
//! a worker name when the request carries that worker's token.
//!
//! Tokens are HMAC-SHA256 based. Format: `relayd_wt_<hmac_hex>_<worker>`,
//! where the MAC is computed over `worker:<worker>`.

pub mod guard;

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Token prefix used to identify worker tokens.
const TOKEN_PREFIX: &str = "relayd_wt_";

/// Hex length of an HMAC-SHA256 digest.
const MAC_HEX_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("token HMAC verification failed")]
    HmacMismatch,
}

/// Secret used to mint and check worker tokens.
#[derive(Clone)]
pub struct TokenConfig {
    secret: Vec<u8>,
}

impl TokenConfig {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// A fresh random 32-byte secret. The daemon creates one per run, so
    /// tokens never outlive the process that issued them.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes);
        Self::new(bytes.to_vec())
    }
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Mint the token for `worker`.
pub fn generate_token(config: &TokenConfig, worker: &str) -> String {
    let mac = compute_hmac(&config.secret, worker);
    format!("{TOKEN_PREFIX}{}_{worker}", hex::encode(mac))
}

/// Validate a token and return the worker name it was minted for.
pub fn validate_token(config: &TokenConfig, token: &str) -> Result<String, TokenError> {
    let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
        TokenError::InvalidFormat(format!("token must start with '{TOKEN_PREFIX}'"))
    })?;

    if rest.len() < MAC_HEX_LEN + 2 || !rest.is_char_boundary(MAC_HEX_LEN) {
        return Err(TokenError::InvalidFormat(
            "token too short to contain a MAC and worker name".to_string(),
        ));
    }
    let (mac_hex, after_mac) = rest.split_at(MAC_HEX_LEN);
    let worker = after_mac.strip_prefix('_').ok_or_else(|| {
        TokenError::InvalidFormat("expected underscore after MAC".to_string())
    })?;

    let provided = hex::decode(mac_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("invalid hex in MAC: {e}")))?;

    let mut mac = new_mac(&config.secret);
    mac.update(message_for(worker).as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| TokenError::HmacMismatch)?;

    Ok(worker.to_string())
}

fn message_for(worker: &str) -> String {
    format!("worker:{worker}")
}

fn new_mac(key: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length, so this cannot fail.
    match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC can take key of any size"),
    }
}

fn compute_hmac(key: &[u8], worker: &str) -> Vec<u8> {
    let mut mac = new_mac(key);
    mac.update(message_for(worker).as_bytes());
    mac.finalize().into_bytes().to_vec()
}

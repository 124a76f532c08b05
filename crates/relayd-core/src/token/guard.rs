//! Request guard for worker routes on the control surface.
//!
//! A request for `/workers/{name}/...` is accepted only when its
//! `Authorization: Bearer <token>` header carries a valid token minted for
//! `name`.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

use super::{TokenConfig, TokenError, validate_token};

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("missing bearer token")]
    MissingCredentials,

    #[error("invalid worker token: {0}")]
    InvalidToken(#[from] TokenError),

    #[error("token was issued to worker {actual:?}, not {expected:?}")]
    WrongWorker { expected: String, actual: String },
}

/// Extract the bearer token from request headers.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Require that the request is authenticated as `worker`.
pub fn require_worker(
    config: &TokenConfig,
    headers: &HeaderMap,
    worker: &str,
) -> Result<(), GuardError> {
    let token = bearer_token(headers).ok_or(GuardError::MissingCredentials)?;
    let actual = validate_token(config, token)?;
    if actual != worker {
        return Err(GuardError::WrongWorker {
            expected: worker.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::generate_token;
    use axum::http::HeaderValue;

    fn test_config() -> TokenConfig {
        TokenConfig::new(b"guard-test-secret".to_vec())
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn accepts_matching_worker() {
        let config = test_config();
        let token = generate_token(&config, "echo");
        let headers = headers_with(&format!("Bearer {token}"));
        assert!(require_worker(&config, &headers, "echo").is_ok());
    }

    #[test]
    fn rejects_missing_header() {
        let result = require_worker(&test_config(), &HeaderMap::new(), "echo");
        assert!(matches!(result, Err(GuardError::MissingCredentials)));
    }

    #[test]
    fn rejects_non_bearer_scheme() {
        let config = test_config();
        let token = generate_token(&config, "echo");
        let headers = headers_with(&format!("Basic {token}"));
        assert!(matches!(
            require_worker(&config, &headers, "echo"),
            Err(GuardError::MissingCredentials)
        ));
    }

    #[test]
    fn rejects_token_for_other_worker() {
        let config = test_config();
        let token = generate_token(&config, "shell");
        let headers = headers_with(&format!("Bearer {token}"));
        let err = require_worker(&config, &headers, "echo").unwrap_err();
        assert!(matches!(err, GuardError::WrongWorker { .. }));
        assert_eq!(
            err.to_string(),
            "token was issued to worker \"shell\", not \"echo\""
        );
    }

    #[test]
    fn rejects_forged_token() {
        let headers = headers_with("Bearer relayd_wt_bogus");
        assert!(matches!(
            require_worker(&test_config(), &headers, "echo"),
            Err(GuardError::InvalidToken(_))
        ));
    }
}

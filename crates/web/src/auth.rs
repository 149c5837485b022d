//! Request authentication
//!
//! Validates the bearer (or cookie) access token and extracts the user id.
//! Token issuance, credential storage and CAPTCHA live in an external
//! service; only signature and expiry are checked here.

use crate::routes::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use vmshare_common::Error;

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Map the configured algorithm name; unknown names fail closed.
fn algorithm(name: &str) -> Result<Algorithm, Error> {
    match name {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(Error::InvalidConfig(format!(
            "unsupported token algorithm: {other}"
        ))),
    }
}

/// Pull the token from `Authorization: Bearer …` or the `access_token`
/// cookie, in that order.
fn token_from_parts(parts: &Parts) -> Option<String> {
    if let Some(value) = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    let cookies = parts.headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "access_token").then(|| value.to_string())
    })
}

/// Validate a token against the shared secret and return the user id.
pub fn verify_token(token: &str, secret: &str, algorithm_name: &str) -> Result<String, Error> {
    let algorithm = algorithm(algorithm_name)?;
    let mut validation = Validation::new(algorithm);
    validation.validate_exp = true;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| Error::NotAuthenticated(format!("invalid token: {e}")))?;
    Ok(data.claims.sub)
}

#[async_trait]
impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = crate::routes::ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts).ok_or_else(|| {
            crate::routes::ApiError::from(Error::NotAuthenticated(
                "missing access token".to_string(),
            ))
        })?;

        let auth = &state.coordinator.config().auth;
        let user_id = verify_token(&token, &auth.secret_key, &auth.token_algorithm)
            .map_err(crate::routes::ApiError::from)?;
        Ok(AuthedUser { user_id })
    }
}

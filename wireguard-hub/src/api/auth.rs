//! C10: the auth gate in front of the control API. A single admin account
//! (bcrypt password hash supplied at startup) exchanges a password for an
//! HS256 JWT good for `1000 * 24h`; every other control-API route requires
//! that token as a bearer credential.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::HubError;

use super::ApiState;

const TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60 * 24 * 1000);
const ADMIN_USERNAME: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    username: String,
    iat: u64,
    exp: u64,
}

/// Extracts and validates the bearer token from `Authorization: Bearer <token>`.
/// Any route taking `Claims` as an argument is implicitly gated by this check.
impl FromRequestParts<Arc<ApiState>> for Claims {
    type Rejection = HubError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<ApiState>) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(HubError::Auth)?;

        let token = header.strip_prefix("Bearer ").ok_or(HubError::Auth)?;

        let data = jsonwebtoken::decode::<Claims>(
            token,
            &jsonwebtoken::DecodingKey::from_secret(state.jwt_secret.as_bytes()),
            &jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256),
        )
        .map_err(|_| HubError::Auth)?;

        Ok(data.claims)
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    token: String,
    expires_at: u64,
}

/// `POST /auth`: exchanges the admin username/password for a bearer token.
pub async fn login(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, HubError> {
    if request.username != ADMIN_USERNAME {
        return Err(HubError::Auth);
    }

    let matches = bcrypt::verify(&request.password, &state.admin_password_hash).unwrap_or(false);
    if !matches {
        return Err(HubError::Auth);
    }

    let issued_at = now_secs();
    let expires_at = issued_at + TOKEN_LIFETIME.as_secs();
    let claims = Claims { username: ADMIN_USERNAME.to_string(), iat: issued_at, exp: expires_at };
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(state.jwt_secret.as_bytes()),
    )
    .map_err(|e| HubError::Engine(format!("failed to issue token: {e}")))?;

    Ok(Json(LoginResponse { token, expires_at }))
}

/// `GET /auth`: confirms the bearer token presented is still valid, echoing
/// its claims back.
pub async fn whoami(claims: Claims) -> Json<Claims> {
    Json(claims)
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_through_the_same_secret() {
        let secret = "test-secret";
        let claims = Claims { username: ADMIN_USERNAME.to_string(), iat: now_secs(), exp: now_secs() + 3600 };
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let decoded = jsonwebtoken::decode::<Claims>(
            &token,
            &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
            &jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256),
        )
        .unwrap();

        assert_eq!(decoded.claims.username, ADMIN_USERNAME);
    }

    #[test]
    fn token_signed_with_a_different_secret_is_rejected() {
        let claims = Claims { username: ADMIN_USERNAME.to_string(), iat: now_secs(), exp: now_secs() + 3600 };
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(b"secret-a"),
        )
        .unwrap();

        let result = jsonwebtoken::decode::<Claims>(
            &token,
            &jsonwebtoken::DecodingKey::from_secret(b"secret-b"),
            &jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256),
        );

        assert!(result.is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let claims =
            Claims { username: ADMIN_USERNAME.to_string(), iat: now_secs(), exp: now_secs().saturating_sub(10) };
        let secret = "test-secret";
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let result = jsonwebtoken::decode::<Claims>(
            &token,
            &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
            &jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256),
        );

        assert!(result.is_err());
    }
}

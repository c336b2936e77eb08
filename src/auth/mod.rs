//! Authentication context shim.
//!
//! Session issuance lives outside this service; every request arrives with
//! a bearer token minted by the identity collaborator, and this module only
//! validates it and exposes `{user_id, role}` to handlers. `issue_token`
//! exists for tests and local tooling.

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::AppState;

/// Caller role carried in the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Admin,
}

/// JWT claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// Authenticated caller extracted from the bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                ServiceError::Unauthorized("Missing Authorization header".to_string())
            })?;

        let token = header_value.strip_prefix("Bearer ").ok_or_else(|| {
            ServiceError::Unauthorized("Authorization header must be a Bearer token".to_string())
        })?;

        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| ServiceError::Unauthorized(format!("Invalid token: {}", e)))?;

        let user_id = Uuid::parse_str(&token_data.claims.sub)
            .map_err(|_| ServiceError::Unauthorized("Token subject is not a user id".to_string()))?;

        Ok(AuthUser {
            user_id,
            role: token_data.claims.role,
        })
    }
}

/// Mints a signed bearer token. Used by tests and local tooling only; the
/// production identity provider issues real sessions.
pub fn issue_token(
    user_id: Uuid,
    role: Role,
    secret: &str,
    ttl_secs: i64,
) -> Result<String, ServiceError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        role,
        iat: now.timestamp(),
        exp: (now + Duration::seconds(ttl_secs)).timestamp(),
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ServiceError::InternalError(format!("Token encoding failed: {}", e)))
}

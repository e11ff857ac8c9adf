//! Bearer-JWT authentication (spec §6 "Auth"): every route but the
//! WebSocket upgrade (browsers can't set custom headers on it, so the
//! token travels as a query parameter there instead) requires a valid
//! `Authorization: Bearer <token>` header.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

/// An operator request that has presented a valid, unexpired JWT.
pub struct AuthenticatedOperator {
    pub subject: String,
}

impl FromRequestParts<AppState> for AuthenticatedOperator {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or_else(|| ApiError::Unauthorized("missing authorization header".to_string()))?;
        let value = header.to_str().map_err(|_| ApiError::Unauthorized("authorization header is not valid UTF-8".to_string()))?;
        let token = value
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("expected a Bearer token".to_string()))?;

        decode_token(token, &state.decoding_key)
    }
}

pub fn decode_token(token: &str, key: &jsonwebtoken::DecodingKey) -> Result<AuthenticatedOperator, ApiError> {
    let data = decode::<Claims>(token, key, &Validation::default()).map_err(|e| ApiError::Unauthorized(format!("invalid token: {e}")))?;
    Ok(AuthenticatedOperator { subject: data.claims.sub })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    #[test]
    fn valid_token_decodes_subject() {
        let secret = b"test-secret";
        let claims = Claims { sub: "operator-1".to_string(), exp: (chrono::Utc::now().timestamp() + 3600) };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap();

        let decoded = decode_token(&token, &jsonwebtoken::DecodingKey::from_secret(secret)).unwrap();
        assert_eq!(decoded.subject, "operator-1");
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = b"test-secret";
        let claims = Claims { sub: "operator-1".to_string(), exp: (chrono::Utc::now().timestamp() - 3600) };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap();

        let err = decode_token(&token, &jsonwebtoken::DecodingKey::from_secret(secret)).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let claims = Claims { sub: "operator-1".to_string(), exp: (chrono::Utc::now().timestamp() + 3600) };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"secret-a")).unwrap();

        let err = decode_token(&token, &jsonwebtoken::DecodingKey::from_secret(b"secret-b")).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }
}

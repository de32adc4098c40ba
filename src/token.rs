//! HS256 session tokens.

use crate::authz::Role;
use crate::error::{CoreError, CoreResult};
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const ISSUER: &str = "tutord";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Account id, or the administrator id.
    pub sub: String,
    pub role: Role,
    pub phone: Option<String>,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

impl SessionClaims {
    pub fn new(account_id: &str, role: Role, phone: Option<&str>, ttl_hours: i64) -> Self {
        let now = Utc::now();
        Self {
            sub: account_id.to_string(),
            role,
            phone: phone.map(str::to_string),
            iat: now.timestamp(),
            exp: (now + Duration::hours(ttl_hours)).timestamp(),
            iss: ISSUER.to_string(),
        }
    }
}

pub fn issue(claims: &SessionClaims, secret: &[u8]) -> CoreResult<String> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| CoreError::Internal(anyhow::anyhow!("token encoding failed: {}", e)))
}

/// Decode and check a token. Expiry is enforced here, with no leeway.
pub fn verify(token: &str, secret: &[u8]) -> CoreResult<SessionClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.validate_exp = true;
    validation.set_issuer(&[ISSUER]);
    validation.set_required_spec_claims(&["exp", "sub", "iss"]);

    let data = decode::<SessionClaims>(
        token.trim(),
        &DecodingKey::from_secret(secret),
        &validation,
    )
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => CoreError::TokenExpired,
        _ => CoreError::TokenInvalid,
    })?;

    if data.claims.sub.is_empty() {
        return Err(CoreError::TokenInvalid);
    }
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-0123456789";

    #[test]
    fn issued_token_verifies() {
        let claims = SessionClaims::new("acc-1", Role::Teacher, Some("01012345678"), 1);
        let token = issue(&claims, SECRET).expect("issue");
        let back = verify(&token, SECRET).expect("verify");
        assert_eq!(back, claims);
    }

    #[test]
    fn expired_token_is_rejected_as_expired() {
        let mut claims = SessionClaims::new("acc-1", Role::Student, None, 1);
        claims.iat -= 7200;
        claims.exp = Utc::now().timestamp() - 5;
        let token = issue(&claims, SECRET).expect("issue");
        assert!(matches!(verify(&token, SECRET), Err(CoreError::TokenExpired)));
    }

    #[test]
    fn tampered_or_foreign_tokens_are_invalid() {
        let claims = SessionClaims::new("acc-1", Role::Guardian, None, 1);
        let token = issue(&claims, SECRET).expect("issue");
        assert!(matches!(
            verify(&token, b"another-secret-0123456"),
            Err(CoreError::TokenInvalid)
        ));
        assert!(matches!(verify("not.a.token", SECRET), Err(CoreError::TokenInvalid)));

        let mut foreign = claims.clone();
        foreign.iss = "elsewhere".into();
        let token = issue(&foreign, SECRET).expect("issue");
        assert!(matches!(verify(&token, SECRET), Err(CoreError::TokenInvalid)));
    }
}

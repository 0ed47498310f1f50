//! Bearer-token verification.
//!
//! Tokens are HS256-signed JWTs carrying the user's id and role. Issuance
//! lives in the account service; this process only verifies.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// User roles recognized by the access checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Owner,
    Manager,
}

/// Claims embedded in every access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject -- the user's id.
    pub sub: Uuid,
    /// The user's role.
    pub role: UserRole,
    /// Expiration time (UTC Unix timestamp).
    pub exp: i64,
    /// Issued-at time (UTC Unix timestamp).
    pub iat: i64,
}

/// Verifies bearer credentials against the shared HMAC secret.
#[derive(Clone)]
pub struct AuthService {
    decoding_key: DecodingKey,
}

impl AuthService {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate a token and return its claims.
    ///
    /// Signature and expiration are checked; any failure is reported as
    /// `Unauthenticated` without detail about which check failed.
    pub fn verify(&self, token: &str) -> Result<Claims, Error> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| Error::Unauthenticated("invalid or expired token".to_string()))
    }

    /// Extract and verify a `Bearer <token>` authorization header value.
    pub fn verify_bearer(&self, header: Option<&str>) -> Result<Claims, Error> {
        let header =
            header.ok_or_else(|| Error::Unauthenticated("missing credentials".to_string()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Error::Unauthenticated("malformed authorization header".to_string()))?;
        self.verify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-that-is-long-enough-for-hmac";

    fn issue(sub: Uuid, role: UserRole, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub,
            role,
            exp: now + exp_offset,
            iat: now,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .expect("encoding should succeed")
    }

    #[test]
    fn verify_roundtrip() {
        let auth = AuthService::new(SECRET);
        let user_id = Uuid::new_v4();
        let token = issue(user_id, UserRole::Owner, 600);

        let claims = auth.verify(&token).expect("token should verify");
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.role, UserRole::Owner);
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = AuthService::new(SECRET);
        // Expired well past the default leeway.
        let token = issue(Uuid::new_v4(), UserRole::Manager, -300);
        assert!(auth.verify(&token).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let auth = AuthService::new("a-different-secret");
        let token = issue(Uuid::new_v4(), UserRole::Owner, 600);
        assert!(auth.verify(&token).is_err());
    }

    #[test]
    fn bearer_header_parsing() {
        let auth = AuthService::new(SECRET);
        let token = issue(Uuid::new_v4(), UserRole::Owner, 600);

        assert!(auth
            .verify_bearer(Some(&format!("Bearer {}", token)))
            .is_ok());
        assert!(auth.verify_bearer(Some(&token)).is_err());
        assert!(auth.verify_bearer(None).is_err());
    }
}

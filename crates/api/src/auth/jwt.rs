//! Access token verification
//!
//! Tokens are issued elsewhere; this service only checks HS256 signatures,
//! expiry and the subject claim.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: Uuid,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: i64,
}

fn default_role() -> String {
    "member".to_string()
}

#[derive(Clone)]
pub struct JwtManager {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn validate_access_token(
        &self,
        token: &str,
    ) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding_key, &self.validation).map(|data| data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    fn token(secret: &str, exp: i64) -> (Uuid, String) {
        let sub = Uuid::new_v4();
        let claims = Claims {
            sub,
            role: "admin".into(),
            email: Some("admin@example.com".into()),
            exp,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        (sub, token)
    }

    #[test]
    fn test_valid_token() {
        let manager = JwtManager::new(SECRET);
        let exp = OffsetDateTime::now_utc().unix_timestamp() + 3600;
        let (sub, token) = token(SECRET, exp);

        let claims = manager.validate_access_token(&token).unwrap();
        assert_eq!(claims.sub, sub);
        assert_eq!(claims.role, "admin");
    }

    #[test]
    fn test_expired_token_rejected() {
        let manager = JwtManager::new(SECRET);
        let exp = OffsetDateTime::now_utc().unix_timestamp() - 3600;
        let (_, token) = token(SECRET, exp);

        assert!(manager.validate_access_token(&token).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let manager = JwtManager::new(SECRET);
        let exp = OffsetDateTime::now_utc().unix_timestamp() + 3600;
        let (_, token) = token("another-secret-that-is-long-enough!!", exp);

        assert!(manager.validate_access_token(&token).is_err());
    }
}

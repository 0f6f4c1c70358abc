//! Credential Validation
//!
//! The relay does not issue credentials. It only asks a [`TokenValidator`]
//! who a bearer token belongs to before upgrading a connection.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity attached to a session after a successful credential check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: i64,
    pub name: String,
}

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication token")]
    MissingToken,

    #[error("Invalid authentication token: {0}")]
    InvalidToken(String),
}

/// Resolves a bearer token to the subject it was issued for
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Subject, AuthError>;
}

/// Claims carried by relay tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub username: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
    #[serde(default)]
    pub nbf: i64,
}

/// HS256 JWT validator
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<Subject, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        Ok(Subject {
            id: data.claims.user_id,
            name: data.claims.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};

    fn mint(secret: &str, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            user_id: 3,
            username: "driver".to_string(),
            exp: now + exp_offset,
            iat: now,
            nbf: now - 1,
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token() {
        let validator = JwtValidator::new("s3cret");
        let subject = validator.validate(&mint("s3cret", 3600)).await.unwrap();
        assert_eq!(subject.id, 3);
        assert_eq!(subject.name, "driver");
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let validator = JwtValidator::new("s3cret");
        let result = validator.validate(&mint("other", 3600)).await;
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let validator = JwtValidator::new("s3cret");
        // Beyond the default 60s leeway
        let result = validator.validate(&mint("s3cret", -3600)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_garbage_rejected() {
        let validator = JwtValidator::new("s3cret");
        assert!(validator.validate("not-a-jwt").await.is_err());
    }
}

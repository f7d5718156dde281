// fiber-auth: Token pair issue and verification

use chrono::{Duration, Utc};
use fiber_core::Role;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AuthError, AuthResult};

/// Token type discriminator carried in claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

/// JWT claims for both token kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
}

impl Claims {
    /// Remaining lifetime in seconds, floored at zero.
    pub fn remaining_ttl(&self) -> i64 {
        (self.exp - Utc::now().timestamp()).max(0)
    }
}

/// Signing configuration (HS256 shared secret).
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub access_expiry_minutes: i64,
    pub refresh_expiry_days: i64,
}

impl TokenConfig {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            issuer: "fiber-api".to_string(),
            audience: "fiber-dashboard".to_string(),
            access_expiry_minutes: 15,
            refresh_expiry_days: 7,
        }
    }
}

/// Issued pair returned by login and refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub role: Role,
}

fn encode_claims(config: &TokenConfig, claims: &Claims) -> AuthResult<String> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )
    .map_err(|e| AuthError::InvalidToken(e.to_string()))
}

/// Issue a fresh access/refresh pair for a subject.
pub fn issue_tokens(config: &TokenConfig, username: &str, role: Role) -> AuthResult<TokenPair> {
    let now = Utc::now();

    let access = Claims {
        sub: username.to_string(),
        iss: config.issuer.clone(),
        aud: config.audience.clone(),
        iat: now.timestamp(),
        exp: (now + Duration::minutes(config.access_expiry_minutes)).timestamp(),
        jti: Uuid::new_v4().to_string(),
        token_type: TokenType::Access,
    };
    let refresh = Claims {
        sub: username.to_string(),
        iss: config.issuer.clone(),
        aud: config.audience.clone(),
        iat: now.timestamp(),
        exp: (now + Duration::days(config.refresh_expiry_days)).timestamp(),
        jti: Uuid::new_v4().to_string(),
        token_type: TokenType::Refresh,
    };

    Ok(TokenPair {
        access_token: encode_claims(config, &access)?,
        refresh_token: encode_claims(config, &refresh)?,
        expires_in: config.access_expiry_minutes * 60,
        role,
    })
}

/// Stateless verification: signature, expiry, audience.
///
/// The stateful revocation check lives in `revocation` and runs in the
/// middleware after this succeeds.
pub fn verify_token(config: &TokenConfig, token: &str) -> AuthResult<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[config.audience.as_str()]);

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken(e.to_string()),
    })
}

/// Verify a token and require a specific type.
pub fn verify_typed(config: &TokenConfig, token: &str, expected: TokenType) -> AuthResult<Claims> {
    let claims = verify_token(config, token)?;
    if claims.token_type != expected {
        return Err(AuthError::WrongTokenType {
            expected: expected.as_str(),
            got: claims.token_type.as_str().to_string(),
        });
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TokenConfig {
        TokenConfig::new("test-secret".to_string())
    }

    #[test]
    fn test_issue_and_verify_access() {
        let pair = issue_tokens(&config(), "alice", Role::Viewer).unwrap();
        let claims = verify_typed(&config(), &pair.access_token, TokenType::Access).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.token_type, TokenType::Access);
        assert_eq!(pair.expires_in, 900);
    }

    #[test]
    fn test_refresh_token_rejected_as_access() {
        let pair = issue_tokens(&config(), "alice", Role::Viewer).unwrap();
        let err = verify_typed(&config(), &pair.refresh_token, TokenType::Access);
        assert!(matches!(err, Err(AuthError::WrongTokenType { .. })));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let pair = issue_tokens(&config(), "alice", Role::Viewer).unwrap();
        let other = TokenConfig::new("other-secret".to_string());
        assert!(verify_token(&other, &pair.access_token).is_err());
    }

    #[test]
    fn test_jtis_are_unique_per_issue() {
        let a = issue_tokens(&config(), "alice", Role::Viewer).unwrap();
        let b = issue_tokens(&config(), "alice", Role::Viewer).unwrap();
        let ca = verify_token(&config(), &a.access_token).unwrap();
        let cb = verify_token(&config(), &b.access_token).unwrap();
        assert_ne!(ca.jti, cb.jti);
    }

    #[test]
    fn test_expired_token_reports_expired() {
        let mut cfg = config();
        cfg.access_expiry_minutes = -5;
        let pair = issue_tokens(&cfg, "alice", Role::Viewer).unwrap();
        assert!(matches!(
            verify_token(&config(), &pair.access_token),
            Err(AuthError::TokenExpired)
        ));
    }
}

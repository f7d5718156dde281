// fiber-auth: jti revocation list
// Redis denylist with TTL; entries outlive the token by a skew buffer.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::{AuthError, AuthResult};

const REVOKE_PREFIX: &str = "revoked:jti:";

/// Skew buffer added to the natural expiry so clock drift between issuers
/// cannot resurrect a revoked token.
pub const REVOCATION_SKEW_SEC: i64 = 300;

/// Add a jti to the denylist for its remaining lifetime plus skew.
pub async fn revoke_jti(conn: &mut ConnectionManager, jti: &str, ttl_sec: i64) -> AuthResult<()> {
    let key = format!("{}{}", REVOKE_PREFIX, jti);
    let ttl = (ttl_sec + REVOCATION_SKEW_SEC).max(1) as u64;
    conn.set_ex::<_, _, ()>(key, "revoked", ttl)
        .await
        .map_err(|e| AuthError::RevocationUnavailable(e.to_string()))?;
    Ok(())
}

/// Check the denylist. Errors propagate so callers can fail closed.
pub async fn is_jti_revoked(conn: &mut ConnectionManager, jti: &str) -> AuthResult<bool> {
    let key = format!("{}{}", REVOKE_PREFIX, jti);
    conn.exists(key)
        .await
        .map_err(|e| AuthError::RevocationUnavailable(e.to_string()))
}

/// Refresh rotation: validate the presented refresh token, detect reuse,
/// revoke its jti, then issue a new pair.
pub async fn rotate_refresh_token(
    conn: &mut ConnectionManager,
    config: &crate::TokenConfig,
    store: &crate::CredentialStore,
    old_refresh_token: &str,
) -> AuthResult<crate::TokenPair> {
    let claims = crate::tokens::verify_typed(config, old_refresh_token, crate::TokenType::Refresh)?;

    if is_jti_revoked(conn, &claims.jti).await? {
        tracing::error!(
            jti = %claims.jti,
            user = %claims.sub,
            "refresh token reuse detected"
        );
        return Err(AuthError::TokenRevoked);
    }

    revoke_jti(conn, &claims.jti, claims.remaining_ttl()).await?;

    crate::tokens::issue_tokens(config, &claims.sub, store.role_of(&claims.sub))
}

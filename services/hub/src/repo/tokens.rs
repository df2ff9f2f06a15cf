use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};

use super::RepoError;
use crate::auth::{AuthError, RevokedTokenChecker, TokenClaims, TokenVerifier};

/// Token verification against the session-token table.
///
/// Tokens are matched by sha-256 hash; the raw token never reaches the
/// database.  This is the seam where a signed-token verifier would plug in.
pub struct PgTokenVerifier {
    pool: PgPool,
}

impl PgTokenVerifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenVerifier for PgTokenVerifier {
    async fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let hash = Sha256::digest(token.as_bytes()).to_vec();
        let row = sqlx::query(
            r#"SELECT t.user_id, u.username, t.jti
               FROM session_tokens t
               JOIN users u ON u.user_id = t.user_id
               WHERE t.token_hash = $1
                 AND t.expires_at > NOW()
                 AND t.revoked_at IS NULL"#,
        )
        .bind(&hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?
        .ok_or(AuthError::InvalidToken)?;
        let user_id: uuid::Uuid = row.get("user_id");
        Ok(TokenClaims {
            user_id: user_id.to_string(),
            username: row.get("username"),
            jti: row.get("jti"),
        })
    }
}

pub struct PgRevokedTokenChecker {
    pool: PgPool,
}

impl PgRevokedTokenChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RevokedTokenChecker for PgRevokedTokenChecker {
    async fn is_revoked(&self, jti: &str) -> Result<bool, RepoError> {
        let row = sqlx::query("SELECT 1 AS one FROM revoked_tokens WHERE jti = $1")
            .bind(jti)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

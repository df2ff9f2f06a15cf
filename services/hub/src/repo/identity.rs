use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::RepoError;

/// Read-only view of stored identity public keys.
///
/// The hub relays key material without interpreting it; this service only
/// backs the identity read API.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn get_public_key(&self, user_id: &str) -> Result<Vec<u8>, RepoError>;
    /// Hex-encoded sha-256 over the stored public key.
    async fn get_fingerprint(&self, user_id: &str) -> Result<String, RepoError>;
}

/// Computes the canonical fingerprint for a public key.
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

pub struct PgIdentityService {
    pool: PgPool,
}

impl PgIdentityService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityService for PgIdentityService {
    async fn get_public_key(&self, user_id: &str) -> Result<Vec<u8>, RepoError> {
        let id = Uuid::parse_str(user_id).map_err(|_| RepoError::NotFound)?;
        let row = sqlx::query("SELECT public_key FROM identity_keys WHERE user_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepoError::NotFound)?;
        Ok(row.get("public_key"))
    }

    async fn get_fingerprint(&self, user_id: &str) -> Result<String, RepoError> {
        let key = self.get_public_key(user_id).await?;
        Ok(fingerprint(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint(b"test-key");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        // Stable across calls.
        assert_eq!(fp, fingerprint(b"test-key"));
        assert_ne!(fp, fingerprint(b"other-key"));
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;

use crate::repo::RepoError;

/// Claims resolved from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub user_id: String,
    pub username: String,
    pub jti: String,
}

/// Handshake failures; each maps to a policy-close reason.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("token revoked")]
    Revoked,
    #[error("internal error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<TokenClaims, AuthError>;
}

#[async_trait]
pub trait RevokedTokenChecker: Send + Sync {
    async fn is_revoked(&self, jti: &str) -> Result<bool, RepoError>;
}

/// Strips an optional `Bearer ` prefix; auth payloads may carry either form.
pub fn extract_bearer(token: &str) -> &str {
    token.strip_prefix("Bearer ").unwrap_or(token)
}

struct CachedClaims {
    claims: TokenClaims,
    expires_at: Instant,
}

/// Read-side cache in front of a verifier, keyed by token hash.
///
/// Only successful verifications are cached; the raw token never sits in
/// memory.  Expired entries are evicted opportunistically on insert.
pub struct CachingTokenVerifier {
    inner: Arc<dyn TokenVerifier>,
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedClaims>>,
}

impl CachingTokenVerifier {
    pub fn new(inner: Arc<dyn TokenVerifier>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }
}

#[async_trait]
impl TokenVerifier for CachingTokenVerifier {
    async fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let key = Self::cache_key(token);
        {
            let entries = self.entries.lock().expect("token cache lock");
            if let Some(entry) = entries.get(&key) {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.claims.clone());
                }
            }
        }

        let claims = self.inner.verify(token).await?;
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("token cache lock");
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            key,
            CachedClaims {
                claims: claims.clone(),
                expires_at: now + self.ttl,
            },
        );
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn extract_bearer_handles_both_forms() {
        assert_eq!(extract_bearer("Bearer abc123"), "abc123");
        assert_eq!(extract_bearer("abc123"), "abc123");
        assert_eq!(extract_bearer(""), "");
    }

    struct CountingVerifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenVerifier for CountingVerifier {
        async fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if token == "good" {
                Ok(TokenClaims {
                    user_id: "11111111-1111-4111-8111-111111111111".to_owned(),
                    username: "alice".to_owned(),
                    jti: "jti-1".to_owned(),
                })
            } else {
                Err(AuthError::InvalidToken)
            }
        }
    }

    #[tokio::test]
    async fn successful_verifications_are_cached() {
        let inner = Arc::new(CountingVerifier {
            calls: AtomicUsize::new(0),
        });
        let cached = CachingTokenVerifier::new(
            Arc::clone(&inner) as Arc<dyn TokenVerifier>,
            Duration::from_secs(60),
        );

        assert!(cached.verify("good").await.is_ok());
        assert!(cached.verify("good").await.is_ok());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        // Failures are never cached.
        assert!(cached.verify("bad").await.is_err());
        assert!(cached.verify("bad").await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_by_clock() {
        let inner = Arc::new(CountingVerifier {
            calls: AtomicUsize::new(0),
        });
        let cached = CachingTokenVerifier::new(
            Arc::clone(&inner) as Arc<dyn TokenVerifier>,
            Duration::from_secs(60),
        );

        assert!(cached.verify("good").await.is_ok());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cached.verify("good").await.is_ok());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}

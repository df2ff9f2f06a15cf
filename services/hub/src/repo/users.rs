use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::RepoError;

#[derive(Debug, Clone)]
pub struct User {
    pub user_id: Uuid,
    pub username: String,
    pub last_seen: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, user_id: &str) -> Result<User, RepoError>;
    /// Single batched write for the presence flusher.
    async fn update_last_seen_batch(&self, user_ids: &[String]) -> Result<(), RepoError>;
}

pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_id(&self, user_id: &str) -> Result<User, RepoError> {
        let id = Uuid::parse_str(user_id).map_err(|_| RepoError::NotFound)?;
        let row = sqlx::query(
            r#"SELECT user_id, username, last_seen
               FROM users
               WHERE user_id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepoError::NotFound)?;
        Ok(User {
            user_id: row.get("user_id"),
            username: row.get("username"),
            last_seen: row.get("last_seen"),
        })
    }

    async fn update_last_seen_batch(&self, user_ids: &[String]) -> Result<(), RepoError> {
        // Malformed ids cannot come from authenticated sessions; skip them
        // rather than failing the whole batch.
        let ids: Vec<Uuid> = user_ids
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE users SET last_seen = NOW() WHERE user_id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

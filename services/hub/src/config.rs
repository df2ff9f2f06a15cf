//! Hub configuration.
//!
//! Environment variables are the sole config source, matching the other
//! server-side services.  Every option has a default usable in development;
//! `DATABASE_URL` is the one required variable and is read in `main`.

use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Number of hub shards; 0 or 1 disables sharding.
    pub shard_count: usize,
    pub max_file_size: i64,
    pub max_voice_size: i64,
    pub processor_workers: usize,
    pub processor_queue_size: usize,
    /// Hard timeout applied to each processor task.
    pub processor_task_timeout: Duration,
    pub last_seen_update_interval: Duration,
    pub last_seen_batch_size: usize,
    pub presence_queue_size: usize,
    pub user_exists_cache_ttl: Duration,
    pub token_cache_ttl: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    pub circuit_breaker_reset: Duration,
    pub file_transfer_timeout: Duration,
    pub idempotency_ttl: Duration,
    pub send_timeout: Duration,
    pub max_connections: i64,
    pub ws_write_wait: Duration,
    pub ws_pong_wait: Duration,
    pub ws_ping_period: Duration,
    pub ws_max_msg_size: usize,
    pub ws_auth_timeout: Duration,
    pub ws_send_buf_size: usize,
    /// Fraction of per-message debug lines actually emitted.
    pub debug_sample_rate: f64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            max_file_size: 50 * 1024 * 1024,
            max_voice_size: 10 * 1024 * 1024,
            processor_workers: 8,
            processor_queue_size: 1024,
            processor_task_timeout: Duration::from_secs(30),
            last_seen_update_interval: Duration::from_secs(60),
            last_seen_batch_size: 100,
            presence_queue_size: 1024,
            user_exists_cache_ttl: Duration::from_secs(60),
            token_cache_ttl: Duration::from_secs(60),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(5),
            circuit_breaker_reset: Duration::from_secs(30),
            file_transfer_timeout: Duration::from_secs(120),
            idempotency_ttl: Duration::from_secs(300),
            send_timeout: Duration::from_secs(5),
            max_connections: 10_000,
            ws_write_wait: Duration::from_secs(10),
            ws_pong_wait: Duration::from_secs(60),
            ws_ping_period: Duration::from_secs(54),
            ws_max_msg_size: 512 * 1024,
            ws_auth_timeout: Duration::from_secs(10),
            ws_send_buf_size: 256,
            debug_sample_rate: 0.01,
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            shard_count: env_parse("SHARD_COUNT", d.shard_count),
            max_file_size: env_parse("MAX_FILE_SIZE", d.max_file_size),
            max_voice_size: env_parse("MAX_VOICE_SIZE", d.max_voice_size),
            processor_workers: env_parse("PROCESSOR_WORKERS", d.processor_workers),
            processor_queue_size: env_parse("PROCESSOR_QUEUE_SIZE", d.processor_queue_size),
            processor_task_timeout: env_secs("PROCESSOR_TASK_TIMEOUT", d.processor_task_timeout),
            last_seen_update_interval: env_secs(
                "LAST_SEEN_UPDATE_INTERVAL",
                d.last_seen_update_interval,
            ),
            last_seen_batch_size: env_parse("LAST_SEEN_BATCH_SIZE", d.last_seen_batch_size),
            presence_queue_size: env_parse("PRESENCE_QUEUE_SIZE", d.presence_queue_size),
            user_exists_cache_ttl: env_secs("USER_EXISTS_CACHE_TTL", d.user_exists_cache_ttl),
            token_cache_ttl: env_secs("TOKEN_CACHE_TTL", d.token_cache_ttl),
            circuit_breaker_threshold: env_parse(
                "CIRCUIT_BREAKER_THRESHOLD",
                d.circuit_breaker_threshold,
            ),
            circuit_breaker_timeout: env_secs(
                "CIRCUIT_BREAKER_TIMEOUT",
                d.circuit_breaker_timeout,
            ),
            circuit_breaker_reset: env_secs("CIRCUIT_BREAKER_RESET", d.circuit_breaker_reset),
            file_transfer_timeout: env_secs("FILE_TRANSFER_TIMEOUT", d.file_transfer_timeout),
            idempotency_ttl: env_secs("IDEMPOTENCY_TTL", d.idempotency_ttl),
            send_timeout: env_secs("SEND_TIMEOUT", d.send_timeout),
            max_connections: env_parse("MAX_CONNECTIONS", d.max_connections),
            ws_write_wait: env_secs("WS_WRITE_WAIT", d.ws_write_wait),
            ws_pong_wait: env_secs("WS_PONG_WAIT", d.ws_pong_wait),
            ws_ping_period: env_secs("WS_PING_PERIOD", d.ws_ping_period),
            ws_max_msg_size: env_parse("WS_MAX_MSG_SIZE", d.ws_max_msg_size),
            ws_auth_timeout: env_secs("WS_AUTH_TIMEOUT", d.ws_auth_timeout),
            ws_send_buf_size: env_parse("WS_SEND_BUF_SIZE", d.ws_send_buf_size),
            debug_sample_rate: env_parse("DEBUG_SAMPLE_RATE", d.debug_sample_rate),
        }
    }

    /// Effective shard count; 0 and 1 both mean a single hub.
    pub fn effective_shards(&self) -> usize {
        self.shard_count.max(1)
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = HubConfig::default();
        assert!(cfg.ws_ping_period < cfg.ws_pong_wait);
        assert!(cfg.max_voice_size < cfg.max_file_size);
        assert_eq!(cfg.effective_shards(), 4);
    }

    #[test]
    fn shard_count_zero_and_one_disable_sharding() {
        let mut cfg = HubConfig::default();
        cfg.shard_count = 0;
        assert_eq!(cfg.effective_shards(), 1);
        cfg.shard_count = 1;
        assert_eq!(cfg.effective_shards(), 1);
    }
}

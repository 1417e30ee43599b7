use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Every knob named in the external interfaces section, loaded from the
/// environment with the same defaults this system ships with in production.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,

    pub min_update_interval_ms: i64,
    pub min_movement_meters: f64,
    pub max_search_radius_meters: f64,
    pub spatial_index_search_limit: usize,
    pub max_collisions_per_update: usize,

    pub stability_window_ms: i64,
    pub collision_cache_ttl_secs: u64,
    pub position_cache_ttl_secs: u64,
    pub inactivity_window_ms: i64,

    pub batch_size: usize,
    pub batch_wait_ms: u64,
    pub stream_max_len: usize,
    pub event_ttl_secs: u64,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub window_size_ms: u64,
    pub success_threshold: u32,

    pub cooldown_notified_secs: i64,
    pub cooldown_matched_secs: i64,
    pub cooldown_declined_secs: i64,

    pub max_owner_turns: u32,
    pub mission_worker_concurrency: usize,
    pub mission_max_attempts: u32,
    pub mission_retry_backoff_base_ms: u64,
    pub mission_inflight_lock_ttl_secs: u64,

    pub stability_sweep_interval_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    pub collision_event_max_age_hours: i64,
    pub match_pending_accept_max_age_hours: i64,

    pub spatial_query_timeout_secs: u64,
    pub http_bind_addr: String,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/collision_match".to_string()),
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string()),

            min_update_interval_ms: env_or("MIN_UPDATE_INTERVAL_MS", 3000),
            min_movement_meters: env_or("MIN_MOVEMENT_METERS", 20.0),
            max_search_radius_meters: env_or("MAX_SEARCH_RADIUS_METERS", 5000.0),
            spatial_index_search_limit: env_or("SPATIAL_INDEX_SEARCH_LIMIT", 50),
            max_collisions_per_update: env_or("MAX_COLLISIONS_PER_UPDATE", 10),

            stability_window_ms: env_or("STABILITY_WINDOW_MS", 60_000),
            collision_cache_ttl_secs: env_or("COLLISION_CACHE_TTL_SECS", 3600),
            position_cache_ttl_secs: env_or("POSITION_CACHE_TTL_SECS", 300),
            inactivity_window_ms: env_or("INACTIVITY_WINDOW_MS", 300_000),

            batch_size: env_or("EVENT_BATCH_SIZE", 50),
            batch_wait_ms: env_or("EVENT_BATCH_WAIT_MS", 100),
            stream_max_len: env_or("EVENT_STREAM_MAX_LEN", 10_000),
            event_ttl_secs: env_or("EVENT_TTL_SECS", 3600),
            failure_threshold: env_or("CIRCUIT_FAILURE_THRESHOLD", 5),
            reset_timeout_ms: env_or("CIRCUIT_RESET_TIMEOUT_MS", 30_000),
            window_size_ms: env_or("CIRCUIT_WINDOW_SIZE_MS", 60_000),
            success_threshold: env_or("CIRCUIT_SUCCESS_THRESHOLD", 3),

            cooldown_notified_secs: env_or("COOLDOWN_NOTIFIED_SECS", 6 * 3600),
            cooldown_matched_secs: env_or("COOLDOWN_MATCHED_SECS", 24 * 3600),
            cooldown_declined_secs: env_or("COOLDOWN_DECLINED_SECS", 24 * 3600),

            max_owner_turns: env_or("MAX_OWNER_TURNS", 3),
            mission_worker_concurrency: env_or("MISSION_WORKER_CONCURRENCY", 4),
            mission_max_attempts: env_or("MISSION_MAX_ATTEMPTS", 3),
            mission_retry_backoff_base_ms: env_or("MISSION_RETRY_BACKOFF_BASE_MS", 1000),
            mission_inflight_lock_ttl_secs: env_or("MISSION_INFLIGHT_LOCK_TTL_SECS", 180),

            stability_sweep_interval_secs: env_or("STABILITY_SWEEP_INTERVAL_SECS", 5),
            expiry_sweep_interval_secs: env_or("EXPIRY_SWEEP_INTERVAL_SECS", 600),
            collision_event_max_age_hours: env_or("COLLISION_EVENT_MAX_AGE_HOURS", 48),
            match_pending_accept_max_age_hours: env_or("MATCH_PENDING_ACCEPT_MAX_AGE_HOURS", 24),

            spatial_query_timeout_secs: env_or("SPATIAL_QUERY_TIMEOUT_SECS", 5),
            http_bind_addr: env::var("HTTP_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        }
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn window_size(&self) -> Duration {
        Duration::from_millis(self.window_size_ms)
    }

    pub fn cooldown_duration(&self, kind: crate::models::CooldownType) -> chrono::Duration {
        use crate::models::CooldownType::*;
        match kind {
            Notified => chrono::Duration::seconds(self.cooldown_notified_secs),
            Matched => chrono::Duration::seconds(self.cooldown_matched_secs),
            Declined => chrono::Duration::seconds(self.cooldown_declined_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_env()
    }
}

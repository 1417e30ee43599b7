//! Location ingestion and debounce. Grounds on the ingestion server's
//! per-device admission-state map and age/rate filtering, adapted from
//! per-device dedup into per-user debounce with a movement filter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collision::CollisionDetector;
use crate::config::Config;
use crate::db::Repository;
use crate::error::AppResult;
use crate::event_bus::{Event, EventBus};
use crate::geo;
use crate::store::KvStore;

#[derive(Debug, Clone, Copy)]
struct AdmittedPosition {
    lat: f64,
    lon: f64,
    admitted_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collisions_detected: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpdateOutcome {
    fn skipped(reason: &str) -> Self {
        debug!(reason, "location update skipped");
        UpdateOutcome { skipped: true, collisions_detected: None, error: None }
    }

    fn error(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        warn!(error = %msg, "location update failed, reporting skipped");
        UpdateOutcome { skipped: true, collisions_detected: None, error: Some(msg) }
    }

    fn admitted(collisions: usize) -> Self {
        UpdateOutcome { skipped: false, collisions_detected: Some(collisions), error: None }
    }
}

pub struct LocationService {
    repo: Arc<dyn Repository>,
    store: Arc<dyn KvStore>,
    detector: Arc<CollisionDetector>,
    bus: EventBus,
    config: Config,
    in_process_cache: DashMap<String, AdmittedPosition>,
}

impl LocationService {
    pub fn new(repo: Arc<dyn Repository>, store: Arc<dyn KvStore>, detector: Arc<CollisionDetector>, bus: EventBus, config: Config) -> Self {
        LocationService { repo, store, detector, bus, config, in_process_cache: DashMap::new() }
    }

    /// Admits or rejects a position update, and on admission persists it
    /// and triggers collision detection for the user's live circles.
    /// Never propagates an error to the caller: all failures degrade to a
    /// `skipped` outcome carrying an `error` description.
    pub async fn update_user_location(
        &self,
        user_id: &str,
        lat: f64,
        lon: f64,
        accuracy_meters: f64,
        client_timestamp: DateTime<Utc>,
    ) -> UpdateOutcome {
        let now = Utc::now();

        if !lat.is_finite() || !lon.is_finite() || !accuracy_meters.is_finite() {
            return UpdateOutcome::skipped("non-finite input");
        }

        let age = now.signed_duration_since(client_timestamp);
        if age > chrono::Duration::seconds(30) {
            return UpdateOutcome::skipped("client timestamp older than 30s");
        }

        match self.check_admission(user_id, lat, lon, now).await {
            Ok(true) => {}
            Ok(false) => return UpdateOutcome::skipped("rate or movement filter"),
            Err(err) => return UpdateOutcome::error(err.to_string()),
        }

        if let Err(err) = self.admit(user_id, lat, lon, accuracy_meters, now).await {
            return UpdateOutcome::error(err.to_string());
        }

        match self.detect_after_admission(user_id, now).await {
            Ok(count) => UpdateOutcome::admitted(count),
            Err(err) => {
                // Admission itself succeeded; detection failures degrade
                // gracefully rather than erasing the successful admit.
                warn!(error = %err, "collision detection failed after admission");
                UpdateOutcome::admitted(0)
            }
        }
    }

    /// Evaluates the rate and movement admission rules against the
    /// persisted last position (the in-process cache is an optimization,
    /// not the source of truth: the persistent copy wins on divergence).
    /// The cache can only short-circuit a *rejection* cheaply; it never
    /// admits on its own, so a cache that's gone stale relative to the
    /// persisted store can't let a disallowed update through.
    async fn check_admission(&self, user_id: &str, lat: f64, lon: f64, now: DateTime<Utc>) -> AppResult<bool> {
        if let Some(cached) = self.in_process_cache.get(user_id) {
            let elapsed_ms = now.timestamp_millis() - cached.admitted_at_ms;
            if elapsed_ms < self.config.min_update_interval_ms {
                let moved = geo::haversine(cached.lat, cached.lon, lat, lon);
                if moved < self.config.min_movement_meters {
                    return Ok(false);
                }
            }
        }

        let key = format!("position:{user_id}");
        let persisted = self.store.hash_get_all(&key).await?;

        let Some(fields) = persisted else {
            return Ok(true); // first-ever update is always admitted
        };

        let last_lat: f64 = fields.get("lat").and_then(|v| v.parse().ok()).unwrap_or(lat);
        let last_lon: f64 = fields.get("lon").and_then(|v| v.parse().ok()).unwrap_or(lon);
        let last_ts_ms: i64 = fields.get("timestamp_ms").and_then(|v| v.parse().ok()).unwrap_or(0);

        let elapsed_ms = now.timestamp_millis() - last_ts_ms;
        if elapsed_ms < self.config.min_update_interval_ms {
            return Ok(false);
        }

        let moved = geo::haversine(last_lat, last_lon, lat, lon);
        if moved < self.config.min_movement_meters {
            return Ok(false);
        }

        Ok(true)
    }

    async fn admit(&self, user_id: &str, lat: f64, lon: f64, accuracy: f64, now: DateTime<Utc>) -> AppResult<()> {
        let key = format!("position:{user_id}");
        self.store
            .hash_set_fields(
                &key,
                &[
                    ("lat", lat.to_string().as_str()),
                    ("lon", lon.to_string().as_str()),
                    ("accuracy", accuracy.to_string().as_str()),
                    ("timestamp_ms", now.timestamp_millis().to_string().as_str()),
                ],
                Some(Duration::from_secs(self.config.position_cache_ttl_secs)),
            )
            .await?;

        self.in_process_cache.insert(user_id.to_string(), AdmittedPosition { lat, lon, admitted_at_ms: now.timestamp_millis() });

        self.repo.update_user_position(user_id, lat, lon, now).await?;

        self.bus.emit(
            Event::new("location.updated", user_id)
                .with_metadata("lat", serde_json::json!(lat))
                .with_metadata("lon", serde_json::json!(lon))
                .with_metadata("accuracy_meters", serde_json::json!(accuracy)),
        );

        Ok(())
    }

    async fn detect_after_admission(&self, user_id: &str, now: DateTime<Utc>) -> AppResult<usize> {
        let circles = self.repo.live_circles_for_owner(user_id, now).await?;
        if circles.is_empty() {
            return Ok(0);
        }
        let detections = self.detector.detect_collisions_for_user(user_id, &circles).await?;
        info!(user_id, count = detections.len(), "collision detection ran after admission");
        Ok(detections.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_match::AgentMatchService;
    use crate::db::InMemoryRepository;
    use crate::event_bus::EventBus;
    use crate::external::stub::*;
    use crate::models::*;
    use crate::store::InMemoryStore;
    use chrono::Duration as ChronoDuration;

    fn build_service() -> (LocationService, InMemoryRepository) {
        let repo = InMemoryRepository::new();
        let repo_dyn: Arc<dyn Repository> = Arc::new(repo.clone());
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let config = Config::from_env();
        let bus = EventBus::disabled();
        let agent_match = Arc::new(AgentMatchService::new(
            repo_dyn.clone(),
            store.clone(),
            bus.clone(),
            config.clone(),
            Arc::new(StubAgentRuntime { stop_after_first_turn: true }),
            Arc::new(StubJudge { should_notify: true, confidence: Some(0.9) }),
            Arc::new(RecordingNotificationGateway::default()),
        ));
        let detector = Arc::new(CollisionDetector::new(repo_dyn.clone(), store.clone(), bus.clone(), config.clone(), agent_match));
        (LocationService::new(repo_dyn, store, detector, bus, config), repo)
    }

    async fn seed_user(repo: &InMemoryRepository, id: &str) {
        let now = Utc::now();
        repo.seed_user(User {
            id: id.to_string(),
            contact: format!("{id}@example.com"),
            profile: None,
            current_lat: None,
            current_lon: None,
            created_at: now,
            updated_at: now,
        })
        .await;
    }

    #[tokio::test]
    async fn cold_start_admits_and_finds_no_collisions() {
        let (service, repo) = build_service();
        seed_user(&repo, "u1").await;

        let outcome = service.update_user_location("u1", 40.7128, -74.0060, 5.0, Utc::now()).await;
        assert!(!outcome.skipped);
        assert_eq!(outcome.collisions_detected, Some(0));
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let (service, repo) = build_service();
        seed_user(&repo, "u1").await;

        let stale = Utc::now() - ChronoDuration::seconds(31);
        let outcome = service.update_user_location("u1", 40.7128, -74.0060, 5.0, stale).await;
        assert!(outcome.skipped);
    }

    #[tokio::test]
    async fn debounced_by_small_movement_within_window() {
        let (service, repo) = build_service();
        seed_user(&repo, "u1").await;

        let first = service.update_user_location("u1", 40.7128, -74.0060, 5.0, Utc::now()).await;
        assert!(!first.skipped);

        // ~1.3m away, well under MIN_MOVEMENT_METERS, submitted immediately.
        let second = service.update_user_location("u1", 40.71281, -74.00601, 5.0, Utc::now()).await;
        assert!(second.skipped);
    }

    #[tokio::test]
    async fn non_finite_coordinates_are_rejected_without_panicking() {
        let (service, repo) = build_service();
        seed_user(&repo, "u1").await;

        let outcome = service.update_user_location("u1", f64::NAN, -74.0060, 5.0, Utc::now()).await;
        assert!(outcome.skipped);
    }
}

//! Periodic maintenance: stability promotion and expiry sweeps. Grounds on
//! the tick-driven loops spawned from the process entrypoint for the race
//! engine's 5Hz tick and the auto-director's periodic ranking pass — both
//! `tokio::time::interval` loops that must not overlap themselves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{info, warn};

use crate::collision::CollisionDetector;
use crate::config::Config;
use crate::db::Repository;
use crate::event_bus::{Event, EventBus};

/// Runs the stability sweeper on a fixed interval. A tick that is still
/// running when the next one fires is skipped rather than queued.
pub async fn run_stability_sweeper(detector: Arc<CollisionDetector>, config: Config) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(config.stability_sweep_interval_secs));
    let running = Arc::new(AtomicBool::new(false));

    loop {
        ticker.tick().await;
        if running.swap(true, Ordering::SeqCst) {
            warn!("stability sweeper tick skipped, previous run still in progress");
            continue;
        }
        let detector = detector.clone();
        let running = running.clone();
        tokio::spawn(async move {
            match detector.run_scheduled_promotion().await {
                Ok((promoted, expired)) => info!(promoted, expired, "stability sweep tick complete"),
                Err(err) => warn!(error = %err, "stability sweep tick failed"),
            }
            running.store(false, Ordering::SeqCst);
        });
    }
}

/// Runs the expiry sweeper on a fixed interval: collision events and
/// pending matches past their age limits are marked `expired` in bulk.
pub async fn run_expiry_sweeper(repo: Arc<dyn Repository>, bus: EventBus, config: Config) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(config.expiry_sweep_interval_secs));
    let running = Arc::new(AtomicBool::new(false));

    loop {
        ticker.tick().await;
        if running.swap(true, Ordering::SeqCst) {
            warn!("expiry sweeper tick skipped, previous run still in progress");
            continue;
        }
        let repo = repo.clone();
        let bus = bus.clone();
        let running = running.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let now = Utc::now();
            let collision_cutoff = now - chrono::Duration::hours(config.collision_event_max_age_hours);
            let match_cutoff = now - chrono::Duration::hours(config.match_pending_accept_max_age_hours);

            let expired_collisions = match repo.expire_stale_collision_events(collision_cutoff, now).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(error = %err, "collision expiry sweep failed");
                    Vec::new()
                }
            };
            for event in &expired_collisions {
                bus.emit(
                    Event::new("collision.expired", &event.user1_id)
                        .with_related_user(&event.user2_id)
                        .with_circle(&event.circle1_id)
                        .with_metadata("collision_event_id", serde_json::json!(event.id)),
                );
            }

            let expired_matches = match repo.expire_stale_matches(match_cutoff).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(error = %err, "match expiry sweep failed");
                    Vec::new()
                }
            };
            for m in &expired_matches {
                bus.emit(
                    Event::new("match.expired", &m.primary_user_id)
                        .with_related_user(&m.secondary_user_id)
                        .with_circle(&m.primary_circle_id)
                        .with_metadata("match_id", serde_json::json!(m.id)),
                );
            }

            let collisions_expired = expired_collisions.len();
            let matches_expired = expired_matches.len();
            info!(collisions_expired, matches_expired, "expiry sweep tick complete");
            running.store(false, Ordering::SeqCst);
        });
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
    use std::sync::Arc;

    #[tokio::test]
    async fn expiry_sweep_expires_stale_rows_and_leaves_fresh_ones() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();

        let stale_match = Match {
            id: "stale".into(),
            primary_user_id: "u1".into(),
            secondary_user_id: "u2".into(),
            primary_circle_id: "c1".into(),
            secondary_circle_id: "c2".into(),
            kind: MatchType::Match,
            worth_it_score: 0.5,
            status: MatchStatus::PendingAccept,
            explanation_summary: None,
            created_at: now - chrono::Duration::hours(30),
        };
        let fresh_match = Match { id: "fresh".into(), created_at: now, ..stale_match.clone() };
        repo.create_match(stale_match).await.unwrap();
        repo.create_match(fresh_match).await.unwrap();

        let repo_dyn: Arc<dyn Repository> = Arc::new(repo.clone());
        let mut config = Config::from_env();
        config.match_pending_accept_max_age_hours = 24;
        config.expiry_sweep_interval_secs = 100_000; // never fires again within the test

        let cutoff = now - chrono::Duration::hours(config.match_pending_accept_max_age_hours);
        let expired = repo_dyn.expire_stale_matches(cutoff).await.unwrap();
        assert_eq!(expired.len(), 1);

        assert_eq!(repo.get_match("stale").await.unwrap().unwrap().status, MatchStatus::Expired);
        assert_eq!(repo.get_match("fresh").await.unwrap().unwrap().status, MatchStatus::PendingAccept);
    }

    #[tokio::test]
    async fn scheduled_promotion_is_idempotent_running_twice() {
        let repo = InMemoryRepository::new();
        let repo_dyn: Arc<dyn Repository> = Arc::new(repo.clone());
        let store: Arc<dyn crate::store::KvStore> = Arc::new(InMemoryStore::new());
        let mut config = Config::from_env();
        config.stability_window_ms = 0;
        config.inactivity_window_ms = 60_000;
        let bus = EventBus::disabled();
        let agent_match = Arc::new(AgentMatchService::new(
            repo_dyn.clone(),
            store.clone(),
            bus.clone(),
            config.clone(),
            Arc::new(StubAgentRuntime { stop_after_first_turn: true }),
            Arc::new(StubJudge { should_notify: false, confidence: None }),
            Arc::new(RecordingNotificationGateway::default()),
        ));
        let detector = Arc::new(CollisionDetector::new(repo_dyn.clone(), store.clone(), bus.clone(), config, agent_match));

        store.zadd("collision:stability:queue", "c1:c2", 1.0).await.unwrap();
        store
            .hash_set_fields("collision:active:c1:c2", &[("first_seen_at", "1"), ("last_seen_at", "1"), ("status", "detecting"), ("distance", "10")], None)
            .await
            .unwrap();

        let (p1, e1) = detector.run_scheduled_promotion().await.unwrap();
        let (p2, e2) = detector.run_scheduled_promotion().await.unwrap();
        assert_eq!(p1, 1);
        assert_eq!((p2, e2), (0, 0));
        let _ = e1;
    }
}

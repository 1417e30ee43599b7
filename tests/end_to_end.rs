//! Exercises the full pipeline across crate boundaries: a location update
//! drives collision detection, a stable collision hands off to mission
//! creation, and a completed mission produces a match with the matched
//! cooldown in place to block re-notification.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use collision_match_core::agent_match::AgentMatchService;
use collision_match_core::collision::CollisionDetector;
use collision_match_core::config::Config;
use collision_match_core::db::{InMemoryRepository, Repository};
use collision_match_core::event_bus::EventBus;
use collision_match_core::external::stub::{RecordingNotificationGateway, StubAgentRuntime, StubJudge};
use collision_match_core::location::LocationService;
use collision_match_core::mission_queue::{InMemoryJobStore, MissionWorker};
use collision_match_core::models::{Circle, CircleStatus, CooldownType, MissionStatus, User};
use collision_match_core::store::{InMemoryStore, KvStore};

struct Harness {
    location: LocationService,
    agent_match: Arc<AgentMatchService>,
    repo: InMemoryRepository,
    _worker_handles: Vec<tokio::task::JoinHandle<()>>,
}

fn build_harness() -> Harness {
    let repo = InMemoryRepository::new();
    let repo_dyn: Arc<dyn Repository> = Arc::new(repo.clone());
    let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());

    let mut config = Config::from_env();
    // A single detection immediately satisfies the stability window, so
    // promotion and mission creation happen inline with the first update.
    config.stability_window_ms = 0;
    config.max_search_radius_meters = 1000.0;
    config.mission_worker_concurrency = 1;

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

    let job_store = Arc::new(InMemoryJobStore::new());
    agent_match.attach_job_store(job_store.clone());

    let detector = Arc::new(CollisionDetector::new(repo_dyn.clone(), store.clone(), bus.clone(), config.clone(), agent_match.clone()));
    let location = LocationService::new(repo_dyn.clone(), store.clone(), detector, bus, config.clone());

    let worker = Arc::new(MissionWorker::new(job_store, agent_match.clone(), config));
    let worker_handles = worker.spawn_pool();

    Harness { location, agent_match, repo, _worker_handles: worker_handles }
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

async fn seed_circle(repo: &InMemoryRepository, id: &str, owner: &str) {
    let now = Utc::now();
    repo.seed_circle(Circle {
        id: id.to_string(),
        owner_user_id: owner.to_string(),
        objective: "interview".to_string(),
        radius_meters: 100.0,
        start_at: now - chrono::Duration::minutes(5),
        expires_at: now + chrono::Duration::hours(1),
        status: CircleStatus::Active,
        created_at: now,
        updated_at: now,
    })
    .await;
}

/// Polls until the mission queued for `collision_event_id` exists, driven
/// by the background worker pool rather than a direct call.
async fn wait_for_mission(repo: &InMemoryRepository, collision_event_id: &str) -> String {
    for _ in 0..200 {
        if let Some(collision) = repo.get_collision_event(collision_event_id).await.unwrap() {
            if let Some(mission_id) = &collision.mission_id {
                return mission_id.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("mission was never created for collision {collision_event_id}");
}

/// Polls until the mission worker pool has finished processing a mission.
async fn wait_for_completion(repo: &InMemoryRepository, mission_id: &str) {
    for _ in 0..200 {
        if let Some(mission) = repo.get_mission(mission_id).await.unwrap() {
            if matches!(mission.status, MissionStatus::Completed | MissionStatus::Failed) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("mission {mission_id} was never completed");
}

#[tokio::test]
async fn collision_to_mission_to_match_end_to_end() {
    let harness = build_harness();
    seed_user(&harness.repo, "u1").await;
    seed_user(&harness.repo, "u2").await;
    seed_circle(&harness.repo, "c1", "u1").await;
    seed_circle(&harness.repo, "c2", "u2").await;

    // u1 and u2 are ~60m apart, inside both circles' 100m radius.
    let outcome1 = harness.location.update_user_location("u1", 40.7128, -74.0060, 5.0, Utc::now()).await;
    assert!(!outcome1.skipped, "first update for u1 should admit");
    assert_eq!(outcome1.collisions_detected, Some(0), "u2 has no position yet");

    let outcome2 = harness.location.update_user_location("u2", 40.71325, -74.00600, 5.0, Utc::now()).await;
    assert!(!outcome2.skipped, "first update for u2 should admit");
    assert_eq!(outcome2.collisions_detected, Some(1), "u1 is within range and should be detected");

    let collision = harness
        .repo
        .get_collision_event_by_pair("c1", "c2")
        .await
        .expect("collision event should exist between c1 and c2");

    let mission_id = wait_for_mission(&harness.repo, &collision.id).await;
    wait_for_completion(&harness.repo, &mission_id).await;

    let mission = harness.repo.get_mission(&mission_id).await.unwrap().unwrap();
    assert_eq!(mission.status, MissionStatus::Completed);

    let cooldown = harness.agent_match.check_cooldown("u1", "u2").await.unwrap();
    assert!(!cooldown.allowed, "a matched cooldown should now block re-notification");
    assert_eq!(cooldown.cooldown_type, Some(CooldownType::Matched));

    // A second stability promotion attempt for the same pair is blocked by
    // the cooldown before it ever reaches the single-flight lock.
    let second_attempt = harness.agent_match.create_mission_for_collision(&collision).await.unwrap();
    assert!(second_attempt.is_none());
}

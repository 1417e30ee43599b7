//! Cooldowns, single-flight mission creation, and result handling — the
//! component that turns a stable collision into a mission and, eventually,
//! a match. Grounds on the tick-driven state-machine struct shape used for
//! the sailing procedure engine (explicit status field, forward-only
//! transitions, advance-on-event methods), adapted to the
//! collision -> mission -> match lifecycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Repository;
use crate::error::{AppError, AppResult};
use crate::event_bus::{Event, EventBus};
use crate::external::{AgentRuntime, Judge, NotificationGateway};
use crate::geo;
use crate::mission_queue::{JobPayload, JobStore};
use crate::models::*;
use crate::store::KvStore;

#[derive(Debug, Clone)]
pub struct CooldownCheck {
    pub allowed: bool,
    pub cooldown_type: Option<CooldownType>,
    pub remaining_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MissionResult {
    pub success: bool,
    pub match_made: bool,
    pub transcript: Option<serde_json::Value>,
    pub judge_decision: Option<serde_json::Value>,
    pub error: Option<String>,
}

pub struct AgentMatchService {
    repo: Arc<dyn Repository>,
    store: Arc<dyn KvStore>,
    bus: EventBus,
    config: Config,
    agent_runtime: Arc<dyn AgentRuntime>,
    judge: Arc<dyn Judge>,
    notifications: Arc<dyn NotificationGateway>,
    job_store: std::sync::OnceLock<Arc<dyn JobStore>>,
}

impl AgentMatchService {
    pub fn new(
        repo: Arc<dyn Repository>,
        store: Arc<dyn KvStore>,
        bus: EventBus,
        config: Config,
        agent_runtime: Arc<dyn AgentRuntime>,
        judge: Arc<dyn Judge>,
        notifications: Arc<dyn NotificationGateway>,
    ) -> Self {
        AgentMatchService {
            repo,
            store,
            bus,
            config,
            agent_runtime,
            judge,
            notifications,
            job_store: std::sync::OnceLock::new(),
        }
    }

    /// The job store is wired in after construction to break the
    /// otherwise-cyclic initialization order between the mission queue and
    /// this service (the worker holds an `Arc<AgentMatchService>`, and this
    /// service needs an `Arc<dyn JobStore>` to enqueue).
    pub fn attach_job_store(&self, job_store: Arc<dyn JobStore>) {
        let _ = self.job_store.set(job_store);
    }

    fn job_store(&self) -> &Arc<dyn JobStore> {
        self.job_store.get().expect("job store must be attached before use")
    }

    pub fn agent_runtime(&self) -> &Arc<dyn AgentRuntime> {
        &self.agent_runtime
    }

    pub fn judge(&self) -> &Arc<dyn Judge> {
        &self.judge
    }

    /// Read-only mission lookup for the worker's idempotent-redelivery
    /// check; does not mutate any state.
    pub async fn peek_mission(&self, mission_id: &str) -> AppResult<Option<InterviewMission>> {
        self.repo.get_mission(mission_id).await
    }

    /// Called by the worker once it has claimed a job, before running the
    /// interview: promotes the mission from `pending` to `running` so its
    /// status reflects that a worker is actively handling it.
    pub async fn mark_mission_running(&self, mission_id: &str) -> AppResult<bool> {
        self.repo.update_mission_status_if(mission_id, &[MissionStatus::Pending], MissionStatus::Running).await
    }

    // -----------------------------------------------------------------
    // Cooldown
    // -----------------------------------------------------------------

    pub async fn check_cooldown(&self, user1_id: &str, user2_id: &str) -> AppResult<CooldownCheck> {
        let key = format!("cooldown:{}", geo::pair_key(user1_id, user2_id));
        let Some(fields) = self.store.hash_get_all(&key).await? else {
            return Ok(CooldownCheck { allowed: true, cooldown_type: None, remaining_ms: None });
        };

        let expires_at_ms: i64 = fields.get("expires_at").and_then(|v| v.parse().ok()).unwrap_or(0);
        let now_ms = Utc::now().timestamp_millis();

        if expires_at_ms <= now_ms {
            self.store.delete(&key).await?;
            return Ok(CooldownCheck { allowed: true, cooldown_type: None, remaining_ms: None });
        }

        let kind = match fields.get("type").map(String::as_str) {
            Some("notified") => CooldownType::Notified,
            Some("matched") => CooldownType::Matched,
            Some("declined") => CooldownType::Declined,
            _ => CooldownType::Notified,
        };

        Ok(CooldownCheck { allowed: false, cooldown_type: Some(kind), remaining_ms: Some(expires_at_ms - now_ms) })
    }

    pub async fn set_cooldown(&self, user1_id: &str, user2_id: &str, kind: CooldownType) -> AppResult<()> {
        let key = format!("cooldown:{}", geo::pair_key(user1_id, user2_id));
        let now = Utc::now();
        let duration = self.config.cooldown_duration(kind);
        let expires_at = now + duration;

        let type_str = match kind {
            CooldownType::Notified => "notified",
            CooldownType::Matched => "matched",
            CooldownType::Declined => "declined",
        };

        self.store
            .hash_set_fields(
                &key,
                &[
                    ("type", type_str),
                    ("created_at", now.timestamp_millis().to_string().as_str()),
                    ("expires_at", expires_at.timestamp_millis().to_string().as_str()),
                ],
                Some(duration.to_std().unwrap_or(Duration::from_secs(1))),
            )
            .await
    }

    // -----------------------------------------------------------------
    // Mission creation
    // -----------------------------------------------------------------

    /// Entry point called by the collision detector once a pair has been
    /// promoted to `stable`.
    pub async fn on_collision_stable(&self, collision_event_id: &str) {
        let collision = match self.repo.get_collision_event(collision_event_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                warn!(collision_event_id, "collision event not found for handoff");
                return;
            }
            Err(err) => {
                warn!(collision_event_id, error = %err, "failed to load collision event for handoff");
                return;
            }
        };

        if let Err(err) = self.create_mission_for_collision(&collision).await {
            if !err.is_expected() {
                warn!(collision_event_id, error = %err, "mission creation failed");
            }
        }
    }

    /// Returns `Ok(Some(mission))` on success, `Ok(None)` on an expected
    /// denial (cooldown or lost single-flight race), `Err` on a genuine
    /// failure after the lock was already acquired.
    pub async fn create_mission_for_collision(&self, collision: &CollisionEvent) -> AppResult<Option<InterviewMission>> {
        let cooldown = self.check_cooldown(&collision.user1_id, &collision.user2_id).await?;
        if !cooldown.allowed {
            return Ok(None);
        }

        let pair_key = geo::pair_key(&collision.circle1_id, &collision.circle2_id);
        let lock_key = format!("mission:inflight:{pair_key}");
        let lock_ttl = Duration::from_secs(self.config.mission_inflight_lock_ttl_secs);

        let acquired = self.store.set_nx(&lock_key, &collision.id, lock_ttl).await?;
        if !acquired {
            return Ok(None); // another instance is already handling this pair
        }

        match self.create_mission_row_and_enqueue(collision).await {
            Ok(mission) => {
                self.bus.emit(
                    Event::new("agent_match.mission_created", &collision.user1_id)
                        .with_related_user(&collision.user2_id)
                        .with_circle(&collision.circle1_id)
                        .with_metadata("mission_id", json!(mission.id))
                        .with_metadata("collision_event_id", json!(collision.id)),
                );
                info!(mission_id = %mission.id, "mission created");
                Ok(Some(mission))
            }
            Err(err) => {
                // Failure after lock acquisition: release the lock so a
                // future attempt is not permanently blocked, then surface.
                if let Err(release_err) = self.store.delete(&lock_key).await {
                    warn!(error = %release_err, "failed to release inflight lock after mission creation error");
                }
                Err(err)
            }
        }
    }

    async fn create_mission_row_and_enqueue(&self, collision: &CollisionEvent) -> AppResult<InterviewMission> {
        let now = Utc::now();
        let mission = InterviewMission {
            id: uuid::Uuid::new_v4().to_string(),
            owner_user_id: collision.user1_id.clone(),
            visitor_user_id: collision.user2_id.clone(),
            owner_circle_id: collision.circle1_id.clone(),
            visitor_circle_id: collision.circle2_id.clone(),
            collision_event_id: collision.id.clone(),
            status: MissionStatus::Pending,
            attempt_number: 1,
            transcript: None,
            judge_decision: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };

        let mission = self.repo.create_mission(mission).await?;

        let advanced = self
            .repo
            .update_collision_status_if(&collision.id, &[CollisionStatus::Stable], CollisionStatus::MissionCreated, Some(&mission.id))
            .await?;
        if !advanced {
            return Err(AppError::Contention(format!("collision {} was not in stable status", collision.id)));
        }

        let owner = self.repo.get_user(&mission.owner_user_id).await?;
        let visitor = self.repo.get_user(&mission.visitor_user_id).await?;

        self.job_store()
            .enqueue(JobPayload {
                mission_id: mission.id.clone(),
                owner_user_id: mission.owner_user_id.clone(),
                visitor_user_id: mission.visitor_user_id.clone(),
                owner_profile: owner.and_then(|u| u.profile),
                visitor_profile: visitor.and_then(|u| u.profile),
                owner_circle: collision.circle1_id.clone(),
                context: json!({ "collision_event_id": collision.id }),
            })
            .await?;

        Ok(mission)
    }

    // -----------------------------------------------------------------
    // Mission result handling
    // -----------------------------------------------------------------

    /// Called by the mission worker exactly once per job. Idempotent
    /// redelivery is the worker's responsibility (it checks mission status
    /// before calling this); this method assumes it is being told about a
    /// genuinely new result.
    pub async fn handle_mission_result(&self, mission_id: &str, result: MissionResult) -> AppResult<Option<Match>> {
        let mission = self
            .repo
            .get_mission(mission_id)
            .await?
            .ok_or_else(|| AppError::fatal(format!("mission {mission_id} not found when handling result")))?;

        let pair_key = geo::pair_key(&mission.owner_circle_id, &mission.visitor_circle_id);
        let lock_key = format!("mission:inflight:{pair_key}");

        if !result.success {
            self.repo
                .complete_mission(mission_id, MissionStatus::Failed, None, None, result.error.clone())
                .await?;
            self.set_cooldown(&mission.owner_user_id, &mission.visitor_user_id, CooldownType::Notified).await?;
            self.store.delete(&lock_key).await?;
            self.bus.emit(
                Event::new("agent_match.mission_completed", &mission.owner_user_id)
                    .with_related_user(&mission.visitor_user_id)
                    .with_metadata("mission_id", json!(mission_id))
                    .with_metadata("success", json!(false)),
            );
            return Ok(None);
        }

        self.repo
            .complete_mission(mission_id, MissionStatus::Completed, result.transcript.clone(), result.judge_decision.clone(), None)
            .await?;

        if result.match_made {
            let confidence = result
                .judge_decision
                .as_ref()
                .and_then(|d| d.get("confidence"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5);
            let explanation = result
                .judge_decision
                .as_ref()
                .and_then(|d| d.get("summary_text"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());

            let now = Utc::now();
            let m = Match {
                id: uuid::Uuid::new_v4().to_string(),
                primary_user_id: mission.owner_user_id.clone(),
                secondary_user_id: mission.visitor_user_id.clone(),
                primary_circle_id: mission.owner_circle_id.clone(),
                secondary_circle_id: mission.visitor_circle_id.clone(),
                kind: MatchType::Match,
                worth_it_score: confidence,
                status: MatchStatus::PendingAccept,
                explanation_summary: explanation,
                created_at: now,
            };
            let created = self.repo.create_match(m).await?;

            self.set_cooldown(&mission.owner_user_id, &mission.visitor_user_id, CooldownType::Matched).await?;
            self.repo
                .update_collision_status_if(&mission.collision_event_id, &[CollisionStatus::MissionCreated], CollisionStatus::Matched, None)
                .await?;
            self.store.delete(&lock_key).await?;

            self.bus.emit(
                Event::new("match.created", &mission.owner_user_id)
                    .with_related_user(&mission.visitor_user_id)
                    .with_metadata("match_id", json!(created.id))
                    .with_metadata("worth_it_score", json!(created.worth_it_score)),
            );

            if let Err(err) = self
                .notifications
                .notify_successful_interaction(&crate::external::NotificationPayload {
                    user_id: mission.owner_user_id.clone(),
                    related_user_id: mission.visitor_user_id.clone(),
                    summary: created.explanation_summary.clone().unwrap_or_default(),
                })
                .await
            {
                warn!(error = %err, "notification gateway failed after match creation");
            }

            Ok(Some(created))
        } else {
            self.set_cooldown(&mission.owner_user_id, &mission.visitor_user_id, CooldownType::Notified).await?;
            self.store.delete(&lock_key).await?;
            self.bus.emit(
                Event::new("agent_match.mission_completed", &mission.owner_user_id)
                    .with_related_user(&mission.visitor_user_id)
                    .with_metadata("mission_id", json!(mission_id))
                    .with_metadata("success", json!(true)),
            );
            Ok(None)
        }
    }

    // -----------------------------------------------------------------
    // Match accept/decline
    // -----------------------------------------------------------------

    pub async fn accept_match(&self, match_id: &str, acting_user_id: &str) -> AppResult<bool> {
        let m = self.repo.get_match(match_id).await?.ok_or_else(|| AppError::Validation("match not found".into()))?;
        if acting_user_id != m.primary_user_id && acting_user_id != m.secondary_user_id {
            return Err(AppError::PolicyDenial("acting user is not a participant in this match".into()));
        }
        let advanced = self
            .repo
            .update_match_status_if(match_id, &[MatchStatus::PendingAccept], MatchStatus::Active)
            .await?;
        if advanced {
            self.bus.emit(Event::new("match.accepted", &m.primary_user_id).with_related_user(&m.secondary_user_id));
        }
        Ok(advanced)
    }

    pub async fn decline_match(&self, match_id: &str, acting_user_id: &str) -> AppResult<bool> {
        let m = self.repo.get_match(match_id).await?.ok_or_else(|| AppError::Validation("match not found".into()))?;
        if acting_user_id != m.primary_user_id && acting_user_id != m.secondary_user_id {
            return Err(AppError::PolicyDenial("acting user is not a participant in this match".into()));
        }
        let advanced = self
            .repo
            .update_match_status_if(match_id, &[MatchStatus::PendingAccept], MatchStatus::Declined)
            .await?;
        if advanced {
            self.set_cooldown(&m.primary_user_id, &m.secondary_user_id, CooldownType::Declined).await?;
            self.bus.emit(Event::new("match.rejected", &m.primary_user_id).with_related_user(&m.secondary_user_id));
        }
        Ok(advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryRepository;
    use crate::external::stub::*;
    use crate::mission_queue::InMemoryJobStore;
    use crate::store::InMemoryStore;

    async fn build() -> (Arc<AgentMatchService>, InMemoryRepository, Arc<InMemoryJobStore>) {
        let repo = InMemoryRepository::new();
        let repo_dyn: Arc<dyn Repository> = Arc::new(repo.clone());
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let config = Config::from_env();
        let bus = EventBus::disabled();

        let service = Arc::new(AgentMatchService::new(
            repo_dyn,
            store,
            bus,
            config,
            Arc::new(StubAgentRuntime { stop_after_first_turn: true }),
            Arc::new(StubJudge { should_notify: true, confidence: Some(0.8) }),
            Arc::new(RecordingNotificationGateway::default()),
        ));
        let job_store = Arc::new(InMemoryJobStore::new());
        service.attach_job_store(job_store.clone());
        (service, repo, job_store)
    }

    async fn seed_collision(repo: &InMemoryRepository) -> CollisionEvent {
        let now = Utc::now();
        repo.seed_user(User {
            id: "u1".into(),
            contact: "u1@example.com".into(),
            profile: Some(json!({"name": "Alice"})),
            current_lat: Some(1.0),
            current_lon: Some(1.0),
            created_at: now,
            updated_at: now,
        })
        .await;
        repo.seed_user(User {
            id: "u2".into(),
            contact: "u2@example.com".into(),
            profile: Some(json!({"name": "Bob"})),
            current_lat: Some(1.0001),
            current_lon: Some(1.0),
            created_at: now,
            updated_at: now,
        })
        .await;

        let event_id = repo.upsert_collision_event("c1", "c2", "u1", "u2", 10.0, now).await.unwrap();
        repo.update_collision_status_if(&event_id, &[CollisionStatus::Detecting], CollisionStatus::Stable, None).await.unwrap();
        repo.get_collision_event(&event_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn mission_single_flight_only_one_winner() {
        let (service, repo, _jobs) = build().await;
        let collision = seed_collision(&repo).await;

        let (r1, r2) = tokio::join!(
            service.create_mission_for_collision(&collision),
            service.create_mission_for_collision(&collision)
        );

        let results = [r1.unwrap(), r2.unwrap()];
        let created: Vec<_> = results.into_iter().flatten().collect();
        assert_eq!(created.len(), 1);
    }

    #[tokio::test]
    async fn cooldown_blocks_new_mission() {
        let (service, repo, _jobs) = build().await;
        let collision = seed_collision(&repo).await;

        service.set_cooldown("u1", "u2", CooldownType::Notified).await.unwrap();
        let result = service.create_mission_for_collision(&collision).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cooldown_round_trips_and_expires() {
        let (service, _repo, _jobs) = build().await;
        service.set_cooldown("a", "b", CooldownType::Matched).await.unwrap();
        let check = service.check_cooldown("a", "b").await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.cooldown_type, Some(CooldownType::Matched));

        // simulate expiry by writing an already-expired hash directly
        let expired_store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        expired_store
            .hash_set_fields(
                &format!("cooldown:{}", geo::pair_key("a", "b")),
                &[("type", "matched"), ("created_at", "0"), ("expires_at", "1")],
                None,
            )
            .await
            .unwrap();
        let service2 = AgentMatchService::new(
            Arc::new(InMemoryRepository::new()),
            expired_store,
            EventBus::disabled(),
            Config::from_env(),
            Arc::new(StubAgentRuntime { stop_after_first_turn: true }),
            Arc::new(StubJudge { should_notify: true, confidence: None }),
            Arc::new(RecordingNotificationGateway::default()),
        );
        let check2 = service2.check_cooldown("a", "b").await.unwrap();
        assert!(check2.allowed);
    }

    #[tokio::test]
    async fn successful_match_made_result_creates_match_and_sets_matched_cooldown() {
        let (service, repo, _jobs) = build().await;
        let collision = seed_collision(&repo).await;
        let mission = service.create_mission_for_collision(&collision).await.unwrap().unwrap();

        let result = MissionResult {
            success: true,
            match_made: true,
            transcript: Some(json!([{"speaker": "owner", "message": "hi"}])),
            judge_decision: Some(json!({"should_notify": true, "confidence": 0.9, "summary_text": "great chat"})),
            error: None,
        };
        let created = service.handle_mission_result(&mission.id, result).await.unwrap();
        assert!(created.is_some());
        let m = created.unwrap();
        assert_eq!(m.worth_it_score, 0.9);

        let check = service.check_cooldown("u1", "u2").await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.cooldown_type, Some(CooldownType::Matched));
    }

    #[tokio::test]
    async fn failed_mission_sets_notified_cooldown_and_returns_none() {
        let (service, repo, _jobs) = build().await;
        let collision = seed_collision(&repo).await;
        let mission = service.create_mission_for_collision(&collision).await.unwrap().unwrap();

        let result = MissionResult { success: false, match_made: false, transcript: None, judge_decision: None, error: Some("agent timeout".into()) };
        let created = service.handle_mission_result(&mission.id, result).await.unwrap();
        assert!(created.is_none());

        let check = service.check_cooldown("u1", "u2").await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.cooldown_type, Some(CooldownType::Notified));
    }

    #[tokio::test]
    async fn accept_requires_participant() {
        let (service, repo, _jobs) = build().await;
        let collision = seed_collision(&repo).await;
        let mission = service.create_mission_for_collision(&collision).await.unwrap().unwrap();
        let result = MissionResult {
            success: true,
            match_made: true,
            transcript: None,
            judge_decision: Some(json!({"confidence": 0.7})),
            error: None,
        };
        let created = service.handle_mission_result(&mission.id, result).await.unwrap().unwrap();

        let denied = service.accept_match(&created.id, "stranger").await;
        assert!(denied.is_err());

        let accepted = service.accept_match(&created.id, "u1").await.unwrap();
        assert!(accepted);
    }
}

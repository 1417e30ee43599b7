//! Relational repository: the durable store for users, circles, collision
//! events, missions, and matches. `PgRepository` is the production
//! implementation; `InMemoryRepository` is the substitution seam used by
//! tests (design note: "In-memory repositories present in tests").

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::{AppError, AppResult};
use crate::models::*;

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_user(&self, user_id: &str) -> AppResult<Option<User>>;
    async fn update_user_position(&self, user_id: &str, lat: f64, lon: f64, now: DateTime<Utc>) -> AppResult<()>;

    async fn live_circles_for_owner(&self, owner_user_id: &str, now: DateTime<Utc>) -> AppResult<Vec<Circle>>;

    /// Spatial candidate query: circles other than the owner's own, active
    /// and within their time window, whose owner lies within
    /// `search_radius_meters` of `(center_lat, center_lon)`. Returns at
    /// most `limit` results, nearest first.
    async fn find_candidate_circles(
        &self,
        exclude_owner_user_id: &str,
        center_lat: f64,
        center_lon: f64,
        search_radius_meters: f64,
        now: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<CandidateCircle>>;

    async fn get_circle(&self, circle_id: &str) -> AppResult<Option<Circle>>;

    /// Atomic upsert keyed by the unordered `(circle1_id, circle2_id)`
    /// pair. Returns the event's id.
    async fn upsert_collision_event(
        &self,
        circle1_id: &str,
        circle2_id: &str,
        user1_id: &str,
        user2_id: &str,
        distance_meters: f64,
        now: DateTime<Utc>,
    ) -> AppResult<String>;

    async fn get_collision_event(&self, id: &str) -> AppResult<Option<CollisionEvent>>;

    /// Status-gated update: succeeds only if the row's current status is
    /// one of `expected`. Returns `true` if it matched and was updated —
    /// this is the database-level serialization point for status
    /// transitions the concurrency model requires.
    async fn update_collision_status_if(
        &self,
        id: &str,
        expected: &[CollisionStatus],
        new_status: CollisionStatus,
        mission_id: Option<&str>,
    ) -> AppResult<bool>;

    async fn create_mission(&self, mission: InterviewMission) -> AppResult<InterviewMission>;
    async fn get_mission(&self, id: &str) -> AppResult<Option<InterviewMission>>;
    async fn update_mission_status_if(
        &self,
        id: &str,
        expected: &[MissionStatus],
        new_status: MissionStatus,
    ) -> AppResult<bool>;
    async fn complete_mission(
        &self,
        id: &str,
        status: MissionStatus,
        transcript: Option<serde_json::Value>,
        judge_decision: Option<serde_json::Value>,
        failure_reason: Option<String>,
    ) -> AppResult<()>;

    async fn create_match(&self, m: Match) -> AppResult<Match>;
    async fn get_match(&self, id: &str) -> AppResult<Option<Match>>;
    async fn update_match_status_if(&self, id: &str, expected: &[MatchStatus], new_status: MatchStatus) -> AppResult<bool>;

    /// Bulk expiry: collision events older than `cutoff` not already in a
    /// terminal status. Returns the rows that were flipped to `expired` so
    /// the caller can emit one event per row.
    async fn expire_stale_collision_events(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> AppResult<Vec<CollisionEvent>>;

    /// Bulk expiry: matches still `pending_accept` older than `cutoff`.
    /// Returns the rows that were flipped to `expired`.
    async fn expire_stale_matches(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Match>>;
}

// ---------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------

pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let pool = PgPool::connect(database_url).await.map_err(AppError::transient)?;
        Ok(PgRepository { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn get_user(&self, user_id: &str) -> AppResult<Option<User>> {
        sqlx::query_as::<_, User>(r#"SELECT * FROM "user" WHERE id = $1"#)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::transient)
    }

    async fn update_user_position(&self, user_id: &str, lat: f64, lon: f64, now: DateTime<Utc>) -> AppResult<()> {
        sqlx::query(r#"UPDATE "user" SET current_lat = $1, current_lon = $2, updated_at = $3 WHERE id = $4"#)
            .bind(lat)
            .bind(lon)
            .bind(now)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::transient)?;
        Ok(())
    }

    async fn live_circles_for_owner(&self, owner_user_id: &str, now: DateTime<Utc>) -> AppResult<Vec<Circle>> {
        sqlx::query_as::<_, Circle>(
            r#"SELECT * FROM circle WHERE owner_user_id = $1 AND status = 'active' AND start_at <= $2 AND expires_at > $2"#,
        )
        .bind(owner_user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::transient)
    }

    async fn find_candidate_circles(
        &self,
        exclude_owner_user_id: &str,
        center_lat: f64,
        center_lon: f64,
        search_radius_meters: f64,
        now: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<CandidateCircle>> {
        // Cheap bounding-box pre-filter in degrees, then exact haversine
        // distance computed in Rust over the (small) candidate set.
        let lat_delta = search_radius_meters / 111_320.0;
        let lon_delta = search_radius_meters / (111_320.0 * center_lat.to_radians().cos().max(0.0001));

        #[derive(sqlx::FromRow)]
        struct Row {
            id: String,
            owner_user_id: String,
            objective: String,
            radius_meters: f64,
            current_lat: f64,
            current_lon: f64,
        }

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT c.id, c.owner_user_id, c.objective, c.radius_meters, u.current_lat, u.current_lon
            FROM circle c
            JOIN "user" u ON u.id = c.owner_user_id
            WHERE c.owner_user_id <> $1
              AND c.status = 'active'
              AND c.start_at <= $2 AND c.expires_at > $2
              AND u.current_lat BETWEEN $3 AND $4
              AND u.current_lon BETWEEN $5 AND $6
            "#,
        )
        .bind(exclude_owner_user_id)
        .bind(now)
        .bind(center_lat - lat_delta)
        .bind(center_lat + lat_delta)
        .bind(center_lon - lon_delta)
        .bind(center_lon + lon_delta)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::transient)?;

        let mut candidates: Vec<CandidateCircle> = rows
            .into_iter()
            .map(|r| {
                let distance = crate::geo::haversine(center_lat, center_lon, r.current_lat, r.current_lon);
                CandidateCircle {
                    id: r.id,
                    owner_user_id: r.owner_user_id,
                    objective: r.objective,
                    radius_meters: r.radius_meters,
                    distance_meters: distance,
                }
            })
            .filter(|c| c.distance_meters <= search_radius_meters)
            .collect();

        candidates.sort_by(|a, b| a.distance_meters.partial_cmp(&b.distance_meters).unwrap());
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn get_circle(&self, circle_id: &str) -> AppResult<Option<Circle>> {
        sqlx::query_as::<_, Circle>(r#"SELECT * FROM circle WHERE id = $1"#)
            .bind(circle_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::transient)
    }

    async fn upsert_collision_event(
        &self,
        circle1_id: &str,
        circle2_id: &str,
        user1_id: &str,
        user2_id: &str,
        distance_meters: f64,
        now: DateTime<Utc>,
    ) -> AppResult<String> {
        let id: (String,) = sqlx::query_as(
            r#"
            INSERT INTO collision_event
                (id, circle1_id, circle2_id, user1_id, user2_id, distance_meters, first_seen_at, last_seen_at, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, 'detecting', $7)
            ON CONFLICT (circle1_id, circle2_id) DO UPDATE SET
                last_seen_at = EXCLUDED.last_seen_at,
                distance_meters = EXCLUDED.distance_meters
            RETURNING id
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(circle1_id)
        .bind(circle2_id)
        .bind(user1_id)
        .bind(user2_id)
        .bind(distance_meters)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::transient)?;
        Ok(id.0)
    }

    async fn get_collision_event(&self, id: &str) -> AppResult<Option<CollisionEvent>> {
        sqlx::query_as::<_, CollisionEvent>(r#"SELECT * FROM collision_event WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::transient)
    }

    async fn update_collision_status_if(
        &self,
        id: &str,
        expected: &[CollisionStatus],
        new_status: CollisionStatus,
        mission_id: Option<&str>,
    ) -> AppResult<bool> {
        let expected_strs: Vec<String> = expected.iter().map(|s| format!("{s:?}").to_lowercase()).collect();
        let result = sqlx::query(
            r#"UPDATE collision_event SET status = $1, mission_id = COALESCE($2, mission_id) WHERE id = $3 AND status = ANY($4)"#,
        )
        .bind(new_status)
        .bind(mission_id)
        .bind(id)
        .bind(&expected_strs)
        .execute(&self.pool)
        .await
        .map_err(AppError::transient)?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_mission(&self, mission: InterviewMission) -> AppResult<InterviewMission> {
        sqlx::query(
            r#"
            INSERT INTO interview_mission
                (id, owner_user_id, visitor_user_id, owner_circle_id, visitor_circle_id,
                 collision_event_id, status, attempt_number, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            "#,
        )
        .bind(&mission.id)
        .bind(&mission.owner_user_id)
        .bind(&mission.visitor_user_id)
        .bind(&mission.owner_circle_id)
        .bind(&mission.visitor_circle_id)
        .bind(&mission.collision_event_id)
        .bind(mission.status)
        .bind(mission.attempt_number)
        .bind(mission.created_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::transient)?;
        Ok(mission)
    }

    async fn get_mission(&self, id: &str) -> AppResult<Option<InterviewMission>> {
        sqlx::query_as::<_, InterviewMission>(r#"SELECT * FROM interview_mission WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::transient)
    }

    async fn update_mission_status_if(&self, id: &str, expected: &[MissionStatus], new_status: MissionStatus) -> AppResult<bool> {
        let expected_strs: Vec<String> = expected.iter().map(|s| format!("{s:?}").to_lowercase()).collect();
        let result = sqlx::query(r#"UPDATE interview_mission SET status = $1, updated_at = now() WHERE id = $2 AND status = ANY($3)"#)
            .bind(new_status)
            .bind(id)
            .bind(&expected_strs)
            .execute(&self.pool)
            .await
            .map_err(AppError::transient)?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_mission(
        &self,
        id: &str,
        status: MissionStatus,
        transcript: Option<serde_json::Value>,
        judge_decision: Option<serde_json::Value>,
        failure_reason: Option<String>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"UPDATE interview_mission SET status = $1, transcript = $2, judge_decision = $3, failure_reason = $4, updated_at = now() WHERE id = $5"#,
        )
        .bind(status)
        .bind(transcript)
        .bind(judge_decision)
        .bind(failure_reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(AppError::transient)?;
        Ok(())
    }

    async fn create_match(&self, m: Match) -> AppResult<Match> {
        sqlx::query(
            r#"
            INSERT INTO match_row
                (id, primary_user_id, secondary_user_id, primary_circle_id, secondary_circle_id,
                 type, worth_it_score, status, explanation_summary, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&m.id)
        .bind(&m.primary_user_id)
        .bind(&m.secondary_user_id)
        .bind(&m.primary_circle_id)
        .bind(&m.secondary_circle_id)
        .bind(m.kind)
        .bind(m.worth_it_score)
        .bind(m.status)
        .bind(&m.explanation_summary)
        .bind(m.created_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::transient)?;
        Ok(m)
    }

    async fn get_match(&self, id: &str) -> AppResult<Option<Match>> {
        sqlx::query_as::<_, Match>(r#"SELECT * FROM match_row WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::transient)
    }

    async fn update_match_status_if(&self, id: &str, expected: &[MatchStatus], new_status: MatchStatus) -> AppResult<bool> {
        let expected_strs: Vec<String> = expected.iter().map(|s| format!("{s:?}").to_lowercase()).collect();
        let result = sqlx::query(r#"UPDATE match_row SET status = $1 WHERE id = $2 AND status = ANY($3)"#)
            .bind(new_status)
            .bind(id)
            .bind(&expected_strs)
            .execute(&self.pool)
            .await
            .map_err(AppError::transient)?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire_stale_collision_events(&self, cutoff: DateTime<Utc>, _now: DateTime<Utc>) -> AppResult<Vec<CollisionEvent>> {
        let rows: Vec<CollisionEvent> = sqlx::query_as(
            r#"UPDATE collision_event SET status = 'expired' WHERE created_at < $1 AND status NOT IN ('expired', 'matched') RETURNING *"#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::transient)?;
        Ok(rows)
    }

    async fn expire_stale_matches(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Match>> {
        let rows: Vec<Match> =
            sqlx::query_as(r#"UPDATE match_row SET status = 'expired' WHERE status = 'pending_accept' AND created_at < $1 RETURNING *"#)
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await
                .map_err(AppError::transient)?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------
// In-memory test double
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemoryTables {
    users: HashMap<String, User>,
    circles: HashMap<String, Circle>,
    collision_events: HashMap<String, CollisionEvent>,
    collision_pair_index: HashMap<(String, String), String>,
    missions: HashMap<String, InterviewMission>,
    matches: HashMap<String, Match>,
}

#[derive(Clone, Default)]
pub struct InMemoryRepository {
    tables: Arc<RwLock<MemoryTables>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_user(&self, user: User) {
        self.tables.write().await.users.insert(user.id.clone(), user);
    }

    pub async fn seed_circle(&self, circle: Circle) {
        self.tables.write().await.circles.insert(circle.id.clone(), circle);
    }

    /// Test convenience accessor: looks a collision event up by its
    /// unordered circle pair rather than its generated id.
    pub async fn get_collision_event_by_pair(&self, circle_a: &str, circle_b: &str) -> Option<CollisionEvent> {
        let (c1, c2) = crate::geo::canonical_order(circle_a, circle_b);
        let tables = self.tables.read().await;
        let id = tables.collision_pair_index.get(&(c1.to_string(), c2.to_string()))?;
        tables.collision_events.get(id).cloned()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_user(&self, user_id: &str) -> AppResult<Option<User>> {
        Ok(self.tables.read().await.users.get(user_id).cloned())
    }

    async fn update_user_position(&self, user_id: &str, lat: f64, lon: f64, now: DateTime<Utc>) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(user) = tables.users.get_mut(user_id) {
            user.current_lat = Some(lat);
            user.current_lon = Some(lon);
            user.updated_at = now;
        }
        Ok(())
    }

    async fn live_circles_for_owner(&self, owner_user_id: &str, now: DateTime<Utc>) -> AppResult<Vec<Circle>> {
        let tables = self.tables.read().await;
        Ok(tables
            .circles
            .values()
            .filter(|c| c.owner_user_id == owner_user_id && c.is_live(now))
            .cloned()
            .collect())
    }

    async fn find_candidate_circles(
        &self,
        exclude_owner_user_id: &str,
        center_lat: f64,
        center_lon: f64,
        search_radius_meters: f64,
        now: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<CandidateCircle>> {
        let tables = self.tables.read().await;
        let mut candidates: Vec<CandidateCircle> = tables
            .circles
            .values()
            .filter(|c| c.owner_user_id != exclude_owner_user_id && c.is_live(now))
            .filter_map(|c| {
                let owner = tables.users.get(&c.owner_user_id)?;
                let (lat, lon) = (owner.current_lat?, owner.current_lon?);
                let distance = crate::geo::haversine(center_lat, center_lon, lat, lon);
                if distance <= search_radius_meters {
                    Some(CandidateCircle {
                        id: c.id.clone(),
                        owner_user_id: c.owner_user_id.clone(),
                        objective: c.objective.clone(),
                        radius_meters: c.radius_meters,
                        distance_meters: distance,
                    })
                } else {
                    None
                }
            })
            .collect();
        candidates.sort_by(|a, b| a.distance_meters.partial_cmp(&b.distance_meters).unwrap());
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn get_circle(&self, circle_id: &str) -> AppResult<Option<Circle>> {
        Ok(self.tables.read().await.circles.get(circle_id).cloned())
    }

    async fn upsert_collision_event(
        &self,
        circle1_id: &str,
        circle2_id: &str,
        user1_id: &str,
        user2_id: &str,
        distance_meters: f64,
        now: DateTime<Utc>,
    ) -> AppResult<String> {
        let (c1, c2) = crate::geo::canonical_order(circle1_id, circle2_id);
        let key = (c1.to_string(), c2.to_string());
        let mut tables = self.tables.write().await;
        if let Some(existing_id) = tables.collision_pair_index.get(&key).cloned() {
            if let Some(event) = tables.collision_events.get_mut(&existing_id) {
                event.last_seen_at = now;
                event.distance_meters = distance_meters;
            }
            return Ok(existing_id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let event = CollisionEvent {
            id: id.clone(),
            circle1_id: c1.to_string(),
            circle2_id: c2.to_string(),
            user1_id: user1_id.to_string(),
            user2_id: user2_id.to_string(),
            distance_meters,
            first_seen_at: now,
            last_seen_at: now,
            status: CollisionStatus::Detecting,
            mission_id: None,
            created_at: now,
        };
        tables.collision_pair_index.insert(key, id.clone());
        tables.collision_events.insert(id.clone(), event);
        Ok(id)
    }

    async fn get_collision_event(&self, id: &str) -> AppResult<Option<CollisionEvent>> {
        Ok(self.tables.read().await.collision_events.get(id).cloned())
    }

    async fn update_collision_status_if(
        &self,
        id: &str,
        expected: &[CollisionStatus],
        new_status: CollisionStatus,
        mission_id: Option<&str>,
    ) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(event) = tables.collision_events.get_mut(id) else {
            return Ok(false);
        };
        if !expected.contains(&event.status) {
            return Ok(false);
        }
        event.status = new_status;
        if let Some(mid) = mission_id {
            event.mission_id = Some(mid.to_string());
        }
        Ok(true)
    }

    async fn create_mission(&self, mission: InterviewMission) -> AppResult<InterviewMission> {
        let mut tables = self.tables.write().await;
        tables.missions.insert(mission.id.clone(), mission.clone());
        Ok(mission)
    }

    async fn get_mission(&self, id: &str) -> AppResult<Option<InterviewMission>> {
        Ok(self.tables.read().await.missions.get(id).cloned())
    }

    async fn update_mission_status_if(&self, id: &str, expected: &[MissionStatus], new_status: MissionStatus) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(mission) = tables.missions.get_mut(id) else {
            return Ok(false);
        };
        if !expected.contains(&mission.status) {
            return Ok(false);
        }
        mission.status = new_status;
        Ok(true)
    }

    async fn complete_mission(
        &self,
        id: &str,
        status: MissionStatus,
        transcript: Option<serde_json::Value>,
        judge_decision: Option<serde_json::Value>,
        failure_reason: Option<String>,
    ) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(mission) = tables.missions.get_mut(id) {
            mission.status = status;
            mission.transcript = transcript;
            mission.judge_decision = judge_decision;
            mission.failure_reason = failure_reason;
        }
        Ok(())
    }

    async fn create_match(&self, m: Match) -> AppResult<Match> {
        let mut tables = self.tables.write().await;
        tables.matches.insert(m.id.clone(), m.clone());
        Ok(m)
    }

    async fn get_match(&self, id: &str) -> AppResult<Option<Match>> {
        Ok(self.tables.read().await.matches.get(id).cloned())
    }

    async fn update_match_status_if(&self, id: &str, expected: &[MatchStatus], new_status: MatchStatus) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(m) = tables.matches.get_mut(id) else {
            return Ok(false);
        };
        if !expected.contains(&m.status) {
            return Ok(false);
        }
        m.status = new_status;
        Ok(true)
    }

    async fn expire_stale_collision_events(&self, cutoff: DateTime<Utc>, _now: DateTime<Utc>) -> AppResult<Vec<CollisionEvent>> {
        let mut tables = self.tables.write().await;
        let mut expired = Vec::new();
        for event in tables.collision_events.values_mut() {
            if event.created_at < cutoff && !matches!(event.status, CollisionStatus::Expired | CollisionStatus::Matched) {
                event.status = CollisionStatus::Expired;
                expired.push(event.clone());
            }
        }
        Ok(expired)
    }

    async fn expire_stale_matches(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<Match>> {
        let mut tables = self.tables.write().await;
        let mut expired = Vec::new();
        for m in tables.matches.values_mut() {
            if m.status == MatchStatus::PendingAccept && m.created_at < cutoff {
                m.status = MatchStatus::Expired;
                expired.push(m.clone());
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[tokio::test]
    async fn upsert_collision_event_is_idempotent_on_pair() {
        let repo = InMemoryRepository::new();
        let t0 = now();
        let id1 = repo.upsert_collision_event("c1", "c2", "u1", "u2", 50.0, t0).await.unwrap();
        let id2 = repo.upsert_collision_event("c2", "c1", "u2", "u1", 40.0, t0 + ChronoDuration::seconds(1)).await.unwrap();
        assert_eq!(id1, id2);
        let event = repo.get_collision_event(&id1).await.unwrap().unwrap();
        assert_eq!(event.distance_meters, 40.0);
    }

    #[tokio::test]
    async fn collision_status_cas_rejects_wrong_expected() {
        let repo = InMemoryRepository::new();
        let t0 = now();
        let id = repo.upsert_collision_event("c1", "c2", "u1", "u2", 50.0, t0).await.unwrap();
        let ok = repo
            .update_collision_status_if(&id, &[CollisionStatus::Stable], CollisionStatus::MissionCreated, None)
            .await
            .unwrap();
        assert!(!ok);
        let ok = repo
            .update_collision_status_if(&id, &[CollisionStatus::Detecting], CollisionStatus::Stable, None)
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn expire_stale_matches_only_touches_pending_accept() {
        let repo = InMemoryRepository::new();
        let old = now() - ChronoDuration::hours(30);
        let m = Match {
            id: "m1".into(),
            primary_user_id: "u1".into(),
            secondary_user_id: "u2".into(),
            primary_circle_id: "c1".into(),
            secondary_circle_id: "c2".into(),
            kind: MatchType::Match,
            worth_it_score: 0.8,
            status: MatchStatus::PendingAccept,
            explanation_summary: None,
            created_at: old,
        };
        repo.create_match(m).await.unwrap();
        let cutoff = now() - ChronoDuration::hours(24);
        let expired = repo.expire_stale_matches(cutoff).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(repo.get_match("m1").await.unwrap().unwrap().status, MatchStatus::Expired);
    }
}

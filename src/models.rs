//! Domain types: `User`, `Circle`, `CollisionEvent`, `InterviewMission`,
//! `Match`, and their status enums. Every storage-facing type derives
//! `sqlx::FromRow` alongside `serde`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub contact: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<serde_json::Value>,
    pub current_lat: Option<f64>,
    pub current_lon: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CircleStatus {
    Active,
    Paused,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Circle {
    pub id: String,
    pub owner_user_id: String,
    pub objective: String,
    pub radius_meters: f64,
    pub start_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: CircleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Circle {
    /// A circle is live when active and `start_at <= now < expires_at`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == CircleStatus::Active && self.start_at <= now && now < self.expires_at
    }
}

/// A peer circle found by the spatial candidate query, already carrying the
/// distance from the query center.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CandidateCircle {
    pub id: String,
    pub owner_user_id: String,
    pub objective: String,
    pub radius_meters: f64,
    pub distance_meters: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CollisionStatus {
    Detecting,
    Stable,
    MissionCreated,
    Matched,
    Expired,
}

impl CollisionStatus {
    /// The declared monotone order: `detecting -> stable -> mission_created
    /// -> {matched, expired}`. Used to reject regressions.
    fn rank(self) -> u8 {
        match self {
            CollisionStatus::Detecting => 0,
            CollisionStatus::Stable => 1,
            CollisionStatus::MissionCreated => 2,
            CollisionStatus::Matched => 3,
            CollisionStatus::Expired => 3,
        }
    }

    /// Whether moving from `self` to `next` is a forward (or same) step.
    /// A no-op transition (`self == next`) is allowed; any decrease is not.
    pub fn can_advance_to(self, next: CollisionStatus) -> bool {
        next.rank() >= self.rank()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CollisionEvent {
    pub id: String,
    pub circle1_id: String,
    pub circle2_id: String,
    pub user1_id: String,
    pub user2_id: String,
    pub distance_meters: f64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: CollisionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InterviewMission {
    pub id: String,
    pub owner_user_id: String,
    pub visitor_user_id: String,
    pub owner_circle_id: String,
    pub visitor_circle_id: String,
    pub collision_event_id: String,
    pub status: MissionStatus,
    pub attempt_number: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge_decision: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Match,
    SoftMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    PendingAccept,
    Active,
    Declined,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Match {
    pub id: String,
    pub primary_user_id: String,
    pub secondary_user_id: String,
    pub primary_circle_id: String,
    pub secondary_circle_id: String,
    #[serde(rename = "type")]
    pub kind: MatchType,
    pub worth_it_score: f64,
    pub status: MatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation_summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownType {
    Notified,
    Matched,
    Declined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cooldown {
    #[serde(rename = "type")]
    pub kind: CooldownType,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_regression_is_rejected() {
        assert!(!CollisionStatus::Stable.can_advance_to(CollisionStatus::Detecting));
        assert!(CollisionStatus::Detecting.can_advance_to(CollisionStatus::Stable));
    }

    #[test]
    fn same_status_transition_is_a_no_op_allowed() {
        assert!(CollisionStatus::Stable.can_advance_to(CollisionStatus::Stable));
    }

    #[test]
    fn terminal_states_are_siblings_not_ordered() {
        // matched and expired are both terminal; neither regresses into the
        // other from mission_created's perspective, both count as forward.
        assert!(CollisionStatus::MissionCreated.can_advance_to(CollisionStatus::Matched));
        assert!(CollisionStatus::MissionCreated.can_advance_to(CollisionStatus::Expired));
    }

    #[test]
    fn circle_is_live_only_within_window() {
        let now = Utc::now();
        let circle = Circle {
            id: "c1".into(),
            owner_user_id: "u1".into(),
            objective: "coffee".into(),
            radius_meters: 100.0,
            start_at: now - chrono::Duration::minutes(5),
            expires_at: now + chrono::Duration::minutes(5),
            status: CircleStatus::Active,
            created_at: now,
            updated_at: now,
        };
        assert!(circle.is_live(now));

        let mut paused = circle.clone();
        paused.status = CircleStatus::Paused;
        assert!(!paused.is_live(now));

        let mut not_started = circle.clone();
        not_started.start_at = now + chrono::Duration::minutes(1);
        assert!(!not_started.is_live(now));
    }
}

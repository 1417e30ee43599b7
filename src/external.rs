//! External collaborator boundaries: the agent runtime, the judge, and the
//! notification gateway. This crate depends only on these trait shapes;
//! the real vendor clients live outside the collision-to-match core.
//! Grounds on the pack's reqwest-backed external-call shape, reframed
//! behind a trait for testability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnInputs {
    pub owner_objective: String,
    pub transcript_so_far: Vec<TranscriptLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub speaker: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub as_user_message: String,
    #[serde(default)]
    pub stop_suggested: bool,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run_owner_turn(&self, inputs: &TurnInputs) -> AppResult<TurnResult>;
    async fn run_visitor_turn(&self, inputs: &TurnInputs) -> AppResult<TurnResult>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeInputs {
    pub owner_objective: String,
    pub transcript: Vec<TranscriptLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeDecision {
    pub should_notify: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate(&self, inputs: &JudgeInputs) -> AppResult<JudgeDecision>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub user_id: String,
    pub related_user_id: String,
    pub summary: String,
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify_successful_interaction(&self, payload: &NotificationPayload) -> AppResult<()>;
}

/// An HTTP-backed agent runtime that calls out to an externally hosted
/// vendor endpoint. The endpoint contract is opaque to this crate; only the
/// request/response shape matters here.
pub struct HttpAgentRuntime {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentRuntime {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpAgentRuntime { client: reqwest::Client::new(), base_url: base_url.into() }
    }

    async fn run_turn(&self, path: &str, inputs: &TurnInputs) -> AppResult<TurnResult> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .post(&url)
            .json(inputs)
            .send()
            .await
            .map_err(crate::error::AppError::external)?;
        response
            .json::<TurnResult>()
            .await
            .map_err(crate::error::AppError::external)
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn run_owner_turn(&self, inputs: &TurnInputs) -> AppResult<TurnResult> {
        self.run_turn("owner-turn", inputs).await
    }

    async fn run_visitor_turn(&self, inputs: &TurnInputs) -> AppResult<TurnResult> {
        self.run_turn("visitor-turn", inputs).await
    }
}

pub struct HttpJudge {
    client: reqwest::Client,
    base_url: String,
}

impl HttpJudge {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpJudge { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait]
impl Judge for HttpJudge {
    async fn evaluate(&self, inputs: &JudgeInputs) -> AppResult<JudgeDecision> {
        let url = format!("{}/evaluate", self.base_url.trim_end_matches('/'));
        let response = self.client.post(&url).json(inputs).send().await.map_err(crate::error::AppError::external)?;
        response.json::<JudgeDecision>().await.map_err(crate::error::AppError::external)
    }
}

pub struct HttpNotificationGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNotificationGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpNotificationGateway { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait]
impl NotificationGateway for HttpNotificationGateway {
    async fn notify_successful_interaction(&self, payload: &NotificationPayload) -> AppResult<()> {
        let url = format!("{}/notify", self.base_url.trim_end_matches('/'));
        self.client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(crate::error::AppError::external)?;
        Ok(())
    }
}

/// Deterministic stub collaborators for tests: the agent runtime always
/// suggests stopping after one turn, the judge always notifies, and the
/// notification gateway records calls instead of performing I/O.
pub mod stub {
    use super::*;
    use tokio::sync::Mutex;

    pub struct StubAgentRuntime {
        pub stop_after_first_turn: bool,
    }

    #[async_trait]
    impl AgentRuntime for StubAgentRuntime {
        async fn run_owner_turn(&self, _inputs: &TurnInputs) -> AppResult<TurnResult> {
            Ok(TurnResult { as_user_message: "Hi, nice to meet you.".into(), stop_suggested: self.stop_after_first_turn })
        }

        async fn run_visitor_turn(&self, _inputs: &TurnInputs) -> AppResult<TurnResult> {
            Ok(TurnResult { as_user_message: "Likewise!".into(), stop_suggested: self.stop_after_first_turn })
        }
    }

    pub struct StubJudge {
        pub should_notify: bool,
        pub confidence: Option<f64>,
    }

    #[async_trait]
    impl Judge for StubJudge {
        async fn evaluate(&self, _inputs: &JudgeInputs) -> AppResult<JudgeDecision> {
            Ok(JudgeDecision {
                should_notify: self.should_notify,
                notification_text: self.should_notify.then(|| "You two might hit it off.".to_string()),
                summary_text: Some("A short, friendly exchange.".to_string()),
                confidence: self.confidence,
            })
        }
    }

    #[derive(Default)]
    pub struct RecordingNotificationGateway {
        pub sent: Mutex<Vec<NotificationPayload>>,
    }

    #[async_trait]
    impl NotificationGateway for RecordingNotificationGateway {
        async fn notify_successful_interaction(&self, payload: &NotificationPayload) -> AppResult<()> {
            self.sent.lock().await.push(payload.clone());
            Ok(())
        }
    }
}

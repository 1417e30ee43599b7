//! Durable at-least-once mission dispatch. The job table lives in the same
//! relational store as missions (see the resolved open question in the
//! design ledger) so job state and mission state can never diverge. Worker
//! concurrency is a bounded set of `tokio::spawn` tasks started from the
//! process entrypoint.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agent_match::{AgentMatchService, MissionResult};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::external::{TranscriptLine, TurnInputs};
use crate::models::MissionStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub mission_id: String,
    pub owner_user_id: String,
    pub visitor_user_id: String,
    pub owner_profile: Option<serde_json::Value>,
    pub visitor_profile: Option<serde_json::Value>,
    pub owner_circle: String,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_id: i64,
    pub payload: JobPayload,
    pub attempt: i32,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueues a job keyed by the mission id (the idempotency key): a
    /// duplicate enqueue for the same mission is a no-op.
    async fn enqueue(&self, payload: JobPayload) -> AppResult<()>;

    /// Claims one ready job for processing, if any, marking it as leased.
    async fn claim_next(&self) -> AppResult<Option<ClaimedJob>>;

    async fn mark_done(&self, job_id: i64) -> AppResult<()>;

    /// Records a failed attempt. If `attempt < max_attempts`, reschedules
    /// after an exponential backoff from `backoff_base`; otherwise marks
    /// the job dead (the caller is still responsible for marking the
    /// mission itself `failed`).
    async fn mark_failed(&self, job_id: i64, attempt: i32, max_attempts: u32, backoff_base: Duration) -> AppResult<()>;
}

// ---------------------------------------------------------------------
// Postgres-backed queue
// ---------------------------------------------------------------------

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        PgJobStore { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, payload: JobPayload) -> AppResult<()> {
        let payload_json = serde_json::to_value(&payload).map_err(AppError::transient)?;
        sqlx::query(
            r#"
            INSERT INTO mission_job (mission_id, payload, status, attempt, available_at, created_at)
            VALUES ($1, $2, 'ready', 0, now(), now())
            ON CONFLICT (mission_id) DO NOTHING
            "#,
        )
        .bind(&payload.mission_id)
        .bind(payload_json)
        .execute(&self.pool)
        .await
        .map_err(AppError::transient)?;
        Ok(())
    }

    async fn claim_next(&self) -> AppResult<Option<ClaimedJob>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            id: i64,
            payload: serde_json::Value,
            attempt: i32,
        }

        let mut tx = self.pool.begin().await.map_err(AppError::transient)?;
        let row: Option<Row> = sqlx::query_as(
            r#"
            SELECT id, payload, attempt FROM mission_job
            WHERE status = 'ready' AND available_at <= now()
            ORDER BY available_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::transient)?;

        let Some(row) = row else {
            tx.commit().await.map_err(AppError::transient)?;
            return Ok(None);
        };

        sqlx::query(r#"UPDATE mission_job SET status = 'leased' WHERE id = $1"#)
            .bind(row.id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::transient)?;
        tx.commit().await.map_err(AppError::transient)?;

        let payload: JobPayload = serde_json::from_value(row.payload).map_err(AppError::transient)?;
        Ok(Some(ClaimedJob { job_id: row.id, payload, attempt: row.attempt }))
    }

    async fn mark_done(&self, job_id: i64) -> AppResult<()> {
        sqlx::query(r#"UPDATE mission_job SET status = 'done' WHERE id = $1"#)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::transient)?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: i64, attempt: i32, max_attempts: u32, backoff_base: Duration) -> AppResult<()> {
        let next_attempt = attempt + 1;
        if next_attempt as u32 >= max_attempts {
            sqlx::query(r#"UPDATE mission_job SET status = 'dead', attempt = $1 WHERE id = $2"#)
                .bind(next_attempt)
                .bind(job_id)
                .execute(&self.pool)
                .await
                .map_err(AppError::transient)?;
        } else {
            let backoff_secs = backoff_base.as_secs_f64() * 2f64.powi(attempt);
            sqlx::query(
                r#"UPDATE mission_job SET status = 'ready', attempt = $1, available_at = now() + ($2 || ' seconds')::interval WHERE id = $3"#,
            )
            .bind(next_attempt)
            .bind(backoff_secs.to_string())
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::transient)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// In-memory test double
// ---------------------------------------------------------------------

struct MemoryJob {
    job_id: i64,
    payload: JobPayload,
    attempt: i32,
    available_at: DateTime<Utc>,
    leased: bool,
}

pub struct InMemoryJobStore {
    jobs: Mutex<VecDeque<MemoryJob>>,
    next_id: std::sync::atomic::AtomicI64,
    enqueued_missions: Mutex<std::collections::HashSet<String>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        InMemoryJobStore {
            jobs: Mutex::new(VecDeque::new()),
            next_id: std::sync::atomic::AtomicI64::new(1),
            enqueued_missions: Mutex::new(std::collections::HashSet::new()),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, payload: JobPayload) -> AppResult<()> {
        let mut seen = self.enqueued_missions.lock().await;
        if !seen.insert(payload.mission_id.clone()) {
            return Ok(()); // duplicate enqueue for the same mission id, no-op
        }
        let job_id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.jobs.lock().await.push_back(MemoryJob { job_id, payload, attempt: 0, available_at: Utc::now(), leased: false });
        Ok(())
    }

    async fn claim_next(&self) -> AppResult<Option<ClaimedJob>> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        for job in jobs.iter_mut() {
            if !job.leased && job.available_at <= now {
                job.leased = true;
                return Ok(Some(ClaimedJob { job_id: job.job_id, payload: job.payload.clone(), attempt: job.attempt }));
            }
        }
        Ok(None)
    }

    async fn mark_done(&self, job_id: i64) -> AppResult<()> {
        self.jobs.lock().await.retain(|j| j.job_id != job_id);
        Ok(())
    }

    async fn mark_failed(&self, job_id: i64, attempt: i32, max_attempts: u32, backoff_base: Duration) -> AppResult<()> {
        let mut jobs = self.jobs.lock().await;
        let next_attempt = attempt + 1;
        if next_attempt as u32 >= max_attempts {
            jobs.retain(|j| j.job_id != job_id);
            return Ok(());
        }
        if let Some(job) = jobs.iter_mut().find(|j| j.job_id == job_id) {
            job.leased = false;
            job.attempt = next_attempt;
            let backoff_secs = backoff_base.as_secs_f64() * 2f64.powi(attempt);
            job.available_at = Utc::now() + chrono::Duration::milliseconds((backoff_secs * 1000.0) as i64);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------

pub struct MissionWorker {
    job_store: Arc<dyn JobStore>,
    agent_match: Arc<AgentMatchService>,
    config: Config,
}

impl MissionWorker {
    pub fn new(job_store: Arc<dyn JobStore>, agent_match: Arc<AgentMatchService>, config: Config) -> Self {
        MissionWorker { job_store, agent_match, config }
    }

    /// Spawns `mission_worker_concurrency` poller tasks. Returns their
    /// join handles so callers can await shutdown if needed; in normal
    /// operation these run for the lifetime of the process.
    pub fn spawn_pool(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let concurrency = self.config.mission_worker_concurrency.max(1);
        (0..concurrency)
            .map(|i| {
                let worker = self.clone();
                tokio::spawn(async move { worker.poll_loop(i).await })
            })
            .collect()
    }

    async fn poll_loop(&self, worker_index: usize) {
        loop {
            match self.job_store.claim_next().await {
                Ok(Some(job)) => {
                    if let Err(err) = self.process_job(job).await {
                        warn!(worker_index, error = %err, "mission job processing error");
                    }
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(250)).await,
                Err(err) => {
                    warn!(worker_index, error = %err, "failed to claim mission job");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn process_job(&self, job: ClaimedJob) -> AppResult<()> {
        // Stalled-job redelivery safety: a mission already in a terminal
        // status has already been handled by a prior (possibly crashed)
        // attempt, so this delivery just acknowledges without re-running.
        if let Some(mission) = self.agent_match_mission(&job.payload.mission_id).await? {
            if matches!(mission.status, MissionStatus::Completed | MissionStatus::Failed) {
                self.job_store.mark_done(job.job_id).await?;
                return Ok(());
            }
        }

        if !self.agent_match.mark_mission_running(&job.payload.mission_id).await? {
            warn!(mission_id = %job.payload.mission_id, "mission was not in pending status, skipping redundant run");
            self.job_store.mark_done(job.job_id).await?;
            return Ok(());
        }

        match self.run_interview(&job.payload).await {
            Ok(result) => {
                self.agent_match.handle_mission_result(&job.payload.mission_id, result).await?;
                self.job_store.mark_done(job.job_id).await?;
            }
            Err(err) => {
                warn!(mission_id = %job.payload.mission_id, attempt = job.attempt, error = %err, "interview attempt failed");
                let max_attempts = self.config.mission_max_attempts;
                if (job.attempt + 1) as u32 >= max_attempts {
                    self.agent_match
                        .handle_mission_result(
                            &job.payload.mission_id,
                            MissionResult { success: false, match_made: false, transcript: None, judge_decision: None, error: Some(err.to_string()) },
                        )
                        .await?;
                    self.job_store.mark_done(job.job_id).await?;
                } else {
                    self.job_store
                        .mark_failed(job.job_id, job.attempt, max_attempts, Duration::from_millis(self.config.mission_retry_backoff_base_ms))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn agent_match_mission(&self, mission_id: &str) -> AppResult<Option<crate::models::InterviewMission>> {
        // The worker only needs read access here; it goes through the
        // repository the service already holds rather than duplicating a
        // connection.
        self.agent_match.peek_mission(mission_id).await
    }

    /// Runs up to `max_owner_turns` owner/visitor turn pairs, stopping
    /// early if either side suggests stopping, then asks the judge to
    /// evaluate the resulting transcript.
    async fn run_interview(&self, payload: &JobPayload) -> AppResult<MissionResult> {
        let owner_objective = payload
            .context
            .get("collision_event_id")
            .map(|_| "meet nearby".to_string())
            .unwrap_or_else(|| "meet nearby".to_string());

        let mut transcript: Vec<TranscriptLine> = Vec::new();
        let mut stop = false;

        for _ in 0..self.config.max_owner_turns {
            if stop {
                break;
            }
            let inputs = TurnInputs { owner_objective: owner_objective.clone(), transcript_so_far: transcript.clone() };
            let owner_turn = self.agent_match.agent_runtime().run_owner_turn(&inputs).await?;
            transcript.push(TranscriptLine { speaker: "owner".into(), message: owner_turn.as_user_message.clone() });
            if owner_turn.stop_suggested {
                stop = true;
            }

            if !stop {
                let inputs = TurnInputs { owner_objective: owner_objective.clone(), transcript_so_far: transcript.clone() };
                let visitor_turn = self.agent_match.agent_runtime().run_visitor_turn(&inputs).await?;
                transcript.push(TranscriptLine { speaker: "visitor".into(), message: visitor_turn.as_user_message.clone() });
                if visitor_turn.stop_suggested {
                    stop = true;
                }
            }
        }

        let decision = self
            .agent_match
            .judge()
            .evaluate(&crate::external::JudgeInputs { owner_objective, transcript: transcript.clone() })
            .await?;

        info!(mission_id = %payload.mission_id, should_notify = decision.should_notify, "interview complete");

        let transcript_json = serde_json::to_value(&transcript).map_err(AppError::transient)?;
        let decision_json = serde_json::to_value(&decision).map_err(AppError::transient)?;

        Ok(MissionResult {
            success: true,
            match_made: decision.should_notify,
            transcript: Some(transcript_json),
            judge_decision: Some(decision_json),
            error: None,
        })
    }
}

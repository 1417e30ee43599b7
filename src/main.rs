use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::routing::get;
use axum::Router;
use serde_json::json;
use tracing::info;

use collision_match_core::agent_match::AgentMatchService;
use collision_match_core::background::{run_expiry_sweeper, run_stability_sweeper};
use collision_match_core::collision::CollisionDetector;
use collision_match_core::config::Config;
use collision_match_core::db::{PgRepository, Repository};
use collision_match_core::event_bus::EventBus;
use collision_match_core::external::{HttpAgentRuntime, HttpJudge, HttpNotificationGateway};
use collision_match_core::mission_queue::{MissionWorker, PgJobStore};
use collision_match_core::store::{KvStore, RedisStore};
use collision_match_core::telemetry;

static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

async fn health_check() -> axum::Json<serde_json::Value> {
    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;
    let uptime_ms = now_ms.saturating_sub(STARTUP_MS.load(Ordering::Relaxed));
    axum::Json(json!({ "status": "ok", "uptime_ms": uptime_ms }))
}

async fn time_sync() -> axum::Json<serde_json::Value> {
    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;
    axum::Json(json!({ "server_time_ms": now_ms }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;
    STARTUP_MS.store(now_ms, Ordering::Relaxed);

    let config = Config::from_env();

    info!("connecting to relational store");
    let pg_repo = PgRepository::connect(&config.database_url).await?;
    let pg_pool = pg_repo.pool().clone();
    let repo: Arc<dyn Repository> = Arc::new(pg_repo);

    info!("connecting to kv/stream store");
    let store: Arc<dyn KvStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);

    let event_bus_enabled = std::env::var("EVENT_BUS_ENABLED").map(|v| v != "false").unwrap_or(true);
    let bus = EventBus::start(store.clone(), &config, event_bus_enabled);

    let agent_runtime_url = std::env::var("AGENT_RUNTIME_URL").unwrap_or_else(|_| "http://localhost:9001".to_string());
    let judge_url = std::env::var("JUDGE_URL").unwrap_or_else(|_| "http://localhost:9002".to_string());
    let notification_url = std::env::var("NOTIFICATION_GATEWAY_URL").unwrap_or_else(|_| "http://localhost:9003".to_string());

    let agent_match = Arc::new(AgentMatchService::new(
        repo.clone(),
        store.clone(),
        bus.clone(),
        config.clone(),
        Arc::new(HttpAgentRuntime::new(agent_runtime_url)),
        Arc::new(HttpJudge::new(judge_url)),
        Arc::new(HttpNotificationGateway::new(notification_url)),
    ));

    let job_store = Arc::new(PgJobStore::new(pg_pool));
    agent_match.attach_job_store(job_store.clone());

    let detector = Arc::new(CollisionDetector::new(repo.clone(), store.clone(), bus.clone(), config.clone(), agent_match.clone()));

    // `LocationService` is the entrypoint location-ingestion callers (outside
    // this core, per the HTTP-routing non-goal) construct directly; nothing
    // in this binary drives it.
    tokio::spawn(run_stability_sweeper(detector.clone(), config.clone()));
    tokio::spawn(run_expiry_sweeper(repo.clone(), bus.clone(), config.clone()));

    let worker = Arc::new(MissionWorker::new(job_store, agent_match.clone(), config.clone()));
    let _worker_handles = worker.spawn_pool();

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/sync", get(time_sync));

    let bind_addr = config.http_bind_addr.clone();
    info!(bind_addr = %bind_addr, "starting ops http surface");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

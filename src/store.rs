//! Typed KV/stream store adapter. Grounds on the in-process, per-key
//! admission-state pattern the ingestion server keeps in a concurrent map,
//! extended here with a real Redis-backed implementation behind the same
//! trait so the production and test paths share one contract.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::error::{AppError, AppResult};

/// Hash, string, sorted-set, and stream operations needed by the pipeline.
/// Transport failures surface as `AppError::Transient`; a missing key is a
/// plain `None`/empty return, never conflated with an error.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn hash_get_all(&self, key: &str) -> AppResult<Option<HashMap<String, String>>>;
    async fn hash_set_fields(&self, key: &str, fields: &[(&str, &str)], ttl: Option<Duration>) -> AppResult<()>;
    async fn hash_set_field(&self, key: &str, field: &str, value: &str) -> AppResult<()>;
    async fn hash_delete(&self, key: &str) -> AppResult<()>;

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool>;
    async fn get_string(&self, key: &str) -> AppResult<Option<String>>;
    async fn delete(&self, key: &str) -> AppResult<()>;
    async fn set_ttl(&self, key: &str, ttl: Duration) -> AppResult<()>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> AppResult<()>;
    async fn zrange_by_score(&self, key: &str, max_score: f64, limit: usize) -> AppResult<Vec<String>>;
    async fn zrem(&self, key: &str, member: &str) -> AppResult<()>;

    async fn xadd(&self, stream: &str, fields: &[(&str, &str)], maxlen: usize) -> AppResult<()>;
}

// ---------------------------------------------------------------------
// Redis-backed implementation
// ---------------------------------------------------------------------

pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let client = redis::Client::open(url).map_err(AppError::transient)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(AppError::transient)?;
        Ok(RedisStore { manager })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn hash_get_all(&self, key: &str) -> AppResult<Option<HashMap<String, String>>> {
        let mut conn = self.manager.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await.map_err(AppError::transient)?;
        if map.is_empty() {
            Ok(None)
        } else {
            Ok(Some(map))
        }
    }

    async fn hash_set_fields(&self, key: &str, fields: &[(&str, &str)], ttl: Option<Duration>) -> AppResult<()> {
        let mut conn = self.manager.clone();
        let owned: Vec<(String, String)> = fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        conn.hset_multiple::<_, _, _, ()>(key, &owned).await.map_err(AppError::transient)?;
        if let Some(ttl) = ttl {
            conn.expire::<_, ()>(key, ttl.as_secs() as i64).await.map_err(AppError::transient)?;
        }
        Ok(())
    }

    async fn hash_set_field(&self, key: &str, field: &str, value: &str) -> AppResult<()> {
        let mut conn = self.manager.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await.map_err(AppError::transient)
    }

    async fn hash_delete(&self, key: &str) -> AppResult<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await.map_err(AppError::transient)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.manager.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(AppError::transient)?;
        Ok(result.is_some())
    }

    async fn get_string(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(AppError::transient)
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await.map_err(AppError::transient)
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> AppResult<()> {
        let mut conn = self.manager.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64).await.map_err(AppError::transient)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> AppResult<()> {
        let mut conn = self.manager.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await.map_err(AppError::transient)
    }

    async fn zrange_by_score(&self, key: &str, max_score: f64, limit: usize) -> AppResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let members: Vec<String> = conn
            .zrangebyscore_limit(key, f64::NEG_INFINITY, max_score, 0, limit as isize)
            .await
            .map_err(AppError::transient)?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> AppResult<()> {
        let mut conn = self.manager.clone();
        conn.zrem::<_, _, ()>(key, member).await.map_err(AppError::transient)
    }

    async fn xadd(&self, stream: &str, fields: &[(&str, &str)], maxlen: usize) -> AppResult<()> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("MAXLEN").arg("~").arg(maxlen).arg("*");
        for (k, v) in fields {
            cmd.arg(*k).arg(*v);
        }
        cmd.query_async::<_, String>(&mut conn).await.map_err(AppError::transient)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// In-memory test double
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    sorted_sets: HashMap<String, BTreeMap<String, f64>>,
    streams: HashMap<String, VecDeque<Vec<(String, String)>>>,
}

/// An in-process substitution seam for tests; never used by the production
/// binary. Mutex-guarded because tests exercise it from multiple tasks.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stream_len(&self, stream: &str) -> usize {
        let state = self.state.lock().await;
        state.streams.get(stream).map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn hash_get_all(&self, key: &str) -> AppResult<Option<HashMap<String, String>>> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).cloned())
    }

    async fn hash_set_fields(&self, key: &str, fields: &[(&str, &str)], _ttl: Option<Duration>) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let entry = state.hashes.entry(key.to_string()).or_default();
        for (k, v) in fields {
            entry.insert(k.to_string(), v.to_string());
        }
        Ok(())
    }

    async fn hash_set_field(&self, key: &str, field: &str, value: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.hashes.entry(key.to_string()).or_default().insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_delete(&self, key: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.hashes.remove(key);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, _ttl: Duration) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        if state.strings.contains_key(key) {
            Ok(false)
        } else {
            state.strings.insert(key.to_string(), value.to_string());
            Ok(true)
        }
    }

    async fn get_string(&self, key: &str) -> AppResult<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.strings.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.strings.remove(key);
        state.hashes.remove(key);
        Ok(())
    }

    async fn set_ttl(&self, _key: &str, _ttl: Duration) -> AppResult<()> {
        // The in-memory double never expires entries on its own; tests
        // that need TTL semantics remove keys explicitly.
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.sorted_sets.entry(key.to_string()).or_default().insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, max_score: f64, limit: usize) -> AppResult<Vec<String>> {
        let state = self.state.lock().await;
        let Some(set) = state.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(&String, &f64)> = set.iter().filter(|(_, score)| **score <= max_score).collect();
        entries.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap());
        Ok(entries.into_iter().take(limit).map(|(m, _)| m.clone()).collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if let Some(set) = state.sorted_sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn xadd(&self, stream: &str, fields: &[(&str, &str)], maxlen: usize) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let entry = state.streams.entry(stream.to_string()).or_default();
        entry.push_back(fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        while entry.len() > maxlen {
            entry.pop_front();
        }
        Ok(())
    }
}

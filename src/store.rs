//! Score store abstraction over the key-value backend.
//!
//! All cross-process scoring state (recency/frequency/tag sorted sets,
//! transition counts, prediction batches, tuner arms) lives behind the
//! [`ScoreStore`] trait. Two implementations: [`RedisStore`] for production
//! and [`MemoryStore`] for tests and the degraded mode when the KV is
//! unreachable. Every mutation is atomic per key; the only scripted
//! operations are the recency decay rewrite and the batch-outcome CAS.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use thiserror::Error;

use crate::types::now_unix;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Backend(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Key naming
// ---------------------------------------------------------------------------

/// Key builders. Every key is namespaced by project id; queries for project P
/// can never observe project Q's members.
pub mod keys {
    pub fn recency(project: &str) -> String {
        format!("fsg:{project}:recency")
    }
    pub fn frequency(project: &str) -> String {
        format!("fsg:{project}:frequency")
    }
    pub fn tag(project: &str, tag: &str) -> String {
        format!("fsg:{project}:tag:{tag}")
    }
    pub fn first_seen(project: &str, file: &str) -> String {
        format!("fsg:{project}:first_seen:{file}")
    }
    pub fn sequence(project: &str, session: &str) -> String {
        format!("fsg:{project}:sequences:{session}")
    }
    pub fn transition_counts(project: &str, from: &str) -> String {
        format!("fsg:{project}:transition_counts:{from}")
    }
    pub fn transitions(project: &str, from: &str) -> String {
        format!("fsg:{project}:transitions:{from}")
    }
    pub fn transition_sources(project: &str) -> String {
        format!("fsg:{project}:transition_sources")
    }
    pub fn transition_timing(project: &str, from: &str, to: &str) -> String {
        format!("fsg:{project}:transition_timing:{from}:{to}")
    }
    pub fn batch(project: &str, id: &str) -> String {
        format!("fsg:{project}:batch:{id}")
    }
    pub fn batch_index(project: &str) -> String {
        format!("fsg:{project}:batches")
    }
    pub fn session_batches(project: &str, session: &str) -> String {
        format!("fsg:{project}:session_batches:{session}")
    }
    pub fn pred_hits(project: &str) -> String {
        format!("fsg:{project}:pred:hits")
    }
    pub fn pred_misses(project: &str) -> String {
        format!("fsg:{project}:pred:misses")
    }
    pub fn tuner(project: &str) -> String {
        format!("fsg:{project}:tuner")
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The KV primitives the scoring subsystems rely on. Mirrors the backend's
/// sorted set / hash / string / list operations plus two scripted ops.
#[async_trait]
pub trait ScoreStore: Send + Sync {
    async fn ping(&self) -> bool;

    // Sorted sets
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    async fn zcard(&self, key: &str) -> Result<u64>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;
    /// Members with scores, highest score first. `stop` is inclusive; -1 means all.
    async fn zrange_desc(&self, key: &str, start: isize, stop: isize) -> Result<Vec<(String, f64)>>;
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64>;
    /// Remove by ascending rank range, redis semantics (negative = from end).
    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<u64>;

    // Hashes
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;

    // Strings and counters
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool>;
    async fn incrby(&self, key: &str, delta: i64) -> Result<i64>;

    // Lists
    async fn lpush(&self, key: &str, value: &str) -> Result<()>;
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    // Key management
    async fn del(&self, key: &str) -> Result<()>;
    async fn del_matching(&self, pattern: &str) -> Result<u64>;
    async fn expire(&self, key: &str, seconds: u64) -> Result<()>;

    // Scripted atomic operations
    /// Rewrite every recency entry `s <- s * 0.5^((now - s) / half_life)`.
    /// Returns the number of members rewritten.
    async fn decay_sorted_set(&self, key: &str, now: f64, half_life: f64) -> Result<u64>;
    /// Set `field` to `new_value` only if it currently equals `expected`.
    /// Returns true when the swap happened.
    async fn hash_field_cas(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        new_value: &str,
    ) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Redis backend
// ---------------------------------------------------------------------------

const DECAY_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local half_life = tonumber(ARGV[2])
local members = redis.call('ZRANGE', key, 0, -1, 'WITHSCORES')
local count = 0
for i = 1, #members, 2 do
    local member = members[i]
    local old_score = tonumber(members[i + 1])
    local age = now - old_score
    if age > 0 then
        redis.call('ZADD', key, old_score * math.pow(0.5, age / half_life), member)
        count = count + 1
    end
end
return count
"#;

const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if current == ARGV[2] then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
    return 1
end
return 0
"#;

/// Redis-backed store using a shared async connection manager.
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
    decay_script: redis::Script,
    cas_script: redis::Script,
}

impl RedisStore {
    /// Connect to the KV at `url`. Fails fast when the server is unreachable
    /// so the caller can fall back to the in-memory backend.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid KV url: {e}")))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn,
            decay_script: redis::Script::new(DECAY_SCRIPT),
            cas_script: redis::Script::new(CAS_SCRIPT),
        })
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl ScoreStore for RedisStore {
    async fn ping(&self) -> bool {
        let mut conn = self.conn();
        let pong: Result<String> =
            redis::cmd("PING").query_async(&mut conn).await.map_err(StoreError::from);
        pong.is_ok()
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("ZADD").arg(key).arg(score).arg(member).query_async(&mut conn).await?;
        Ok(())
    }

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        let mut conn = self.conn();
        let score: f64 =
            redis::cmd("ZINCRBY").arg(key).arg(delta).arg(member).query_async(&mut conn).await?;
        Ok(score)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn();
        let score: Option<f64> =
            redis::cmd("ZSCORE").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(score)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        let count: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("ZREM").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(())
    }

    async fn zrange_desc(&self, key: &str, start: isize, stop: isize) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn();
        let members: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn();
        let members: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut conn = self.conn();
        let removed: u64 =
            redis::cmd("ZREMRANGEBYSCORE").arg(key).arg(min).arg(max).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<u64> {
        let mut conn = self.conn();
        let removed: u64 = redis::cmd("ZREMRANGEBYRANK")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        let value: i64 =
            redis::cmd("HINCRBY").arg(key).arg(field).arg(delta).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> =
            redis::cmd("HGET").arg(key).arg(field).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () =
            redis::cmd("HSET").arg(key).arg(field).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn();
        let fields: Vec<(String, String)> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(fields)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn();
        let fresh: bool = redis::cmd("SETNX").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(fresh)
    }

    async fn incrby(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        let value: i64 = redis::cmd("INCRBY").arg(key).arg(delta).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("LPUSH").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.conn();
        let _: () =
            redis::cmd("LTRIM").arg(key).arg(start).arg(stop).query_async(&mut conn).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let values: Vec<String> =
            redis::cmd("LRANGE").arg(key).arg(start).arg(stop).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn del_matching(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.conn();
        let keys: Vec<String> = redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        for key in &keys {
            cmd.arg(key);
        }
        let removed: u64 = cmd.query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        let mut conn = self.conn();
        let _: () =
            redis::cmd("EXPIRE").arg(key).arg(seconds).query_async(&mut conn).await?;
        Ok(())
    }

    async fn decay_sorted_set(&self, key: &str, now: f64, half_life: f64) -> Result<u64> {
        let mut conn = self.conn();
        let count: u64 =
            self.decay_script.key(key).arg(now).arg(half_life).invoke_async(&mut conn).await?;
        Ok(count)
    }

    async fn hash_field_cas(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        new_value: &str,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let swapped: i64 = self
            .cas_script
            .key(key)
            .arg(field)
            .arg(expected)
            .arg(new_value)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

enum Value {
    Sorted(HashMap<String, f64>),
    Hash(HashMap<String, String>),
    Str(String),
    List(VecDeque<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

/// Deterministic in-process twin of the KV backend. Used by tests and as the
/// degraded mode when the KV is unreachable at startup.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_unix();
        entries.retain(|_, e| e.expires_at.map(|at| at > now).unwrap_or(true));
        f(&mut entries)
    }
}

/// Resolve a redis-style inclusive (start, stop) pair against a length.
/// Returns None when the range is empty.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if len == 0 || start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Sorted-set members ordered ascending by (score, member), redis-style.
fn sorted_asc(map: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = map.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| {
        a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0))
    });
    members
}

#[async_trait]
impl ScoreStore for MemoryStore {
    async fn ping(&self) -> bool {
        true
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Sorted(HashMap::new()),
                expires_at: None,
            });
            if let Value::Sorted(map) = &mut entry.value {
                map.insert(member.to_string(), score);
            }
        });
        Ok(())
    }

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        Ok(self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Sorted(HashMap::new()),
                expires_at: None,
            });
            if let Value::Sorted(map) = &mut entry.value {
                let score = map.entry(member.to_string()).or_insert(0.0);
                *score += delta;
                *score
            } else {
                0.0
            }
        }))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        Ok(self.with_entries(|entries| match entries.get(key) {
            Some(Entry { value: Value::Sorted(map), .. }) => map.get(member).copied(),
            _ => None,
        }))
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        Ok(self.with_entries(|entries| match entries.get(key) {
            Some(Entry { value: Value::Sorted(map), .. }) => map.len() as u64,
            _ => 0,
        }))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        self.with_entries(|entries| {
            if let Some(Entry { value: Value::Sorted(map), .. }) = entries.get_mut(key) {
                map.remove(member);
            }
        });
        Ok(())
    }

    async fn zrange_desc(&self, key: &str, start: isize, stop: isize) -> Result<Vec<(String, f64)>> {
        Ok(self.with_entries(|entries| match entries.get(key) {
            Some(Entry { value: Value::Sorted(map), .. }) => {
                let mut members = sorted_asc(map);
                members.reverse();
                match resolve_range(members.len(), start, stop) {
                    Some((lo, hi)) => members[lo..=hi].to_vec(),
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        }))
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>> {
        Ok(self.with_entries(|entries| match entries.get(key) {
            Some(Entry { value: Value::Sorted(map), .. }) => sorted_asc(map)
                .into_iter()
                .filter(|(_, s)| *s >= min && *s <= max)
                .collect(),
            _ => Vec::new(),
        }))
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        Ok(self.with_entries(|entries| {
            if let Some(Entry { value: Value::Sorted(map), .. }) = entries.get_mut(key) {
                let before = map.len();
                map.retain(|_, s| *s < min || *s > max);
                (before - map.len()) as u64
            } else {
                0
            }
        }))
    }

    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<u64> {
        Ok(self.with_entries(|entries| {
            if let Some(Entry { value: Value::Sorted(map), .. }) = entries.get_mut(key) {
                let members = sorted_asc(map);
                match resolve_range(members.len(), start, stop) {
                    Some((lo, hi)) => {
                        for (member, _) in &members[lo..=hi] {
                            map.remove(member);
                        }
                        (hi - lo + 1) as u64
                    }
                    None => 0,
                }
            } else {
                0
            }
        }))
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        Ok(self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            if let Value::Hash(map) = &mut entry.value {
                let current: i64 =
                    map.get(field).and_then(|v| v.parse().ok()).unwrap_or(0) + delta;
                map.insert(field.to_string(), current.to_string());
                current
            } else {
                0
            }
        }))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.with_entries(|entries| match entries.get(key) {
            Some(Entry { value: Value::Hash(map), .. }) => map.get(field).cloned(),
            _ => None,
        }))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hset_multi(key, &[(field.to_string(), value.to_string())]).await
    }

    async fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            if let Value::Hash(map) = &mut entry.value {
                for (field, value) in fields {
                    map.insert(field.clone(), value.clone());
                }
            }
        });
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        Ok(self.with_entries(|entries| match entries.get(key) {
            Some(Entry { value: Value::Hash(map), .. }) => {
                let mut fields: Vec<(String, String)> =
                    map.iter().map(|(f, v)| (f.clone(), v.clone())).collect();
                fields.sort();
                fields
            }
            _ => Vec::new(),
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_entries(|entries| match entries.get(key) {
            Some(Entry { value: Value::Str(v), .. }) => Some(v.clone()),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry { value: Value::Str(value.to_string()), expires_at: None },
            );
        });
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
        Ok(self.with_entries(|entries| {
            if entries.contains_key(key) {
                false
            } else {
                entries.insert(
                    key.to_string(),
                    Entry { value: Value::Str(value.to_string()), expires_at: None },
                );
                true
            }
        }))
    }

    async fn incrby(&self, key: &str, delta: i64) -> Result<i64> {
        Ok(self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Str("0".to_string()),
                expires_at: None,
            });
            if let Value::Str(v) = &mut entry.value {
                let current: i64 = v.parse().unwrap_or(0) + delta;
                *v = current.to_string();
                current
            } else {
                0
            }
        }))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
            if let Value::List(list) = &mut entry.value {
                list.push_front(value.to_string());
            }
        });
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        self.with_entries(|entries| {
            if let Some(Entry { value: Value::List(list), .. }) = entries.get_mut(key) {
                match resolve_range(list.len(), start, stop) {
                    Some((lo, hi)) => {
                        let kept: VecDeque<String> = list.range(lo..=hi).cloned().collect();
                        *list = kept;
                    }
                    None => list.clear(),
                }
            }
        });
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        Ok(self.with_entries(|entries| match entries.get(key) {
            Some(Entry { value: Value::List(list), .. }) => {
                match resolve_range(list.len(), start, stop) {
                    Some((lo, hi)) => list.range(lo..=hi).cloned().collect(),
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        }))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.remove(key);
        });
        Ok(())
    }

    async fn del_matching(&self, pattern: &str) -> Result<u64> {
        // Only the trailing-star form is used by callers.
        let prefix = pattern.trim_end_matches('*');
        Ok(self.with_entries(|entries| {
            let before = entries.len();
            entries.retain(|k, _| !k.starts_with(prefix));
            (before - entries.len()) as u64
        }))
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(now_unix() + seconds);
            }
        });
        Ok(())
    }

    async fn decay_sorted_set(&self, key: &str, now: f64, half_life: f64) -> Result<u64> {
        Ok(self.with_entries(|entries| {
            if let Some(Entry { value: Value::Sorted(map), .. }) = entries.get_mut(key) {
                let mut count = 0;
                for score in map.values_mut() {
                    let age = now - *score;
                    if age > 0.0 {
                        *score *= 0.5_f64.powf(age / half_life);
                        count += 1;
                    }
                }
                count
            } else {
                0
            }
        }))
    }

    async fn hash_field_cas(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        new_value: &str,
    ) -> Result<bool> {
        Ok(self.with_entries(|entries| {
            if let Some(Entry { value: Value::Hash(map), .. }) = entries.get_mut(key) {
                if map.get(field).map(String::as_str) == Some(expected) {
                    map.insert(field.to_string(), new_value.to_string());
                    return true;
                }
            }
            false
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sorted_set_roundtrip() {
        let store = MemoryStore::new();
        store.zadd("k", "a", 3.0).await.unwrap();
        store.zadd("k", "b", 1.0).await.unwrap();
        store.zincrby("k", "b", 4.0).await.unwrap();

        let top = store.zrange_desc("k", 0, -1).await.unwrap();
        assert_eq!(top, vec![("b".to_string(), 5.0), ("a".to_string(), 3.0)]);
        assert_eq!(store.zscore("k", "a").await.unwrap(), Some(3.0));
        assert_eq!(store.zcard("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_sorted_set_returns_empty_not_error() {
        let store = MemoryStore::new();
        assert!(store.zrange_desc("missing", 0, -1).await.unwrap().is_empty());
        assert_eq!(store.zcard("missing").await.unwrap(), 0);
        assert_eq!(store.zscore("missing", "m").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zremrangebyrank_prunes_lowest() {
        let store = MemoryStore::new();
        for (member, score) in [("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)] {
            store.zadd("k", member, score).await.unwrap();
        }
        // Keep top 2: remove ranks 0..=-(2+1)
        store.zremrangebyrank("k", 0, -3).await.unwrap();
        let left = store.zrange_desc("k", 0, -1).await.unwrap();
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].0, "d");
        assert_eq!(left[1].0, "c");
    }

    #[tokio::test]
    async fn list_push_trim_range() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.lpush("l", &i.to_string()).await.unwrap();
        }
        // Head of list is most recent push.
        assert_eq!(store.lrange("l", 0, 1).await.unwrap(), vec!["4", "3"]);
        store.ltrim("l", 0, 2).await.unwrap();
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn cas_swaps_only_on_expected() {
        let store = MemoryStore::new();
        store.hset("b", "outcome", "pending").await.unwrap();
        assert!(store.hash_field_cas("b", "outcome", "pending", "hit").await.unwrap());
        // Second writer loses the race.
        assert!(!store.hash_field_cas("b", "outcome", "pending", "miss").await.unwrap());
        assert_eq!(store.hget("b", "outcome").await.unwrap(), Some("hit".to_string()));
    }

    #[tokio::test]
    async fn decay_rewrites_old_scores() {
        let store = MemoryStore::new();
        store.zadd("r", "f", 1000.0).await.unwrap();
        let count = store.decay_sorted_set("r", 4600.0, 3600.0).await.unwrap();
        assert_eq!(count, 1);
        let score = store.zscore("r", "f").await.unwrap().unwrap();
        assert!((score - 500.0).abs() < 1.0, "expected half decay, got {score}");
    }

    #[tokio::test]
    async fn setnx_first_writer_wins() {
        let store = MemoryStore::new();
        assert!(store.set_nx("fs", "100").await.unwrap());
        assert!(!store.set_nx("fs", "200").await.unwrap());
        assert_eq!(store.get("fs").await.unwrap(), Some("100".to_string()));
    }
}

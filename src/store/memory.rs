//! In-process store backend.
//!
//! Implements the same semantics as the Redis commands the service uses, so the
//! full request path can run without a Redis server. Availability and latency
//! can be toggled at runtime to simulate outages.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::backend::{StoreCommand, StoreConnection, StoreConnector, StoreError, StorePipeline};

enum Value {
    Text(String),
    Sorted(Vec<(i64, String)>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Shared {
    data: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    connect_attempts: AtomicU64,
    commands_executed: AtomicU64,
}

/// Cloneable handle; all clones see the same data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every connect and command fail with a connection error.
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every command by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.shared.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of times a connection was requested.
    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of commands (or batches) that reached the data.
    pub fn commands_executed(&self) -> u64 {
        self.shared.commands_executed.load(Ordering::SeqCst)
    }

    /// Seed a string value directly, bypassing availability checks.
    pub async fn insert(&self, key: &str, value: &str) {
        self.shared.data.lock().await.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: None,
            },
        );
    }

    /// Members of a sorted set, for assertions.
    pub async fn sorted_set_len(&self, key: &str) -> usize {
        let data = self.shared.data.lock().await;
        match data.get(key) {
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => members.len(),
            _ => 0,
        }
    }
}

#[async_trait]
impl StoreConnector for InMemoryStore {
    async fn connect(&self) -> Result<Arc<dyn StoreConnection>, StoreError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection refused".to_string()));
        }
        Ok(Arc::new(InMemoryConnection {
            shared: self.shared.clone(),
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct InMemoryConnection {
    shared: Arc<Shared>,
}

impl InMemoryConnection {
    /// Apply simulated latency and availability before touching the data.
    async fn round_trip(&self) -> Result<(), StoreError> {
        let latency = self.shared.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection reset by peer".to_string()));
        }
        self.shared.commands_executed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {key}"
    ))
}

/// Drop the entry if its TTL has passed, then return it.
fn live_entry<'a>(
    data: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if data.get(key).is_some_and(|e| e.is_expired(now)) {
        data.remove(key);
    }
    data.get_mut(key)
}

fn apply(
    data: &mut HashMap<String, Entry>,
    command: &StoreCommand,
    now: Instant,
) -> Result<i64, StoreError> {
    match command {
        StoreCommand::RemoveRangeByScore { key, max } => match live_entry(data, key, now) {
            None => Ok(0),
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => {
                let before = members.len();
                members.retain(|(score, _)| score > max);
                Ok((before - members.len()) as i64)
            }
            Some(_) => Err(wrong_type(key)),
        },
        StoreCommand::ScoredAdd { key, score, member } => {
            if data.get(key).is_some_and(|e| e.is_expired(now)) {
                data.remove(key);
            }
            let entry = data.entry(key.clone()).or_insert_with(|| Entry {
                value: Value::Sorted(Vec::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Sorted(members) => {
                    if let Some(existing) = members.iter_mut().find(|(_, m)| m == member) {
                        existing.0 = *score;
                        Ok(0)
                    } else {
                        members.push((*score, member.clone()));
                        Ok(1)
                    }
                }
                Value::Text(_) => Err(wrong_type(key)),
            }
        }
        StoreCommand::Cardinality { key } => match live_entry(data, key, now) {
            None => Ok(0),
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => Ok(members.len() as i64),
            Some(_) => Err(wrong_type(key)),
        },
        StoreCommand::Expire { key, ttl } => match live_entry(data, key, now) {
            None => Ok(0),
            Some(entry) => {
                entry.expires_at = Some(now + *ttl);
                Ok(1)
            }
        },
    }
}

#[async_trait]
impl StoreConnection for InMemoryConnection {
    async fn ping(&self) -> Result<(), StoreError> {
        self.round_trip().await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.round_trip().await?;
        let mut data = self.shared.data.lock().await;
        match live_entry(&mut data, key, Instant::now()) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.round_trip().await?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.shared.data.lock().await.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.round_trip().await?;
        let mut data = self.shared.data.lock().await;
        Ok(live_entry(&mut data, key, Instant::now()).is_some() && data.remove(key).is_some())
    }

    async fn execute_atomic(&self, pipeline: &StorePipeline) -> Result<Vec<i64>, StoreError> {
        self.round_trip().await?;

        // One lock for the whole batch keeps concurrent batches from interleaving
        let mut data = self.shared.data.lock().await;
        let now = Instant::now();

        // Like MULTI/EXEC, a failing command does not abort the others; the
        // first error is reported after the batch ran.
        let mut replies = Vec::with_capacity(pipeline.len());
        let mut first_error = None;
        for command in pipeline.commands() {
            match apply(&mut data, command, now) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    replies.push(0);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(replies),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn connection(store: &InMemoryStore) -> Arc<dyn StoreConnection> {
        store.connect().await.unwrap()
    }

    #[tokio::test]
    async fn test_sliding_window_batch_semantics() {
        let store = InMemoryStore::new();
        let conn = connection(&store).await;

        for (i, ts) in [100i64, 200, 300].iter().enumerate() {
            let batch = StorePipeline::new().scored_add("w", *ts, format!("m{i}"));
            conn.execute_atomic(&batch).await.unwrap();
        }

        let batch = StorePipeline::new()
            .remove_range_by_score("w", 200)
            .scored_add("w", 400, "m3")
            .cardinality("w")
            .expire("w", Duration::from_secs(60));
        let replies = conn.execute_atomic(&batch).await.unwrap();

        assert_eq!(replies, vec![2, 1, 2, 1]);
        assert_eq!(store.sorted_set_len("w").await, 2);
    }

    #[tokio::test]
    async fn test_text_values_and_ttl() {
        let store = InMemoryStore::new();
        let conn = connection(&store).await;

        conn.set("a", "1", None).await.unwrap();
        conn.set("b", "2", Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(conn.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(conn.get("b").await.unwrap().as_deref(), Some("2"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.get("b").await.unwrap(), None);

        assert!(conn.delete("a").await.unwrap());
        assert!(!conn.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type_is_a_command_error() {
        let store = InMemoryStore::new();
        store.insert("text", "v").await;
        let conn = connection(&store).await;

        let err = conn
            .execute_atomic(&StorePipeline::new().cardinality("text"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Command(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_connect_and_commands() {
        let store = InMemoryStore::new();
        let conn = connection(&store).await;

        store.set_available(false);
        assert!(store.connect().await.is_err());
        assert!(conn.ping().await.unwrap_err().is_transient());
        assert_eq!(store.connect_attempts(), 2);

        store.set_available(true);
        assert!(conn.ping().await.is_ok());
    }
}

//! Redis backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, RedisError, aio::MultiplexedConnection};
use tracing::{debug, info};

use super::backend::{StoreCommand, StoreConnection, StoreConnector, StoreError, StorePipeline};

/// Opens multiplexed Redis connections.
pub struct RedisConnector {
    client: Client,
    target: String,
}

impl RedisConnector {
    /// Parse the URL without connecting.
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let info = client.get_connection_info();
        let target = format!("{}/{}", info.addr, info.redis.db);
        Ok(Self { client, target })
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn StoreConnection>, StoreError> {
        debug!(target = %self.target, "Opening Redis connection");
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)?;
        info!(target = %self.target, "Redis connection established");
        Ok(Arc::new(RedisConnection { conn }))
    }

    fn describe(&self) -> String {
        self.target.clone()
    }
}

/// A multiplexed connection; cloning shares the underlying socket.
pub struct RedisConnection {
    conn: MultiplexedConnection,
}

#[async_trait]
impl StoreConnection for RedisConnection {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Command(format!("unexpected PING reply: {pong}")))
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(classify)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .set_ex(key, value, ttl.as_secs().max(1))
                    .await
                    .map_err(classify)?;
            }
            None => {
                let _: () = conn.set(key, value).await.map_err(classify)?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = conn.del(key).await.map_err(classify)?;
        Ok(deleted > 0)
    }

    async fn execute_atomic(&self, pipeline: &StorePipeline) -> Result<Vec<i64>, StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for command in pipeline.commands() {
            match command {
                StoreCommand::RemoveRangeByScore { key, max } => {
                    pipe.zrembyscore(key, "-inf", *max);
                }
                StoreCommand::ScoredAdd { key, score, member } => {
                    pipe.zadd(key, member, *score);
                }
                StoreCommand::Cardinality { key } => {
                    pipe.zcard(key);
                }
                StoreCommand::Expire { key, ttl } => {
                    pipe.pexpire(key, i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
                }
            }
        }

        let mut conn = self.conn.clone();
        let replies: Vec<i64> = pipe.query_async(&mut conn).await.map_err(classify)?;
        Ok(replies)
    }
}

/// Split Redis errors into "store unreachable" and "store said no".
fn classify(err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Command(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_parses_url_without_connecting() {
        let connector = RedisConnector::new("redis://127.0.0.1:6390/2").unwrap();
        assert!(connector.describe().contains("6390"));
        assert!(connector.describe().ends_with("/2"));
    }

    #[test]
    fn test_connector_rejects_bad_url() {
        assert!(matches!(
            RedisConnector::new("not a url"),
            Err(StoreError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_a_connection_error() {
        let connector = RedisConnector::new("redis://127.0.0.1:1/").unwrap();
        let err = connector.connect().await.err().unwrap();
        assert!(err.is_transient(), "unexpected error: {err}");
    }
}

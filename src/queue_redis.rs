#[cfg(feature = "redis")]
use std::time::Duration;

#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use redis::AsyncCommands;

#[cfg(feature = "redis")]
use crate::config::RiverConfig;
#[cfg(feature = "redis")]
use crate::error::{RiverError, RiverResult};
#[cfg(feature = "redis")]
use crate::queue::Queue;

/// Redis list used as a queue shared by every node.
///
/// Producers `LPUSH`, consumers `RPOP` (or `BRPOP` when a long-poll wait
/// is configured), so competing Rivers split the messages between them.
#[cfg(feature = "redis")]
pub struct RedisQueue {
    client: redis::Client,
    name: String,
    key: String,
    wait: Duration,
}

#[cfg(feature = "redis")]
impl RedisQueue {
    pub fn new(client: redis::Client, prefix: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: format!("{}:{}", prefix.into(), name),
            client,
            name,
            wait: Duration::ZERO,
        }
    }

    /// Queue whose pulls long-poll for `config.polling_interval`.
    pub fn from_config(
        client: redis::Client,
        prefix: impl Into<String>,
        name: impl Into<String>,
        config: &RiverConfig,
    ) -> Self {
        Self::new(client, prefix, name).with_wait(config.polling_interval)
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Block up to `wait` on each pull instead of returning immediately.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    async fn connection(&self) -> RiverResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RiverError::Queue(e.to_string()))
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl Queue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, message: String) -> RiverResult<()> {
        if message.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(&self.key, message)
            .await
            .map_err(|e| RiverError::Queue(e.to_string()))
    }

    async fn pull(&self) -> RiverResult<String> {
        let mut conn = self.connection().await?;
        if self.wait.is_zero() {
            let message: Option<String> = conn
                .rpop(&self.key, None)
                .await
                .map_err(|e| RiverError::Queue(e.to_string()))?;
            return Ok(message.unwrap_or_default());
        }

        let popped: Option<(String, String)> = conn
            .brpop(&self.key, self.wait.as_secs_f64())
            .await
            .map_err(|e| RiverError::Queue(e.to_string()))?;
        Ok(popped.map(|(_, message)| message).unwrap_or_default())
    }
}

#[cfg(all(test, feature = "redis"))]
mod tests {
    use super::*;

    fn client() -> redis::Client {
        redis::Client::open("redis://127.0.0.1/").unwrap()
    }

    #[test]
    fn config_sets_the_long_poll_wait() {
        let config = RiverConfig {
            polling_interval: Duration::from_secs(7),
            ..Default::default()
        };
        let queue = RedisQueue::from_config(client(), "para", "river", &config);
        assert_eq!(queue.wait(), Duration::from_secs(7));
        assert_eq!(queue.name(), "river");
    }

    #[test]
    fn plain_queue_does_not_block() {
        assert!(RedisQueue::new(client(), "para", "river").wait().is_zero());
    }
}

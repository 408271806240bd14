use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::RiverResult;

/// FIFO transport of string messages shared by producers and Rivers.
#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    async fn push(&self, message: String) -> RiverResult<()>;

    /// Take the next message, or an empty string when none is available.
    async fn pull(&self) -> RiverResult<String>;
}

/// Supplies the River with batches of raw messages.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn pull_messages(&self) -> RiverResult<Vec<String>>;
}

/// In-memory queue for single-node deployments and tests.
#[derive(Default)]
pub struct LocalQueue {
    name: String,
    messages: Mutex<VecDeque<String>>,
}

impl LocalQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

#[async_trait]
impl Queue for LocalQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, message: String) -> RiverResult<()> {
        if message.is_empty() {
            return Ok(());
        }
        self.messages.lock().await.push_back(message);
        Ok(())
    }

    async fn pull(&self) -> RiverResult<String> {
        Ok(self.messages.lock().await.pop_front().unwrap_or_default())
    }
}

/// Pulls up to `max_messages` from a [`Queue`] per cycle, stopping at the
/// first empty pull.
pub struct QueueSource {
    queue: Arc<dyn Queue>,
    max_messages: usize,
}

impl QueueSource {
    pub fn new(queue: Arc<dyn Queue>, max_messages: usize) -> Self {
        Self {
            queue,
            max_messages: max_messages.max(1),
        }
    }
}

#[async_trait]
impl MessageSource for QueueSource {
    async fn pull_messages(&self) -> RiverResult<Vec<String>> {
        let mut messages = Vec::new();
        for _ in 0..self.max_messages {
            let message = self.queue.pull().await?;
            if message.is_empty() {
                break;
            }
            messages.push(message);
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_queue_is_fifo() {
        let queue = LocalQueue::new("q");
        queue.push("a".to_string()).await.unwrap();
        queue.push("b".to_string()).await.unwrap();
        assert_eq!(queue.pull().await.unwrap(), "a");
        assert_eq!(queue.pull().await.unwrap(), "b");
        assert_eq!(queue.pull().await.unwrap(), "");
    }

    #[tokio::test]
    async fn empty_messages_are_not_queued() {
        let queue = LocalQueue::new("q");
        queue.push(String::new()).await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn source_caps_batch_size() {
        let queue = Arc::new(LocalQueue::new("q"));
        for i in 0..15 {
            queue.push(format!("m{}", i)).await.unwrap();
        }
        let source = QueueSource::new(queue.clone(), 10);

        assert_eq!(source.pull_messages().await.unwrap().len(), 10);
        assert_eq!(source.pull_messages().await.unwrap().len(), 5);
        assert!(source.pull_messages().await.unwrap().is_empty());
    }
}

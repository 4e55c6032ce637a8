use crate::broker::Broker;
use crate::queue::TransportError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Redis key layout for the job transport.
/// Producers and consumers share these so keys never drift.
pub const QUEUE_PREFIX: &str = "mycode:queue";
pub const UNACKED_PREFIX: &str = "mycode:unacked";

/// List holding messages waiting for delivery
pub fn queue_key(queue: &str) -> String {
    format!("{}:{}", QUEUE_PREFIX, queue)
}

/// List holding messages delivered to `consumer` but not yet settled
pub fn unacked_key(queue: &str, consumer: &str) -> String {
    format!("{}:{}:{}", UNACKED_PREFIX, queue, consumer)
}

/// Redis-backed broker using the reliable-queue pattern.
///
/// Blocking fetches run on their own connection: a `BLMOVE` parks the
/// multiplexed connection it is sent on, and acks must not wait behind it.
///
/// `close` is shared by every clone; the sockets go away with the last one.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    blocking: ConnectionManager,
    closed: Arc<AtomicBool>,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let blocking = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            blocking,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Depth of every unacknowledged list of `queue`, keyed by consumer
    pub async fn unacked_depths(&self, queue: &str) -> Result<Vec<(String, usize)>, TransportError> {
        let prefix = unacked_key(queue, "");
        let mut conn = self.conn.clone();

        let keys: Vec<String> = {
            let mut iter: redis::AsyncIter<String> =
                conn.scan_match(format!("{}*", prefix)).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut depths = Vec::with_capacity(keys.len());
        for key in keys {
            let len: usize = conn.llen(&key).await?;
            let consumer = key.trim_start_matches(&prefix).to_string();
            depths.push((consumer, len));
        }
        depths.sort();
        Ok(depths)
    }

    async fn settle(&self, queue: &str, consumer: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.lrem(unacked_key(queue, consumer), 1, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    /// RPUSH for FIFO delivery; returns once Redis replied
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(queue_key(queue), payload).await?;
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.ensure_open()?;
        let mut conn = self.blocking.clone();
        let payload: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(queue_key(queue))
            .arg(unacked_key(queue, consumer))
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(payload)
    }

    async fn ack(&self, queue: &str, consumer: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.settle(queue, consumer, payload).await
    }

    /// Removal without requeue: the message is gone for good
    async fn nack(&self, queue: &str, consumer: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.settle(queue, consumer, payload).await
    }

    async fn recover(&self, queue: &str, consumer: &str) -> Result<usize, TransportError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let source = unacked_key(queue, consumer);
        let target = queue_key(queue);
        let mut moved = 0;
        loop {
            let payload: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(&source)
                .arg(&target)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            if payload.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    async fn depth(&self, queue: &str) -> Result<usize, TransportError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(queue_key(queue)).await?)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

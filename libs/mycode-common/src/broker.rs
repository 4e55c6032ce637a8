use crate::queue::TransportError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Durable queue broker with per-consumer acknowledgement.
///
/// `fetch` hands a message to a named consumer and keeps it in that
/// consumer's unacknowledged set until `ack` or `nack` settles it. `nack`
/// never requeues. `recover` returns whatever a previous incarnation of the
/// consumer left unsettled to the head of the queue. After `close` every
/// delivery operation fails with [`TransportError::Closed`]; `depth` stays
/// available for inspection.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn fetch(
        &self,
        queue: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    async fn ack(&self, queue: &str, consumer: &str, payload: &[u8]) -> Result<(), TransportError>;

    async fn nack(&self, queue: &str, consumer: &str, payload: &[u8]) -> Result<(), TransportError>;

    async fn recover(&self, queue: &str, consumer: &str) -> Result<usize, TransportError>;

    async fn depth(&self, queue: &str) -> Result<usize, TransportError>;

    fn close(&self);
}

#[derive(Debug, Default)]
struct MemoryState {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    unacked: HashMap<(String, String), Vec<Vec<u8>>>,
}

impl MemoryState {
    fn settle(&mut self, queue: &str, consumer: &str, payload: &[u8]) {
        if let Some(list) = self.unacked.get_mut(&(queue.to_string(), consumer.to_string())) {
            if let Some(idx) = list.iter().position(|p| p == payload) {
                list.remove(idx);
            }
        }
    }
}

/// In-process broker with the same settlement rules as the Redis one
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    published: Notify,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of messages waiting in `queue`
    pub fn pending(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.lock();
        state
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unacked(&self, queue: &str, consumer: &str) -> usize {
        let state = self.lock();
        state
            .unacked
            .get(&(queue.to_string(), consumer.to_string()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_take(&self, queue: &str, consumer: &str) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let payload = state.queues.get_mut(queue)?.pop_front()?;
        state
            .unacked
            .entry((queue.to_string(), consumer.to_string()))
            .or_default()
            .push(payload.clone());
        Some(payload)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        self.published.notify_waiters();
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.try_take(queue, consumer) {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, queue: &str, consumer: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.lock().settle(queue, consumer, payload);
        Ok(())
    }

    async fn nack(&self, queue: &str, consumer: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.lock().settle(queue, consumer, payload);
        Ok(())
    }

    async fn recover(&self, queue: &str, consumer: &str) -> Result<usize, TransportError> {
        self.ensure_open()?;
        let mut state = self.lock();
        let leftover = state
            .unacked
            .remove(&(queue.to_string(), consumer.to_string()))
            .unwrap_or_default();
        let count = leftover.len();
        let pending = state.queues.entry(queue.to_string()).or_default();
        for payload in leftover.into_iter().rev() {
            pending.push_front(payload);
        }
        drop(state);
        if count > 0 {
            self.published.notify_waiters();
        }
        Ok(count)
    }

    async fn depth(&self, queue: &str) -> Result<usize, TransportError> {
        Ok(self.lock().queues.get(queue).map(VecDeque::len).unwrap_or(0))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.published.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: &str = "code";

    #[tokio::test]
    async fn test_fetch_moves_message_to_unacked() {
        let broker = MemoryBroker::new();
        broker.publish(Q, b"a".to_vec()).await.unwrap();

        let fetched = broker.fetch(Q, "w1", Duration::from_millis(10)).await.unwrap();

        assert_eq!(fetched.as_deref(), Some(&b"a"[..]));
        assert_eq!(broker.depth(Q).await.unwrap(), 0);
        assert_eq!(broker.unacked(Q, "w1"), 1);
    }

    #[tokio::test]
    async fn test_fetch_times_out_on_empty_queue() {
        let broker = MemoryBroker::new();
        let fetched = broker.fetch(Q, "w1", Duration::from_millis(20)).await.unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_publish() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.fetch(Q, "w1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish(Q, b"late".to_vec()).await.unwrap();

        let fetched = waiter.await.unwrap().unwrap();
        assert_eq!(fetched.as_deref(), Some(&b"late"[..]));
    }

    #[tokio::test]
    async fn test_nack_drops_without_requeue() {
        let broker = MemoryBroker::new();
        broker.publish(Q, b"bad".to_vec()).await.unwrap();
        let payload = broker.fetch(Q, "w1", Duration::from_millis(10)).await.unwrap().unwrap();

        broker.nack(Q, "w1", &payload).await.unwrap();

        assert_eq!(broker.depth(Q).await.unwrap(), 0);
        assert_eq!(broker.unacked(Q, "w1"), 0);
        assert_eq!(broker.recover(Q, "w1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_delivery() {
        let broker = MemoryBroker::new();
        broker.publish(Q, b"kept".to_vec()).await.unwrap();

        broker.close();

        assert!(matches!(
            broker.publish(Q, b"late".to_vec()).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            broker.fetch(Q, "w1", Duration::from_millis(10)).await,
            Err(TransportError::Closed)
        ));
        assert_eq!(broker.depth(Q).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recover_requeues_unsettled_in_order() {
        let broker = MemoryBroker::new();
        for p in [b"1", b"2", b"3"] {
            broker.publish(Q, p.to_vec()).await.unwrap();
        }
        broker.fetch(Q, "w1", Duration::from_millis(10)).await.unwrap();
        broker.fetch(Q, "w1", Duration::from_millis(10)).await.unwrap();

        assert_eq!(broker.recover(Q, "w1").await.unwrap(), 2);

        assert_eq!(
            broker.pending(Q),
            vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]
        );
        assert_eq!(broker.unacked(Q, "w1"), 0);
    }
}

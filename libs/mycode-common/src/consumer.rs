/// Bounded queue consumer.
///
/// A single fetch loop pulls messages from the broker while it holds
/// prefetch credit, and hands them to a fixed pool of worker tasks through
/// an internal channel. Each message is settled exactly once: `ack` when
/// the handler succeeds, `nack` (dropped, never requeued) when the payload
/// is malformed or the handler fails. A job that can never succeed must not
/// loop forever.
///
/// Shutdown stops fetching, lets the pool drain every message already
/// fetched, then closes the broker.
use crate::broker::Broker;
use crate::queue::{decode, Message};
use async_trait::async_trait;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::TransportError;

#[async_trait]
pub trait Handler<M>: Send + Sync + 'static {
    async fn handle(&self, message: M) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Stable identity of this consumer; owns its unacknowledged list
    pub consumer_name: String,
    /// Maximum number of unacknowledged messages held at once
    pub prefetch: usize,
    /// How long one broker fetch may block
    pub poll_interval: Duration,
}

/// Live counters of one consumer
#[derive(Debug)]
pub struct ConsumerStats {
    queue: &'static str,
    prefetch: usize,
    in_flight: AtomicUsize,
    acked: AtomicU64,
    nacked: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerSnapshot {
    pub queue: &'static str,
    pub prefetch: usize,
    pub in_flight: usize,
    pub acked: u64,
    pub nacked: u64,
}

impl ConsumerStats {
    pub(crate) fn new(queue: &'static str, prefetch: usize) -> Self {
        Self {
            queue,
            prefetch,
            in_flight: AtomicUsize::new(0),
            acked: AtomicU64::new(0),
            nacked: AtomicU64::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            queue: self.queue,
            prefetch: self.prefetch,
            in_flight: self.in_flight(),
            acked: self.acked.load(Ordering::SeqCst),
            nacked: self.nacked.load(Ordering::SeqCst),
        }
    }
}

struct Delivery {
    payload: Vec<u8>,
    _credit: OwnedSemaphorePermit,
}

/// Everything a pool worker needs to settle messages
struct Settler<M, H> {
    broker: Arc<dyn Broker>,
    handler: Arc<H>,
    stats: Arc<ConsumerStats>,
    consumer_name: String,
    _message: PhantomData<fn(M)>,
}

impl<M: Message, H: Handler<M>> Settler<M, H> {
    async fn process(&self, delivery: Delivery) {
        let queue = M::QUEUE;
        let message = match decode::<M>(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(queue, error = %e, "Dropping malformed message");
                self.nack(&delivery.payload, None).await;
                self.finish();
                return;
            }
        };

        let solution_test_id = message.correlation_id();
        match self.handler.handle(message).await {
            Ok(()) => {
                match self
                    .broker
                    .ack(queue, &self.consumer_name, &delivery.payload)
                    .await
                {
                    Ok(()) => {
                        self.stats.acked.fetch_add(1, Ordering::SeqCst);
                        debug!(queue, solution_test_id, "Message acknowledged");
                    }
                    Err(e) => error!(queue, solution_test_id, error = %e, "Failed to ack"),
                }
            }
            Err(e) => {
                error!(
                    queue,
                    solution_test_id,
                    error = format!("{:#}", e),
                    "Handler failed, dropping message"
                );
                self.nack(&delivery.payload, Some(solution_test_id)).await;
            }
        }
        self.finish();
    }

    async fn nack(&self, payload: &[u8], solution_test_id: Option<i64>) {
        match self.broker.nack(M::QUEUE, &self.consumer_name, payload).await {
            Ok(()) => {
                self.stats.nacked.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => error!(queue = M::QUEUE, ?solution_test_id, error = %e, "Failed to nack"),
        }
    }

    fn finish(&self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Consumer {
    queue: &'static str,
    broker: Arc<dyn Broker>,
    shutdown: CancellationToken,
    fetcher: JoinHandle<()>,
    workers: JoinSet<()>,
    stats: Arc<ConsumerStats>,
}

impl Consumer {
    /// Recovers messages a previous run of this consumer left unsettled,
    /// then starts fetching.
    pub async fn start<M, H>(
        broker: Arc<dyn Broker>,
        handler: Arc<H>,
        options: ConsumerOptions,
    ) -> Result<Consumer, TransportError>
    where
        M: Message,
        H: Handler<M>,
    {
        let queue = M::QUEUE;
        let prefetch = options.prefetch.max(1);

        let recovered = broker.recover(queue, &options.consumer_name).await?;
        if recovered > 0 {
            warn!(
                queue,
                consumer = %options.consumer_name,
                recovered,
                "Requeued messages left unacknowledged by a previous run"
            );
        }

        let stats = Arc::new(ConsumerStats::new(queue, prefetch));
        let shutdown = CancellationToken::new();
        let credit = Arc::new(Semaphore::new(prefetch));
        let (tx, rx) = mpsc::channel::<Delivery>(prefetch);
        let rx = Arc::new(Mutex::new(rx));

        let fetcher = tokio::spawn(fetch_loop(
            broker.clone(),
            queue,
            options.consumer_name.clone(),
            options.poll_interval,
            credit,
            tx,
            stats.clone(),
            shutdown.clone(),
        ));

        let settler = Arc::new(Settler::<M, H> {
            broker: broker.clone(),
            handler,
            stats: stats.clone(),
            consumer_name: options.consumer_name.clone(),
            _message: PhantomData,
        });

        let mut workers = JoinSet::new();
        for _ in 0..prefetch {
            let rx = rx.clone();
            let settler = settler.clone();
            workers.spawn(async move {
                loop {
                    let delivery = rx.lock().await.recv().await;
                    match delivery {
                        Some(delivery) => settler.process(delivery).await,
                        None => break,
                    }
                }
            });
        }

        info!(
            queue,
            consumer = %options.consumer_name,
            prefetch,
            "Consumer started"
        );

        Ok(Consumer {
            queue,
            broker,
            shutdown,
            fetcher,
            workers,
            stats,
        })
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Stops fetching, waits for every fetched message to be settled and
    /// closes the broker. Handlers may still publish while draining.
    pub async fn close(mut self) {
        info!(queue = self.queue, in_flight = self.stats.in_flight(), "Consumer stopping");
        self.shutdown.cancel();

        if let Err(e) = (&mut self.fetcher).await {
            error!(queue = self.queue, error = %e, "Fetch loop panicked");
        }
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                error!(queue = self.queue, error = %e, "Consumer worker panicked");
            }
        }

        self.broker.close();
        info!(queue = self.queue, "Consumer closed");
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_loop(
    broker: Arc<dyn Broker>,
    queue: &'static str,
    consumer_name: String,
    poll_interval: Duration,
    credit: Arc<Semaphore>,
    tx: mpsc::Sender<Delivery>,
    stats: Arc<ConsumerStats>,
    shutdown: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = credit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        if shutdown.is_cancelled() {
            break;
        }

        // Not raced against shutdown: a fetch that already moved a message
        // must still hand it to the pool.
        match broker.fetch(queue, &consumer_name, poll_interval).await {
            Ok(Some(payload)) => {
                stats.in_flight.fetch_add(1, Ordering::SeqCst);
                let delivery = Delivery {
                    payload,
                    _credit: permit,
                };
                if tx.send(delivery).await.is_err() {
                    error!(queue, "Worker pool gone, stopping fetch loop");
                    break;
                }
            }
            Ok(None) => continue,
            Err(e) => {
                error!(queue, error = %e, "Broker fetch failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
    debug!(queue, "Fetch loop stopped");
}

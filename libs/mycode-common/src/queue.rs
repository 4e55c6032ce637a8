use crate::broker::Broker;
use crate::types::{CodeJob, Run, SolutionTestId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Compile-and-run requests, API tier -> runner
pub const CODE_QUEUE: &str = "code";
/// Execution results, runner -> grader
pub const RUN_QUEUE: &str = "run";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("decode message: {0}")]
    Decode(#[source] bincode::Error),
    #[error("broker: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("broker connection closed")]
    Closed,
}

/// A payload type bound to exactly one queue
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const QUEUE: &'static str;

    fn correlation_id(&self) -> SolutionTestId;
}

impl Message for CodeJob {
    const QUEUE: &'static str = CODE_QUEUE;

    fn correlation_id(&self) -> SolutionTestId {
        self.solution_test_id
    }
}

impl Message for Run {
    const QUEUE: &'static str = RUN_QUEUE;

    fn correlation_id(&self) -> SolutionTestId {
        self.solution_test_id
    }
}

pub fn encode<M: Message>(message: &M) -> Result<Vec<u8>, TransportError> {
    bincode::serialize(message).map_err(TransportError::Encode)
}

pub fn decode<M: Message>(payload: &[u8]) -> Result<M, TransportError> {
    bincode::deserialize(payload).map_err(TransportError::Decode)
}

/// Typed publishing side of one queue.
///
/// `publish` returns only after the broker accepted the message. Safe to
/// share between concurrent handler tasks.
pub struct Publisher<M> {
    broker: Arc<dyn Broker>,
    _message: PhantomData<fn(M)>,
}

impl<M> Clone for Publisher<M> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            _message: PhantomData,
        }
    }
}

impl<M: Message> Publisher<M> {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            _message: PhantomData,
        }
    }

    pub async fn publish(&self, message: &M) -> Result<(), TransportError> {
        let payload = encode(message)?;
        self.broker.publish(M::QUEUE, payload).await?;
        tracing::debug!(
            queue = M::QUEUE,
            solution_test_id = message.correlation_id(),
            "Message published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::types::Language;

    fn code_job() -> CodeJob {
        CodeJob {
            solution_test_id: 31,
            language: Language::Go,
            source: "package main".to_string(),
            stdin: "5\n".to_string(),
            with_checker: true,
            checker_language: Some(Language::C),
            checker_source: "int main() { return 0; }".to_string(),
        }
    }

    #[test]
    fn test_queue_binding() {
        assert_eq!(<CodeJob as Message>::QUEUE, "code");
        assert_eq!(<Run as Message>::QUEUE, "run");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode::<CodeJob>(&[0xff, 0x01]),
            Err(TransportError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_lands_on_bound_queue() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher: Publisher<CodeJob> = Publisher::new(broker.clone());

        publisher.publish(&code_job()).await.unwrap();

        assert_eq!(broker.depth(CODE_QUEUE).await.unwrap(), 1);
        assert_eq!(broker.depth(RUN_QUEUE).await.unwrap(), 0);
        let payload = broker.pending(CODE_QUEUE).remove(0);
        assert_eq!(decode::<CodeJob>(&payload).unwrap(), code_job());
    }
}

/// Run handler: grades one execution result and stores the verdict
use crate::evaluator;
use anyhow::{Context, Result};
use async_trait::async_trait;
use mycode_common::consumer::Handler;
use mycode_common::types::Run;
use mycode_db::GradingStore;
use std::sync::Arc;
use tracing::{info, instrument};

pub struct RunGrader {
    store: Arc<dyn GradingStore>,
}

impl RunGrader {
    pub fn new(store: Arc<dyn GradingStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler<Run> for RunGrader {
    #[instrument(skip_all, fields(solution_test_id = run.solution_test_id))]
    async fn handle(&self, run: Run) -> Result<()> {
        info!("Run received");

        let limits = self
            .store
            .test_limits(run.solution_test_id)
            .await
            .context("get test from DB")?;

        // Unparsable measurements leave the test in processing.
        let verdict = evaluator::evaluate(&run, &limits)?;

        self.store
            .save_verdict(&run, &limits, &verdict)
            .await
            .context("add solution test result to DB")?;

        info!(status = ?verdict.status(), fails = ?verdict.recorded_fails(), "Run processed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycode_common::broker::{Broker, MemoryBroker};
    use mycode_common::consumer::{Consumer, ConsumerOptions};
    use mycode_common::queue::{Publisher, RUN_QUEUE};
    use mycode_common::types::{Language, SolutionTestStatus, TestKind, TestLimits};
    use mycode_db::MemoryStore;
    use std::time::Duration;

    fn store_with_test(kind: TestKind) -> (Arc<MemoryStore>, i64) {
        let store = Arc::new(MemoryStore::new());
        let exercise = store.add_exercise(Language::Go);
        let test = store
            .add_test(
                exercise,
                "",
                TestLimits {
                    max_duration: "2s".to_string(),
                    max_memory: "50MB".to_string(),
                    kind,
                },
            )
            .unwrap();
        let id = store.add_solution_test(test);
        (store, id)
    }

    fn run(id: i64) -> Run {
        Run {
            solution_test_id: id,
            duration: "1.1s".to_string(),
            used_memory: "3MB".to_string(),
            stdout: "42".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_passing_run_is_stored_without_fails() {
        let (store, id) = store_with_test(TestKind::Simple {
            expected_stdout: "42".to_string(),
        });
        let grader = RunGrader::new(store.clone());

        grader.handle(run(id)).await.unwrap();

        let row = store.solution_test(id).unwrap();
        assert_eq!(row.status, SolutionTestStatus::Succeed);
        assert!(row.fails.is_none());
        assert_eq!(row.run.unwrap().duration, "1.1s");
    }

    #[tokio::test]
    async fn test_rejected_checker_is_stored_as_failed() {
        let (store, id) = store_with_test(TestKind::Checker {
            language: Language::Python,
            source: "print('no')".to_string(),
        });
        let grader = RunGrader::new(store.clone());
        let mut r = run(id);
        r.checker_stdout = "no".to_string();

        grader.handle(r).await.unwrap();

        let row = store.solution_test(id).unwrap();
        assert_eq!(row.status, SolutionTestStatus::Failed);
        let fails = row.fails.unwrap();
        assert!(fails.wrong_checker);
        assert!(!fails.wrong_stdout);
        assert_eq!(row.run.unwrap().checker_stdout, "no");
    }

    #[tokio::test]
    async fn test_unparsable_run_stays_processing() {
        let (store, id) = store_with_test(TestKind::Simple {
            expected_stdout: "42".to_string(),
        });
        let grader = RunGrader::new(store.clone());
        let mut r = run(id);
        r.duration = "forever".to_string();

        assert!(grader.handle(r).await.is_err());
        assert_eq!(store.solution_test(id).unwrap().status, SolutionTestStatus::Processing);
    }

    #[tokio::test]
    async fn test_unknown_solution_test_fails() {
        let store = Arc::new(MemoryStore::new());
        let grader = RunGrader::new(store);
        assert!(grader.handle(run(404)).await.is_err());
    }

    #[tokio::test]
    async fn test_graded_through_run_queue() {
        let (store, id) = store_with_test(TestKind::Simple {
            expected_stdout: "42".to_string(),
        });
        let broker = Arc::new(MemoryBroker::new());
        let consumer = Consumer::start::<Run, _>(
            broker.clone(),
            Arc::new(RunGrader::new(store.clone())),
            ConsumerOptions {
                consumer_name: "grader-test".to_string(),
                prefetch: 4,
                poll_interval: Duration::from_millis(20),
            },
        )
        .await
        .unwrap();

        Publisher::<Run>::new(broker.clone()).publish(&run(id)).await.unwrap();

        let stats = consumer.stats();
        for _ in 0..200 {
            if stats.snapshot().acked == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        consumer.close().await;

        assert_eq!(stats.snapshot().acked, 1);
        assert_eq!(broker.depth(RUN_QUEUE).await.unwrap(), 0);
        assert_eq!(store.solution_test(id).unwrap().status, SolutionTestStatus::Succeed);
    }
}

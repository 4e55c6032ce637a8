/// Code job handler
///
/// Runs the submission through the engine, then, for checker tests, runs the
/// checker on the submission's stdout, and publishes the merged run. Any
/// failure aborts the job before anything is published.
use crate::engine::ExecutionEngine;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mycode_common::consumer::Handler;
use mycode_common::queue::Publisher;
use mycode_common::types::{CodeJob, Run};
use std::sync::Arc;
use tracing::{info, instrument};

pub struct CodeRunner {
    engine: Arc<dyn ExecutionEngine>,
    publisher: Publisher<Run>,
}

impl CodeRunner {
    pub fn new(engine: Arc<dyn ExecutionEngine>, publisher: Publisher<Run>) -> Self {
        Self { engine, publisher }
    }

    #[instrument(skip_all, fields(solution_test_id = job.solution_test_id, language = %job.language))]
    pub async fn run(&self, job: &CodeJob) -> Result<Run> {
        let record = self
            .engine
            .execute(job.language, &job.source, &job.stdin)
            .await
            .context("execute solution")?;
        info!(code_type = "solution", duration = %record.duration, used_memory = %record.used_memory, "Executed");

        let mut run = Run::from_record(job.solution_test_id, record);

        if job.with_checker {
            let Some(checker) = job.checker_job(&run.stdout) else {
                bail!("checker test without checker language");
            };
            let checker_record = self
                .engine
                .execute(checker.language, &checker.source, &checker.stdin)
                .await
                .context("execute checker")?;
            info!(code_type = "checker", checker_language = %checker.language, "Executed");
            run.merge_checker(checker_record);
        }

        Ok(run)
    }
}

#[async_trait]
impl Handler<CodeJob> for CodeRunner {
    async fn handle(&self, job: CodeJob) -> Result<()> {
        let run = self.run(&job).await?;
        self.publisher.publish(&run).await.context("publish run")?;
        info!(solution_test_id = job.solution_test_id, "Run published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycode_common::broker::{Broker, MemoryBroker};
    use mycode_common::queue::{decode, RUN_QUEUE};
    use mycode_common::types::{ExecutionRecord, Language};
    use std::sync::Mutex;

    /// Echoes stdin back and records every call
    #[derive(Default)]
    struct FakeEngine {
        calls: Mutex<Vec<(Language, String, String)>>,
        fail_language: Option<Language>,
    }

    #[async_trait]
    impl ExecutionEngine for FakeEngine {
        async fn execute(&self, language: Language, source: &str, stdin: &str) -> Result<ExecutionRecord> {
            self.calls
                .lock()
                .unwrap()
                .push((language, source.to_string(), stdin.to_string()));
            if self.fail_language == Some(language) {
                bail!("container exited with code 1");
            }
            let stdout = if source == "checker" { "ok".to_string() } else { format!("out:{}", stdin) };
            Ok(ExecutionRecord {
                duration: "10ms".to_string(),
                used_memory: "2MB".to_string(),
                stdout,
                stderr: format!("{} stderr", language),
            })
        }
    }

    fn job(with_checker: bool) -> CodeJob {
        CodeJob {
            solution_test_id: 5,
            language: Language::C,
            source: "solution".to_string(),
            stdin: "1 2".to_string(),
            with_checker,
            checker_language: with_checker.then_some(Language::Python),
            checker_source: if with_checker { "checker".to_string() } else { String::new() },
        }
    }

    fn runner(engine: Arc<FakeEngine>) -> (CodeRunner, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        let runner = CodeRunner::new(engine, Publisher::new(broker.clone()));
        (runner, broker)
    }

    #[tokio::test]
    async fn test_plain_job_runs_once() {
        let engine = Arc::new(FakeEngine::default());
        let (runner, broker) = runner(engine.clone());

        runner.handle(job(false)).await.unwrap();

        assert_eq!(engine.calls.lock().unwrap().len(), 1);
        let run: Run = decode(&broker.pending(RUN_QUEUE)[0]).unwrap();
        assert_eq!(run.solution_test_id, 5);
        assert_eq!(run.stdout, "out:1 2");
        assert_eq!(run.checker_stdout, "");
    }

    #[tokio::test]
    async fn test_checker_reads_submission_stdout() {
        let engine = Arc::new(FakeEngine::default());
        let (runner, broker) = runner(engine.clone());

        runner.handle(job(true)).await.unwrap();

        let calls = engine.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, Language::Python);
        assert_eq!(calls[1].2, "out:1 2");

        let run: Run = decode(&broker.pending(RUN_QUEUE)[0]).unwrap();
        assert_eq!(run.stdout, "out:1 2");
        assert_eq!(run.stderr, "c stderr");
        assert_eq!(run.checker_stdout, "ok");
        assert_eq!(run.checker_stderr, "python stderr");
        assert_eq!(run.duration, "10ms");
    }

    #[tokio::test]
    async fn test_failed_checker_publishes_nothing() {
        let engine = Arc::new(FakeEngine {
            fail_language: Some(Language::Python),
            ..Default::default()
        });
        let (runner, broker) = runner(engine.clone());

        assert!(runner.handle(job(true)).await.is_err());
        assert_eq!(broker.depth(RUN_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_solution_skips_checker() {
        let engine = Arc::new(FakeEngine {
            fail_language: Some(Language::C),
            ..Default::default()
        });
        let (runner, broker) = runner(engine.clone());

        assert!(runner.handle(job(true)).await.is_err());
        assert_eq!(engine.calls.lock().unwrap().len(), 1);
        assert_eq!(broker.depth(RUN_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_checker_without_language_is_rejected() {
        let engine = Arc::new(FakeEngine::default());
        let (runner, _broker) = runner(engine);
        let mut job = job(true);
        job.checker_language = None;

        assert!(runner.handle(job).await.is_err());
    }
}

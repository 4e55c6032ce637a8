// CLI commands for operating mycode
use anyhow::{Context, Result};
use mycode_common::broker::Broker;
use mycode_common::queue::{Publisher, CODE_QUEUE, RUN_QUEUE};
use mycode_common::redis::RedisBroker;
use mycode_common::types::{CodeJob, Language, Principal, SolutionTestId};
use mycode_db::{GradingStore, NewSolution, PgStore};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

async fn broker(redis_url: &str) -> Result<Arc<RedisBroker>> {
    let broker = RedisBroker::connect(redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))?;
    Ok(Arc::new(broker))
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn code_job(
    solution_test_id: SolutionTestId,
    language: Language,
    source: String,
    stdin: String,
    checker: Option<(Language, String)>,
) -> CodeJob {
    let (checker_language, checker_source) = match checker {
        Some((language, source)) => (Some(language), source),
        None => (None, String::new()),
    };
    CodeJob {
        solution_test_id,
        language,
        source,
        stdin,
        with_checker: checker_language.is_some(),
        checker_language,
        checker_source,
    }
}

pub async fn enqueue(
    redis_url: &str,
    solution_test_id: SolutionTestId,
    language: Language,
    source: &Path,
    stdin: String,
    checker: Option<(Language, PathBuf)>,
) -> Result<()> {
    let checker = match checker {
        Some((language, path)) => Some((language, read_source(&path)?)),
        None => None,
    };
    let job = code_job(solution_test_id, language, read_source(source)?, stdin, checker);

    let broker: Arc<dyn Broker> = broker(redis_url).await?;
    Publisher::<CodeJob>::new(broker)
        .publish(&job)
        .await
        .context("Failed to publish code job")?;

    info!(solution_test_id, %language, with_checker = job.with_checker, "Code job enqueued");
    println!("✅ Enqueued job for solution test {}", solution_test_id);
    Ok(())
}

pub async fn submit(redis_url: &str, database_url: &str, student: i64, exercise: i64, source: &Path) -> Result<()> {
    let solution = NewSolution {
        exercise_id: exercise,
        source: read_source(source)?,
    };

    let store = PgStore::connect(database_url, 1)
        .await
        .context("Failed to connect to database")?;
    let broker: Arc<dyn Broker> = broker(redis_url).await?;
    let publisher = Publisher::<CodeJob>::new(broker);

    let id = store
        .add_solution(&Principal::Student { id: student }, solution, &publisher)
        .await?;

    println!("✅ Solution {} submitted for exercise {}", id, exercise);
    Ok(())
}

#[derive(Debug, Serialize)]
struct QueueReport {
    queue: &'static str,
    depth: usize,
    unacked: Vec<UnackedReport>,
}

#[derive(Debug, Serialize)]
struct UnackedReport {
    consumer: String,
    depth: usize,
}

pub async fn queues(redis_url: &str) -> Result<()> {
    let broker = broker(redis_url).await?;

    let mut reports = Vec::new();
    for queue in [CODE_QUEUE, RUN_QUEUE] {
        let depth = broker.depth(queue).await?;
        let unacked = broker
            .unacked_depths(queue)
            .await?
            .into_iter()
            .map(|(consumer, depth)| UnackedReport { consumer, depth })
            .collect();
        reports.push(QueueReport { queue, depth, unacked });
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_job_without_checker() {
        let job = code_job(7, Language::Go, "package main".to_string(), "1".to_string(), None);
        assert!(!job.with_checker);
        assert_eq!(job.checker_language, None);
        assert_eq!(job.checker_source, "");
    }

    #[test]
    fn test_job_with_checker() {
        let job = code_job(
            7,
            Language::Cpp,
            "int main(){}".to_string(),
            String::new(),
            Some((Language::Python, "print('ok')".to_string())),
        );
        assert!(job.with_checker);
        assert_eq!(job.checker_language, Some(Language::Python));
        assert_eq!(job.checker_source, "print('ok')");
    }

    #[test]
    fn test_read_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "print(1)").unwrap();
        assert_eq!(read_source(file.path()).unwrap(), "print(1)");
        assert!(read_source(Path::new("/nonexistent/mycode.src")).is_err());
    }
}

use super::{submitting_student, GradingStore, NewSolution, SolutionId};
use anyhow::{anyhow, bail, Context, Result};
use bb8::{Pool, PooledConnection};
use mycode_common::queue::Publisher;
use mycode_common::types::{
    CodeJob, Language, Principal, Run, SolutionTestId, SolutionTestStatus, TestKind, TestLimits,
    TestType, Verdict,
};
use tokio_postgres::{Row, Transaction};
use tracing::{debug, info, warn};

type ConnectionManager = bb8_postgres::PostgresConnectionManager<tokio_postgres::tls::NoTls>;

#[derive(Clone)]
pub struct PgStore {
    pool: Pool<ConnectionManager>,
}

impl PgStore {
    pub async fn connect(conn_url: &str, max_connections: u32) -> Result<PgStore> {
        let conn_manager =
            ConnectionManager::new_from_stringlike(conn_url, tokio_postgres::tls::NoTls)
                .context("invalid database url")?;
        let pool = Pool::builder()
            .max_size(max_connections.max(1))
            .build(conn_manager)
            .await
            .context("cannot build postgres pool")?;
        Ok(PgStore { pool })
    }

    async fn conn(&self) -> Result<PooledConnection<'_, ConnectionManager>> {
        self.pool
            .get()
            .await
            .context("cannot obtain postgres connection")
    }

    async fn insert_solution(
        tx: &Transaction<'_>,
        student_id: i64,
        solution: &NewSolution,
        publisher: &Publisher<CodeJob>,
    ) -> Result<SolutionId> {
        let enrolled: bool = tx
            .query_one(
                "select exists (
                    select 1 from student_exercise
                    where exercise_id = $1 and student_id = $2
                )",
                &[&solution.exercise_id, &student_id],
            )
            .await
            .context("check exercise belongs to student")?
            .try_get(0)?;
        if !enrolled {
            bail!("exercise doesn't belong to student");
        }

        let solution_id: SolutionId = tx
            .query_one(
                "insert into solution (student_id, exercise_id, source)
                 values ($1, $2, $3)
                 returning id",
                &[&student_id, &solution.exercise_id, &solution.source],
            )
            .await
            .context("add solution to DB")?
            .try_get(0)?;

        let added = tx
            .execute(
                "insert into solution_test (solution_id, test_id, status)
                 select $1::bigint, id, $2::integer from test where exercise_id = $3",
                &[
                    &solution_id,
                    &SolutionTestStatus::Processing.code(),
                    &solution.exercise_id,
                ],
            )
            .await
            .context("add solution tests to DB")?;
        if added == 0 {
            bail!("exercise does not have tests");
        }

        let rows = tx
            .query(
                "select st.id, e.language, s.source, t.type,
                        t.stdin, t.checker_language, t.checker_source
                 from solution_test as st
                 join test t on st.test_id = t.id
                 join solution s on st.solution_id = s.id
                 join exercise e on s.exercise_id = e.id
                 where st.solution_id = $1",
                &[&solution_id],
            )
            .await
            .context("load solution tests")?;

        for row in rows {
            let job = code_job_from_row(&row)?;
            publisher
                .publish(&job)
                .await
                .with_context(|| format!("publish code for solution test {}", job.solution_test_id))?;
        }

        Ok(solution_id)
    }
}

fn language_from_code(code: i32) -> Result<Language> {
    Language::from_code(code).ok_or_else(|| anyhow!("unknown language code {}", code))
}

fn test_type_from_code(code: i32) -> Result<TestType> {
    TestType::from_code(code).ok_or_else(|| anyhow!("unknown test type {}", code))
}

fn code_job_from_row(row: &Row) -> Result<CodeJob> {
    let test_type = test_type_from_code(row.try_get(3)?)?;
    let checker_language: Option<i32> = row.try_get(5)?;
    let checker_source: Option<String> = row.try_get(6)?;
    Ok(CodeJob {
        solution_test_id: row.try_get(0)?,
        language: language_from_code(row.try_get(1)?)?,
        source: row.try_get(2)?,
        stdin: row.try_get(4)?,
        with_checker: test_type == TestType::Checker,
        checker_language: checker_language.map(language_from_code).transpose()?,
        checker_source: checker_source.unwrap_or_default(),
    })
}

#[async_trait::async_trait]
impl GradingStore for PgStore {
    async fn test_limits(&self, solution_test_id: SolutionTestId) -> Result<TestLimits> {
        let row = self
            .conn()
            .await?
            .query_opt(
                "select t.type, t.max_duration, t.max_memory, t.expected_stdout,
                        t.checker_language, t.checker_source
                 from solution_test as st
                 join test as t on st.test_id = t.id
                 where st.id = $1",
                &[&solution_test_id],
            )
            .await
            .context("get test from DB")?
            .ok_or_else(|| anyhow!("solution test {} not found", solution_test_id))?;

        let kind = match test_type_from_code(row.try_get(0)?)? {
            TestType::Simple => {
                let expected_stdout: Option<String> = row.try_get(3)?;
                TestKind::Simple {
                    expected_stdout: expected_stdout.unwrap_or_default(),
                }
            }
            TestType::Checker => {
                let language: Option<i32> = row.try_get(4)?;
                let source: Option<String> = row.try_get(5)?;
                TestKind::Checker {
                    language: language_from_code(
                        language.ok_or_else(|| anyhow!("checker test without checker language"))?,
                    )?,
                    source: source.unwrap_or_default(),
                }
            }
        };

        Ok(TestLimits {
            max_duration: row.try_get(1)?,
            max_memory: row.try_get(2)?,
            kind,
        })
    }

    async fn save_verdict(&self, run: &Run, limits: &TestLimits, verdict: &Verdict) -> Result<()> {
        let fails = verdict
            .recorded_fails()
            .map(serde_json::to_value)
            .transpose()
            .context("JSON marshal fails")?;
        let status = verdict.status().code();
        let conn = self.conn().await?;

        let updated = match limits.test_type() {
            TestType::Simple => {
                conn.execute(
                    "update solution_test set status = $1, duration = $2,
                        used_memory = $3, stdout = $4, stderr = $5,
                        fails = $6
                     where id = $7",
                    &[
                        &status,
                        &run.duration,
                        &run.used_memory,
                        &run.stdout,
                        &run.stderr,
                        &fails,
                        &run.solution_test_id,
                    ],
                )
                .await
            }
            TestType::Checker => {
                conn.execute(
                    "update solution_test set status = $1, duration = $2,
                        used_memory = $3, stdout = $4, stderr = $5,
                        checker_stdout = $6, checker_stderr = $7,
                        fails = $8
                     where id = $9",
                    &[
                        &status,
                        &run.duration,
                        &run.used_memory,
                        &run.stdout,
                        &run.stderr,
                        &run.checker_stdout,
                        &run.checker_stderr,
                        &fails,
                        &run.solution_test_id,
                    ],
                )
                .await
            }
        }
        .context("add solution test result to DB")?;

        if updated == 0 {
            warn!(solution_test_id = run.solution_test_id, "No solution test row updated");
        }
        debug!(solution_test_id = run.solution_test_id, status, "Verdict saved");
        Ok(())
    }

    async fn add_solution(
        &self,
        principal: &Principal,
        solution: NewSolution,
        publisher: &Publisher<CodeJob>,
    ) -> Result<SolutionId> {
        solution.validate()?;
        let student_id = submitting_student(principal)?;

        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.context("begin tx")?;

        match Self::insert_solution(&tx, student_id, &solution, publisher).await {
            Ok(solution_id) => {
                tx.commit().await.context("commit changes to DB")?;
                info!(solution_id, student_id, exercise_id = solution.exercise_id, "Solution added");
                Ok(solution_id)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    return Err(e.context(format!("failed to rollback: {}", rollback)));
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycode_common::types::SolutionTestFails;

    /// Requires a database initialised with schema.sql at $DATABASE_URL
    #[tokio::test]
    #[ignore]
    async fn test_save_verdict_round_trip() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let store = PgStore::connect(&url, 2).await.unwrap();
        let conn = store.conn().await.unwrap();

        let exercise_id: i64 = conn
            .query_one(
                "insert into exercise (teacher_id, title, language) values (1, 't', 5) returning id",
                &[],
            )
            .await
            .unwrap()
            .get(0);
        let test_id: i64 = conn
            .query_one(
                "insert into test (exercise_id, type, max_duration, max_memory, expected_stdout)
                 values ($1, 0, '2s', '50MB', '42') returning id",
                &[&exercise_id],
            )
            .await
            .unwrap()
            .get(0);
        let solution_id: i64 = conn
            .query_one(
                "insert into solution (student_id, exercise_id, source) values (1, $1, 'x') returning id",
                &[&exercise_id],
            )
            .await
            .unwrap()
            .get(0);
        let solution_test_id: i64 = conn
            .query_one(
                "insert into solution_test (solution_id, test_id, status) values ($1, $2, 0) returning id",
                &[&solution_id, &test_id],
            )
            .await
            .unwrap()
            .get(0);
        drop(conn);

        let limits = store.test_limits(solution_test_id).await.unwrap();
        assert_eq!(limits.max_duration, "2s");

        let run = Run {
            solution_test_id,
            duration: "3s".to_string(),
            stdout: "42".to_string(),
            ..Default::default()
        };
        let verdict = Verdict {
            failed: true,
            fails: SolutionTestFails {
                wrong_duration: true,
                ..Default::default()
            },
        };
        store.save_verdict(&run, &limits, &verdict).await.unwrap();

        let row = store
            .conn()
            .await
            .unwrap()
            .query_one(
                "select status, fails from solution_test where id = $1",
                &[&solution_test_id],
            )
            .await
            .unwrap();
        let status: i32 = row.get(0);
        let fails: serde_json::Value = row.get(1);
        assert_eq!(status, SolutionTestStatus::Failed.code());
        assert_eq!(fails["wrong_duration"], true);
    }
}

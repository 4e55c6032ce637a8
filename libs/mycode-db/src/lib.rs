//! Persistent side of grading: test contracts, verdicts and submissions.

mod memory;
mod pg;

pub use memory::{MemoryStore, SolutionTestRow, TestId};
pub use pg::PgStore;

use anyhow::{bail, Result};
use async_trait::async_trait;
use mycode_common::queue::Publisher;
use mycode_common::types::{CodeJob, Principal, Run, SolutionTestId, TestLimits, Verdict};

pub type ExerciseId = i64;
pub type SolutionId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSolution {
    pub exercise_id: ExerciseId,
    pub source: String,
}

impl NewSolution {
    fn validate(&self) -> Result<()> {
        if self.exercise_id == 0 {
            bail!("empty exercise_id");
        }
        if self.source.is_empty() {
            bail!("empty source");
        }
        Ok(())
    }
}

#[async_trait]
pub trait GradingStore: Send + Sync {
    /// Limits and comparison target of the test behind a solution test
    async fn test_limits(&self, solution_test_id: SolutionTestId) -> Result<TestLimits>;

    /// Records the run's measurements, outputs, status and (for failed runs)
    /// the failure flags. Checker output is stored only for checker tests.
    async fn save_verdict(&self, run: &Run, limits: &TestLimits, verdict: &Verdict) -> Result<()>;

    /// Stores a submission with one `processing` solution test per exercise
    /// test and publishes a Code job for each, all or nothing.
    async fn add_solution(
        &self,
        principal: &Principal,
        solution: NewSolution,
        publisher: &Publisher<CodeJob>,
    ) -> Result<SolutionId>;
}

/// Only students submit solutions
fn submitting_student(principal: &Principal) -> Result<i64> {
    match principal {
        Principal::Student { id } => Ok(*id),
        Principal::Teacher { .. } => bail!("only students can submit solutions"),
    }
}

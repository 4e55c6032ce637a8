/// Grading Evaluator
///
/// Pure decision logic: (run, test limits) -> verdict. Knows nothing about
/// queues, containers or storage.
///
/// **Rules:**
/// - Each failure axis is judged on its own; several may fail at once
/// - Stdout is compared literally for simple tests, no normalization
/// - A checker passes only when it prints exactly `ok`
/// - Non-empty submission stderr fails the run without setting a flag
/// - A measurement that cannot be parsed is an error, never a failing grade
use mycode_common::types::{Run, SolutionTestFails, TestKind, TestLimits, Verdict};
use mycode_common::units::{self, UnitError};
use thiserror::Error;

/// What a checker must print for the submission to pass
pub const CHECKER_OK: &str = "ok";

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("parse run duration: {0}")]
    RunDuration(#[source] UnitError),
    #[error("parse test duration: {0}")]
    TestDuration(#[source] UnitError),
    #[error("parse run used memory: {0}")]
    RunMemory(#[source] UnitError),
    #[error("parse max memory: {0}")]
    TestMemory(#[source] UnitError),
}

pub fn evaluate(run: &Run, limits: &TestLimits) -> Result<Verdict, EvaluationError> {
    let run_duration = units::parse_duration(&run.duration).map_err(EvaluationError::RunDuration)?;
    let max_duration =
        units::parse_duration(&limits.max_duration).map_err(EvaluationError::TestDuration)?;
    let run_memory = units::parse_bytes(&run.used_memory).map_err(EvaluationError::RunMemory)?;
    let max_memory = units::parse_bytes(&limits.max_memory).map_err(EvaluationError::TestMemory)?;

    let fails = SolutionTestFails {
        wrong_duration: run_duration > max_duration,
        wrong_used_memory: run_memory > max_memory,
        wrong_stdout: matches!(&limits.kind, TestKind::Simple { expected_stdout } if run.stdout != *expected_stdout),
        wrong_checker: matches!(limits.kind, TestKind::Checker { .. }) && run.checker_stdout != CHECKER_OK,
    };

    Ok(Verdict {
        failed: fails.any() || !run.stderr.is_empty(),
        fails,
    })
}

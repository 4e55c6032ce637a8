use super::{submitting_student, ExerciseId, GradingStore, NewSolution, SolutionId};
use anyhow::{anyhow, bail, Context, Result};
use mycode_common::queue::Publisher;
use mycode_common::types::{
    CodeJob, Language, Principal, Run, SolutionTestFails, SolutionTestId, SolutionTestStatus,
    TestKind, TestLimits, TestType, Verdict,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

pub type TestId = i64;

#[derive(Debug, Clone)]
struct StoredTest {
    exercise_id: ExerciseId,
    stdin: String,
    limits: TestLimits,
}

/// One row of the solution test table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolutionTestRow {
    pub solution_id: SolutionId,
    pub test_id: TestId,
    pub status: SolutionTestStatus,
    pub run: Option<Run>,
    pub fails: Option<SolutionTestFails>,
}

#[derive(Debug, Default)]
struct Tables {
    exercises: BTreeMap<ExerciseId, Language>,
    enrollments: HashSet<(i64, ExerciseId)>,
    tests: BTreeMap<TestId, StoredTest>,
    solutions: BTreeMap<SolutionId, (i64, ExerciseId, String)>,
    solution_tests: BTreeMap<SolutionTestId, SolutionTestRow>,
}

/// In-process store with the same contract as the Postgres one
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    next_id: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn add_exercise(&self, language: Language) -> ExerciseId {
        let id = self.allocate_id();
        self.lock().exercises.insert(id, language);
        id
    }

    pub fn enroll(&self, student_id: i64, exercise_id: ExerciseId) {
        self.lock().enrollments.insert((student_id, exercise_id));
    }

    pub fn add_test(&self, exercise_id: ExerciseId, stdin: &str, limits: TestLimits) -> Result<TestId> {
        limits.validate().context("invalid test limits")?;
        let id = self.allocate_id();
        self.lock().tests.insert(
            id,
            StoredTest {
                exercise_id,
                stdin: stdin.to_string(),
                limits,
            },
        );
        Ok(id)
    }

    /// Inserts a solution test for an existing test, bypassing submission
    pub fn add_solution_test(&self, test_id: TestId) -> SolutionTestId {
        let id = self.allocate_id();
        self.lock().solution_tests.insert(
            id,
            SolutionTestRow {
                solution_id: 0,
                test_id,
                status: SolutionTestStatus::Processing,
                run: None,
                fails: None,
            },
        );
        id
    }

    pub fn solution_test(&self, id: SolutionTestId) -> Option<SolutionTestRow> {
        self.lock().solution_tests.get(&id).cloned()
    }

    pub fn solution_tests_of(&self, solution_id: SolutionId) -> Vec<(SolutionTestId, SolutionTestRow)> {
        self.lock()
            .solution_tests
            .iter()
            .filter(|(_, row)| row.solution_id == solution_id)
            .map(|(id, row)| (*id, row.clone()))
            .collect()
    }

    pub fn solution_count(&self) -> usize {
        self.lock().solutions.len()
    }
}

#[async_trait::async_trait]
impl GradingStore for MemoryStore {
    async fn test_limits(&self, solution_test_id: SolutionTestId) -> Result<TestLimits> {
        let tables = self.lock();
        let row = tables
            .solution_tests
            .get(&solution_test_id)
            .ok_or_else(|| anyhow!("solution test {} not found", solution_test_id))?;
        let test = tables
            .tests
            .get(&row.test_id)
            .ok_or_else(|| anyhow!("test {} not found", row.test_id))?;
        Ok(test.limits.clone())
    }

    async fn save_verdict(&self, run: &Run, limits: &TestLimits, verdict: &Verdict) -> Result<()> {
        let mut tables = self.lock();
        let row = tables
            .solution_tests
            .get_mut(&run.solution_test_id)
            .ok_or_else(|| anyhow!("solution test {} not found", run.solution_test_id))?;

        let mut stored = run.clone();
        if limits.test_type() == TestType::Simple {
            stored.checker_stdout.clear();
            stored.checker_stderr.clear();
        }
        row.status = verdict.status();
        row.run = Some(stored);
        row.fails = verdict.recorded_fails();
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

        // Rows are staged and only become visible once every job is published.
        let (language, tests) = {
            let tables = self.lock();
            if !tables.enrollments.contains(&(student_id, solution.exercise_id)) {
                bail!("exercise doesn't belong to student");
            }
            let language = *tables
                .exercises
                .get(&solution.exercise_id)
                .ok_or_else(|| anyhow!("exercise {} not found", solution.exercise_id))?;
            let tests: Vec<(TestId, StoredTest)> = tables
                .tests
                .iter()
                .filter(|(_, t)| t.exercise_id == solution.exercise_id)
                .map(|(id, t)| (*id, t.clone()))
                .collect();
            (language, tests)
        };
        if tests.is_empty() {
            bail!("exercise does not have tests");
        }

        let solution_id = self.allocate_id();
        let mut staged = Vec::with_capacity(tests.len());
        for (test_id, test) in tests {
            let solution_test_id = self.allocate_id();
            let (with_checker, checker_language, checker_source) = match test.limits.kind {
                TestKind::Simple { .. } => (false, None, String::new()),
                TestKind::Checker { language, source } => (true, Some(language), source),
            };
            let job = CodeJob {
                solution_test_id,
                language,
                source: solution.source.clone(),
                stdin: test.stdin,
                with_checker,
                checker_language,
                checker_source,
            };
            publisher
                .publish(&job)
                .await
                .with_context(|| format!("publish code for solution test {}", solution_test_id))?;
            staged.push((solution_test_id, test_id));
        }

        let mut tables = self.lock();
        tables.solutions.insert(
            solution_id,
            (student_id, solution.exercise_id, solution.source),
        );
        for (solution_test_id, test_id) in staged {
            tables.solution_tests.insert(
                solution_test_id,
                SolutionTestRow {
                    solution_id,
                    test_id,
                    status: SolutionTestStatus::Processing,
                    run: None,
                    fails: None,
                },
            );
        }
        Ok(solution_id)
    }
}

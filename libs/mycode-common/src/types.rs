use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::units::{self, UnitError};

/// Durable correlation key threading a job through both queues
pub type SolutionTestId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
    Go,
    Java,
    Pascal,
    Python,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::C,
        Language::Cpp,
        Language::Go,
        Language::Java,
        Language::Pascal,
        Language::Python,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Go => "go",
            Language::Java => "java",
            Language::Pascal => "pascal",
            Language::Python => "python",
        }
    }

    /// Numeric code used by the relational store
    pub fn code(&self) -> i32 {
        match self {
            Language::C => 0,
            Language::Cpp => 1,
            Language::Go => 2,
            Language::Java => 3,
            Language::Pascal => 4,
            Language::Python => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Language> {
        Language::ALL.iter().copied().find(|l| l.code() == code)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| UnknownLanguage(s.to_string()))
    }
}

/// One compile-and-run request travelling on the `code` queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeJob {
    pub solution_test_id: SolutionTestId,
    pub language: Language,
    pub source: String,
    pub stdin: String,
    pub with_checker: bool,
    pub checker_language: Option<Language>,
    pub checker_source: String,
}

impl CodeJob {
    /// The checker pass of this job: the checker program reading the
    /// submission's stdout. `None` when the job carries no checker.
    pub fn checker_job(&self, submission_stdout: &str) -> Option<CodeJob> {
        if !self.with_checker {
            return None;
        }
        let language = self.checker_language?;
        Some(CodeJob {
            solution_test_id: self.solution_test_id,
            language,
            source: self.checker_source.clone(),
            stdin: submission_stdout.to_string(),
            with_checker: false,
            checker_language: None,
            checker_source: String::new(),
        })
    }
}

/// Structured record the launcher writes to the container's stdout.
///
/// Missing fields decode as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionRecord {
    pub duration: String,
    pub used_memory: String,
    pub stdout: String,
    pub stderr: String,
}

/// Execution result travelling on the `run` queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub solution_test_id: SolutionTestId,
    pub duration: String,
    pub used_memory: String,
    pub stdout: String,
    pub stderr: String,
    pub checker_stdout: String,
    pub checker_stderr: String,
}

impl Run {
    pub fn from_record(solution_test_id: SolutionTestId, record: ExecutionRecord) -> Self {
        Run {
            solution_test_id,
            duration: record.duration,
            used_memory: record.used_memory,
            stdout: record.stdout,
            stderr: record.stderr,
            checker_stdout: String::new(),
            checker_stderr: String::new(),
        }
    }

    /// Folds a checker pass into this run. Only the checker's output is
    /// kept; its duration and memory are discarded.
    pub fn merge_checker(&mut self, checker: ExecutionRecord) {
        self.checker_stdout = checker.stdout;
        self.checker_stderr = checker.stderr;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Simple,
    Checker,
}

impl TestType {
    pub fn code(&self) -> i32 {
        match self {
            TestType::Simple => 0,
            TestType::Checker => 1,
        }
    }

    pub fn from_code(code: i32) -> Option<TestType> {
        match code {
            0 => Some(TestType::Simple),
            1 => Some(TestType::Checker),
            _ => None,
        }
    }
}

/// What a test compares the submission against. A simple test always has
/// an expected stdout and never a checker; a checker test the reverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestKind {
    Simple { expected_stdout: String },
    Checker { language: Language, source: String },
}

/// Pass/fail contract of one exercise test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLimits {
    pub max_duration: String,
    pub max_memory: String,
    pub kind: TestKind,
}

impl TestLimits {
    pub fn test_type(&self) -> TestType {
        match self.kind {
            TestKind::Simple { .. } => TestType::Simple,
            TestKind::Checker { .. } => TestType::Checker,
        }
    }

    /// Rejects limits the evaluator would fail to parse later.
    pub fn validate(&self) -> Result<(), UnitError> {
        units::parse_duration(&self.max_duration)?;
        units::parse_bytes(&self.max_memory)?;
        Ok(())
    }
}

/// Independent failure axes of one graded run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolutionTestFails {
    pub wrong_duration: bool,
    pub wrong_used_memory: bool,
    pub wrong_stdout: bool,
    pub wrong_checker: bool,
}

impl SolutionTestFails {
    pub fn any(&self) -> bool {
        self.wrong_duration || self.wrong_used_memory || self.wrong_stdout || self.wrong_checker
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolutionTestStatus {
    Processing,
    Failed,
    Succeed,
}

impl SolutionTestStatus {
    pub fn code(&self) -> i32 {
        match self {
            SolutionTestStatus::Processing => 0,
            SolutionTestStatus::Failed => 1,
            SolutionTestStatus::Succeed => 2,
        }
    }
}

/// Outcome of grading one run.
///
/// `failed` can be true with every flag clear: a run that wrote to stderr
/// fails without a dedicated flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub failed: bool,
    pub fails: SolutionTestFails,
}

impl Verdict {
    pub fn status(&self) -> SolutionTestStatus {
        if self.failed {
            SolutionTestStatus::Failed
        } else {
            SolutionTestStatus::Succeed
        }
    }

    /// Flags as persisted: present only for a failed run
    pub fn recorded_fails(&self) -> Option<SolutionTestFails> {
        self.failed.then_some(self.fails)
    }
}

/// Authenticated caller, passed explicitly to operations that need one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    Student { id: i64 },
    Teacher { id: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(with_checker: bool) -> CodeJob {
        CodeJob {
            solution_test_id: 7,
            language: Language::Cpp,
            source: "int main() {}".to_string(),
            stdin: "1 2".to_string(),
            with_checker,
            checker_language: Some(Language::Python),
            checker_source: "print('ok')".to_string(),
        }
    }

    #[test]
    fn test_language_round_trips_through_name() {
        for language in Language::ALL {
            assert_eq!(language.to_string().parse::<Language>().unwrap(), language);
            assert_eq!(Language::from_code(language.code()), Some(language));
        }
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn test_checker_job_feeds_submission_stdout() {
        let checker = job(true).checker_job("3\n").unwrap();
        assert_eq!(checker.language, Language::Python);
        assert_eq!(checker.source, "print('ok')");
        assert_eq!(checker.stdin, "3\n");
        assert_eq!(checker.solution_test_id, 7);
        assert!(!checker.with_checker);
    }

    #[test]
    fn test_no_checker_job_without_flag() {
        assert!(job(false).checker_job("3").is_none());
    }

    #[test]
    fn test_merge_checker_discards_checker_measurements() {
        let mut run = Run::from_record(
            7,
            ExecutionRecord {
                duration: "1.1s".to_string(),
                used_memory: "3MB".to_string(),
                stdout: "42".to_string(),
                stderr: String::new(),
            },
        );
        run.merge_checker(ExecutionRecord {
            duration: "9s".to_string(),
            used_memory: "90MB".to_string(),
            stdout: "ok".to_string(),
            stderr: "warn".to_string(),
        });
        assert_eq!(run.duration, "1.1s");
        assert_eq!(run.used_memory, "3MB");
        assert_eq!(run.checker_stdout, "ok");
        assert_eq!(run.checker_stderr, "warn");
    }

    #[test]
    fn test_execution_record_tolerates_missing_fields() {
        let record: ExecutionRecord = serde_json::from_str(r#"{"stdout":"hi"}"#).unwrap();
        assert_eq!(record.stdout, "hi");
        assert_eq!(record.stderr, "");
        assert_eq!(record.duration, "");
    }

    #[test]
    fn test_validate_limits() {
        let mut limits = TestLimits {
            max_duration: "2s".to_string(),
            max_memory: "50MB".to_string(),
            kind: TestKind::Simple {
                expected_stdout: "42".to_string(),
            },
        };
        assert!(limits.validate().is_ok());
        limits.max_memory = "fifty".to_string();
        assert!(limits.validate().is_err());
    }
}

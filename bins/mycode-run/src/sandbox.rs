use lazy_regex::{lazy_regex, Lazy, Regex};
use std::path::Path;
use thiserror::Error;

pub const ISOLATOR: &str = "/usr/bin/nsjail";
pub const TIME_UTILITY: &str = "/usr/bin/time";

/// Address-space ceiling handed to the isolator: 100 GiB.
pub const MEMORY_LIMIT_BYTES: u64 = 107_374_182_400;

/// Unprivileged identity the program runs as
pub const SANDBOX_UID: u32 = 99999;
pub const SANDBOX_GID: u32 = 99999;

const SHARED_READ_ONLY: [&str; 3] = ["/lib", "/usr/lib", TIME_UTILITY];

static RE_EXITED_WITH_STATUS: Lazy<Regex> = lazy_regex!(r"exited with status");
static RE_TIME_BANNER: Lazy<Regex> = lazy_regex!(r"Executing '/usr/bin/time' for");

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiagnosticsError {
    #[error("expected at least 3 diagnostic lines, got {0}")]
    TooShort(usize),
    #[error("no memory line after the execution banner")]
    NoMemoryLine,
    #[error("parse memory usage {line:?}: {source}")]
    Memory {
        line: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// What the program wrote to stderr, with the isolator's chatter removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub stderr: String,
    pub memory_kb: u64,
}

/// Isolator arguments wrapping `run_command` in the measurement utility
pub fn isolator_args(source_path: &Path, extra_binds: &[String], run_command: &[String]) -> Vec<String> {
    let source_path = source_path.display().to_string();
    let mut args = vec![
        "--max_cpus".to_string(),
        "1".to_string(),
        "--rlimit_as".to_string(),
        MEMORY_LIMIT_BYTES.to_string(),
        "--user".to_string(),
        SANDBOX_UID.to_string(),
        "--group".to_string(),
        SANDBOX_GID.to_string(),
    ];
    for path in SHARED_READ_ONLY.iter().copied().chain(extra_binds.iter().map(String::as_str)) {
        args.push("--bindmount_ro".to_string());
        args.push(path.to_string());
    }
    args.extend([
        "--bindmount".to_string(),
        source_path.clone(),
        "--cwd".to_string(),
        source_path,
        "--".to_string(),
        TIME_UTILITY.to_string(),
        "-q".to_string(),
        "-f".to_string(),
        "%M".to_string(),
        "--".to_string(),
    ]);
    args.extend(run_command.iter().cloned());
    args
}

/// True when the isolator's last line reports the program's own exit, so a
/// non-zero isolator status is an ordinary program failure.
pub fn exited_with_status(diagnostics: &str) -> bool {
    diagnostics
        .trim()
        .lines()
        .last()
        .map_or(false, |line| RE_EXITED_WITH_STATUS.is_match(line))
}

/// Splits the isolator's stderr into the program's stderr and the peak
/// memory (kilobytes) the measurement utility printed last.
pub fn parse_diagnostics(diagnostics: &str) -> Result<Diagnostics, DiagnosticsError> {
    let mut lines: Vec<&str> = diagnostics.trim().lines().collect();
    if lines.len() < 3 {
        return Err(DiagnosticsError::TooShort(lines.len()));
    }

    if lines.last().map_or(false, |l| RE_EXITED_WITH_STATUS.is_match(l)) {
        lines.pop();
    }
    if let Some(banner) = lines.iter().position(|l| RE_TIME_BANNER.is_match(l)) {
        lines.drain(..=banner);
    }

    // The utility writes the memory on a line of its own. A program stderr
    // without a trailing newline runs into it and the block is rejected.
    let memory_line = lines.pop().ok_or(DiagnosticsError::NoMemoryLine)?;
    let memory_kb = memory_line
        .trim()
        .parse::<u64>()
        .map_err(|source| DiagnosticsError::Memory {
            line: memory_line.to_string(),
            source,
        })?;

    Ok(Diagnostics {
        stderr: lines.join("\n"),
        memory_kb,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycode_common::units::format_kilobytes;
    use std::path::PathBuf;

    #[test]
    fn test_banner_and_noise_are_stripped() {
        let block = [
            "ignored banner",
            "Executing '/usr/bin/time' for '/usr/bin/time -q -f %M -- ./a.out'",
            "real stderr line",
            "4096",
        ]
        .join("\n");

        let parsed = parse_diagnostics(&block).unwrap();

        assert_eq!(parsed.stderr, "real stderr line");
        assert_eq!(parsed.memory_kb, 4096);
        assert_eq!(format_kilobytes(parsed.memory_kb), "4MB");
    }

    #[test]
    fn test_exit_status_line_is_dropped() {
        let block = "[I] Mode: STANDALONE_ONCE\n\
                     [I] Executing '/usr/bin/time' for '/usr/bin/time -q -f %M -- ./main'\n\
                     panic: boom\n\
                     goroutine 1\n\
                     1532\n\
                     [I] pid=12 ([STANDALONE MODE]) exited with status: 2, (PIDs left: 0)\n";

        let parsed = parse_diagnostics(block).unwrap();

        assert_eq!(parsed.stderr, "panic: boom\ngoroutine 1");
        assert_eq!(parsed.memory_kb, 1532);
    }

    #[test]
    fn test_no_banner_keeps_leading_lines() {
        let parsed = parse_diagnostics("warning one\nwarning two\n800").unwrap();
        assert_eq!(parsed.stderr, "warning one\nwarning two");
        assert_eq!(parsed.memory_kb, 800);
    }

    #[test]
    fn test_short_block_is_rejected() {
        assert_eq!(parse_diagnostics("a\n12"), Err(DiagnosticsError::TooShort(2)));
    }

    #[test]
    fn test_non_integer_memory_is_rejected() {
        let err = parse_diagnostics("x\nExecuting '/usr/bin/time' for y\nnot a number").unwrap_err();
        assert!(matches!(err, DiagnosticsError::Memory { .. }));
    }

    #[test]
    fn test_stderr_without_trailing_newline_is_rejected() {
        let block = "x\nExecuting '/usr/bin/time' for y\nabc4096";
        match parse_diagnostics(block) {
            Err(DiagnosticsError::Memory { line, .. }) => assert_eq!(line, "abc4096"),
            other => panic!("expected a memory error, got {:?}", other),
        }
    }

    #[test]
    fn test_nothing_after_banner_is_rejected() {
        let block = "a\nb\nExecuting '/usr/bin/time' for x";
        assert_eq!(parse_diagnostics(block), Err(DiagnosticsError::NoMemoryLine));
    }

    #[test]
    fn test_exited_with_status_checks_last_line_only() {
        assert!(exited_with_status("a\nb\npid=3 exited with status: 1\n"));
        assert!(!exited_with_status("pid=3 exited with status: 1\nkilled by signal 9"));
        assert!(!exited_with_status(""));
    }

    #[test]
    fn test_isolator_args_layout() {
        let args = isolator_args(
            &PathBuf::from("/python"),
            &["/usr/bin/python3".to_string()],
            &["python3".to_string(), "main.py".to_string()],
        );

        assert_eq!(&args[..4], &["--max_cpus", "1", "--rlimit_as", "107374182400"]);
        let binds: Vec<&str> = args
            .windows(2)
            .filter(|w| w[0] == "--bindmount_ro")
            .map(|w| w[1].as_str())
            .collect();
        assert_eq!(binds, ["/lib", "/usr/lib", "/usr/bin/time", "/usr/bin/python3"]);
        let expected_tail = [
            "--bindmount", "/python", "--cwd", "/python", "--", "/usr/bin/time", "-q", "-f", "%M",
            "--", "python3", "main.py",
        ];
        assert!(args.ends_with(&expected_tail.map(String::from)));
    }
}

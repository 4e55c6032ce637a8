//! Container entrypoint: compiles a submission and runs it under the
//! isolator, then prints exactly one execution record to stdout.
//!
//! Logs go to stderr as JSON; stdout belongs to the record.

mod preparator;
mod sandbox;

use anyhow::{bail, Context, Result};
use clap::Parser;
use mycode_common::types::{ExecutionRecord, Language};
use mycode_common::units::{format_duration, format_kilobytes};
use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::{ExitCode, Stdio};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Exit status when the submission does not compile; a record with the
/// compiler output is still printed.
const COMPILE_FAILED_EXIT: u8 = 3;

/// Position of the stdin text on the command line
const STDIN_ARG: usize = 3;

#[derive(Parser, Debug)]
#[command(
    name = "mycode-run",
    about = "Compile and run one submission inside the sandbox",
    override_usage = "mycode-run <LANGUAGE> <SOURCE_PATH> [STDIN]"
)]
struct Args {
    /// Language name (c, cpp, go, java, pascal, python)
    language: Language,

    /// File holding the submitted source
    source_path: PathBuf,

    /// Text fed to the program's standard input
    #[arg(skip)]
    stdin: String,
}

impl Args {
    /// Parses the language and source path with clap. The stdin text is
    /// taken verbatim: it may be `--`, `-h` or anything else a test feeds.
    fn parse_from_argv<I, T>(argv: I) -> Result<Args, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let mut argv: Vec<OsString> = argv.into_iter().map(Into::into).collect();
        let stdin = if argv.len() > STDIN_ARG {
            argv.remove(STDIN_ARG).to_string_lossy().into_owned()
        } else {
            String::new()
        };
        argv.truncate(STDIN_ARG);

        let mut args = Args::try_parse_from(argv)?;
        args.stdin = stdin;
        Ok(args)
    }
}

enum Outcome {
    Completed,
    CompileFailed,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .json()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = match Args::parse_from_argv(std::env::args_os()) {
        Ok(args) => args,
        Err(e) => e.exit(),
    };
    let language = args.language;

    match launch(args).await {
        Ok(Outcome::Completed) => ExitCode::SUCCESS,
        Ok(Outcome::CompileFailed) => ExitCode::from(COMPILE_FAILED_EXIT),
        Err(e) => {
            error!(%language, error = format!("{:#}", e), "Launch failed");
            ExitCode::FAILURE
        }
    }
}

async fn launch(args: Args) -> Result<Outcome> {
    let source = tokio::fs::read_to_string(&args.source_path)
        .await
        .with_context(|| format!("read source {}", args.source_path.display()))?;

    let recipe = preparator::prepare(args.language, &source).context("prepare run")?;
    let src_path = recipe.source_path().to_path_buf();
    info!(language = %args.language, src_path = %src_path.display(), "Source prepared");

    let compile = recipe.compile_command();
    if let Some((program, rest)) = compile.split_first() {
        let output = Command::new(program)
            .args(rest)
            .current_dir(&src_path)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawn compiler {}", program))?;

        if !output.status.success() {
            warn!(language = %args.language, status = %output.status, "Compilation failed");
            print_record(&ExecutionRecord {
                duration: String::new(),
                used_memory: String::new(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })?;
            return Ok(Outcome::CompileFailed);
        }
        debug!(language = %args.language, "Compiled");
    }

    let run_command = recipe.run_command().context("resolve run command")?;
    if run_command.is_empty() {
        bail!("empty run command for {}", args.language);
    }

    let isolator_args = sandbox::isolator_args(&src_path, recipe.extra_binds(), &run_command);
    let mut child = Command::new(sandbox::ISOLATOR)
        .args(&isolator_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn isolator")?;

    let start = Instant::now();

    // Fed concurrently so a program that writes before reading cannot
    // deadlock against a full stdin pipe.
    let feeder = child.stdin.take().map(|mut pipe| {
        let input = args.stdin.into_bytes();
        tokio::spawn(async move {
            // A program may exit without reading its input.
            if let Err(e) = pipe.write_all(&input).await {
                debug!(error = %e, "Stdin not fully consumed");
            }
        })
    });

    let output = child.wait_with_output().await.context("wait for isolator")?;
    let duration = start.elapsed();
    if let Some(feeder) = feeder {
        let _ = feeder.await;
    }

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let diagnostics = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() && !sandbox::exited_with_status(&diagnostics) {
        error!(
            status = %output.status,
            stdout = %stdout,
            stderr = %diagnostics,
            "Isolator failed"
        );
        bail!("isolator failed with {}", output.status);
    }

    let parsed = sandbox::parse_diagnostics(&diagnostics).context("parse isolator stderr")?;

    print_record(&ExecutionRecord {
        duration: format_duration(duration),
        used_memory: format_kilobytes(parsed.memory_kb),
        stdout,
        stderr: parsed.stderr,
    })?;

    info!(
        language = %args.language,
        duration_ms = duration.as_millis() as u64,
        memory_kb = parsed.memory_kb,
        "Run completed"
    );
    Ok(Outcome::Completed)
}

fn print_record(record: &ExecutionRecord) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, record).context("JSON marshal record to stdout")?;
    stdout.flush().context("flush stdout")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_accept_dashed_stdin() {
        let args = Args::parse_from_argv(["mycode-run", "go", "/tmp/src", "-5 3"]).unwrap();
        assert_eq!(args.language, Language::Go);
        assert_eq!(args.source_path, PathBuf::from("/tmp/src"));
        assert_eq!(args.stdin, "-5 3");
    }

    #[test]
    fn test_flag_like_stdin_is_passed_verbatim() {
        for stdin in ["--", "-h", "--help", "--version", "-", "-- 1 2"] {
            let args = Args::parse_from_argv(["mycode-run", "c", "/tmp/src", stdin]).unwrap();
            assert_eq!(args.language, Language::C);
            assert_eq!(args.stdin, stdin);
        }
    }

    #[test]
    fn test_multiline_stdin_is_kept() {
        let args = Args::parse_from_argv(["mycode-run", "python", "/tmp/src", "3\n1 2 3\n"]).unwrap();
        assert_eq!(args.stdin, "3\n1 2 3\n");
    }

    #[test]
    fn test_stdin_defaults_to_empty() {
        let args = Args::parse_from_argv(["mycode-run", "python", "/tmp/src"]).unwrap();
        assert_eq!(args.stdin, "");
    }

    #[test]
    fn test_unknown_language_is_rejected() {
        assert!(Args::parse_from_argv(["mycode-run", "cobol", "/tmp/src", "1"]).is_err());
    }

    #[test]
    fn test_missing_source_path_is_rejected() {
        assert!(Args::parse_from_argv(["mycode-run", "c"]).is_err());
    }
}

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mycode_common::config::{init_tracing, LogFormat, DEFAULT_REDIS_URL};
use mycode_common::types::{Language, SolutionTestId};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mycode-cli")]
#[command(about = "mycode CLI - Submit solutions and inspect the job queues", long_about = None)]
struct Cli {
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL, global = true)]
    redis_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a code job directly, bypassing the database
    Enqueue {
        /// Correlation id carried through to the run queue
        #[arg(long)]
        solution_test_id: SolutionTestId,

        #[arg(short, long)]
        language: Language,

        /// File holding the source
        #[arg(short, long)]
        source: PathBuf,

        #[arg(long, default_value = "")]
        stdin: String,

        #[arg(long, requires = "checker_source")]
        checker_language: Option<Language>,

        #[arg(long, requires = "checker_language")]
        checker_source: Option<PathBuf>,
    },

    /// Store a solution as a student and queue one job per exercise test
    Submit {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,

        /// Submitting student's id
        #[arg(long)]
        student: i64,

        #[arg(short, long)]
        exercise: i64,

        /// File holding the source
        #[arg(short, long)]
        source: PathBuf,
    },

    /// Show queue depths, unacknowledged deliveries included
    Queues,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(LogFormat::from_env());
    let cli = Cli::parse();

    match cli.command {
        Commands::Enqueue {
            solution_test_id,
            language,
            source,
            stdin,
            checker_language,
            checker_source,
        } => {
            let checker = match (checker_language, checker_source) {
                (Some(language), Some(path)) => Some((language, path)),
                _ => None,
            };
            commands::enqueue(&cli.redis_url, solution_test_id, language, &source, stdin, checker).await?;
        }
        Commands::Submit {
            database_url,
            student,
            exercise,
            source,
        } => {
            commands::submit(&cli.redis_url, &database_url, student, exercise, &source).await?;
        }
        Commands::Queues => {
            commands::queues(&cli.redis_url).await?;
        }
    }

    Ok(())
}

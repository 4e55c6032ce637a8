// Grader configuration from command line / environment
use anyhow::{bail, Result};
use clap::Parser;
use mycode_common::config::{DEFAULT_PARALLELISM, DEFAULT_REDIS_URL};
use std::net::SocketAddr;

#[derive(Parser, Debug, Clone)]
#[command(name = "mycode-grader", about = "Grades execution results and stores verdicts")]
pub struct GraderConfig {
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Runs graded at once
    #[arg(long, env = "RUN_HANDLING_PARALLELISM", default_value_t = DEFAULT_PARALLELISM)]
    pub run_handling_parallelism: usize,

    #[arg(long, env = "STATUS_ADDRESS")]
    pub status_address: Option<SocketAddr>,

    #[arg(long, env = "CONSUMER_NAME")]
    pub consumer_name: Option<String>,
}

impl GraderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run_handling_parallelism == 0 {
            bail!("run handling parallelism must be greater than zero");
        }
        Ok(())
    }

    /// One connection per concurrently graded run
    pub fn max_db_connections(&self) -> u32 {
        u32::try_from(self.run_handling_parallelism).unwrap_or(u32::MAX)
    }
}

mod config;
mod evaluator;
mod grader;

use anyhow::Context;
use clap::Parser;
use config::GraderConfig;
use grader::RunGrader;
use mycode_common::broker::Broker;
use mycode_common::config::{consumer_name, init_tracing, LogFormat, FETCH_POLL_INTERVAL};
use mycode_common::consumer::{Consumer, ConsumerOptions};
use mycode_common::redis::RedisBroker;
use mycode_common::shutdown::shutdown_signal;
use mycode_common::status::{self, StatusState};
use mycode_common::types::Run;
use mycode_db::PgStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::from_env());

    let config = GraderConfig::parse();
    config.validate()?;

    info!("mycode grader booting...");

    let store = PgStore::connect(&config.database_url, config.max_db_connections())
        .await
        .context("Failed to connect to database")?;
    info!("Connected to database");

    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(&config.redis_url)
            .await
            .context("Failed to connect to Redis")?,
    );
    info!("Connected to Redis: {}", config.redis_url);

    let status_listener = match config.status_address {
        Some(addr) => Some(
            status::bind(addr)
                .await
                .context("Failed to bind status address")?,
        ),
        None => None,
    };

    let consumer = Consumer::start::<Run, _>(
        broker,
        Arc::new(RunGrader::new(Arc::new(store))),
        ConsumerOptions {
            consumer_name: consumer_name("grader", config.consumer_name.clone()),
            prefetch: config.run_handling_parallelism,
            poll_interval: FETCH_POLL_INTERVAL,
        },
    )
    .await
    .context("Failed to start run consumer")?;

    let shutdown = CancellationToken::new();
    let status_server = status_listener.map(|listener| {
        let state = StatusState::new(vec![consumer.stats()]);
        tokio::spawn(status::serve(listener, state, shutdown.clone()))
    });

    info!("Ready to grade runs");

    shutdown_signal().await;
    warn!("Received shutdown signal, draining in-flight runs...");

    consumer.close().await;
    shutdown.cancel();
    if let Some(server) = status_server {
        match server.await {
            Ok(Err(e)) => error!(error = %e, "Status server failed"),
            Err(e) => error!(error = %e, "Status server panicked"),
            Ok(Ok(())) => {}
        }
    }

    info!("Grader shutdown complete");
    Ok(())
}

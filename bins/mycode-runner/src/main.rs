mod config;
mod engine;
mod executor;

use anyhow::Context;
use clap::Parser;
use config::{LanguageConfigManager, RunnerConfig};
use engine::DockerEngine;
use executor::CodeRunner;
use mycode_common::broker::Broker;
use mycode_common::config::{consumer_name, init_tracing, LogFormat, FETCH_POLL_INTERVAL};
use mycode_common::consumer::{Consumer, ConsumerOptions};
use mycode_common::queue::Publisher;
use mycode_common::redis::RedisBroker;
use mycode_common::shutdown::shutdown_signal;
use mycode_common::status::{self, StatusState};
use mycode_common::types::CodeJob;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::from_env());

    let config = RunnerConfig::parse();
    config.validate()?;

    info!("mycode runner booting...");

    // Load language configurations
    let languages = LanguageConfigManager::load(&config.languages_config).map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        e
    })?;
    info!("Loaded images for: {:?}", languages.list_languages());

    let engine = DockerEngine::connect(
        &config.docker_host,
        languages,
        config.launcher.clone(),
        config.source_dir(),
    )?;
    engine.ping().await?;
    info!("Connected to Docker: {}", config.docker_host);

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

    let runner = Arc::new(CodeRunner::new(Arc::new(engine), Publisher::new(broker.clone())));
    let consumer = Consumer::start::<CodeJob, _>(
        broker,
        runner,
        ConsumerOptions {
            consumer_name: consumer_name("runner", config.consumer_name.clone()),
            prefetch: config.code_handling_parallelism,
            poll_interval: FETCH_POLL_INTERVAL,
        },
    )
    .await
    .context("Failed to start code consumer")?;

    let shutdown = CancellationToken::new();
    let status_server = status_listener.map(|listener| {
        let state = StatusState::new(vec![consumer.stats()]);
        tokio::spawn(status::serve(listener, state, shutdown.clone()))
    });

    info!("Ready to accept jobs");

    shutdown_signal().await;
    warn!("Received shutdown signal, draining in-flight jobs...");

    consumer.close().await;
    shutdown.cancel();
    if let Some(server) = status_server {
        match server.await {
            Ok(Err(e)) => error!(error = %e, "Status server failed"),
            Err(e) => error!(error = %e, "Status server panicked"),
            Ok(Ok(())) => {}
        }
    }

    info!("Runner shutdown complete");
    Ok(())
}

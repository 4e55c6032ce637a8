/// Execution Engine - runs one program inside a job container
///
/// The engine knows how to get a source file into a sandboxed container and
/// read back the launcher's execution record. It knows nothing about
/// checkers or grading; the executor composes engine calls into a job.
use crate::config::LanguageConfigManager;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use mycode_common::types::{ExecutionRecord, Language};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Hard deadline for one container, compile included
pub const CONTAINER_TIMEOUT: Duration = Duration::from_secs(60);

/// Exit status the launcher uses when the submission does not compile
const LAUNCHER_COMPILE_FAILED: i64 = 3;

#[async_trait]
pub trait ExecutionEngine: Send + Sync + 'static {
    /// Compiles and runs `source` with `stdin`, returning the launcher's record
    async fn execute(&self, language: Language, source: &str, stdin: &str) -> Result<ExecutionRecord>;
}

/// Output captured from a finished container
struct ContainerOutput {
    exit_code: i64,
    stdout: String,
    stderr: String,
}

/// Label carrying the host path of the source a container was created for
pub const SOURCE_LABEL: &str = "mycode.source";

/// Container runtime operations the engine drives, one call per step of a
/// container's life.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Pulls `image` unless it is already present
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Returns the new container's id
    async fn create(&self, name: &str, config: Config<String>) -> Result<String>;

    async fn start(&self, container_id: &str) -> Result<()>;

    /// Resolves with the exit code once the container is no longer running
    async fn wait(&self, container_id: &str) -> Result<i64>;

    /// Demultiplexed (stdout, stderr) of a stopped container
    async fn logs(&self, container_id: &str) -> Result<(String, String)>;

    /// Force-removes the container, running or not
    async fn remove(&self, container_id: &str) -> Result<()>;
}

#[async_trait]
impl ContainerRuntime for Docker {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    async fn create(&self, name: &str, config: Config<String>) -> Result<String> {
        let options = CreateContainerOptions {
            name,
            platform: None,
        };
        let container = self
            .create_container(Some(options), config)
            .await
            .context("Failed to create Docker container")?;
        Ok(container.id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")
    }

    async fn wait(&self, container_id: &str) -> Result<i64> {
        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.wait_container(container_id, Some(wait_options));

        match wait_stream.next().await {
            None => bail!("no wait response from container"),
            Some(Ok(response)) => {
                if let Some(error) = response.error.and_then(|e| e.message) {
                    bail!("container wait error: {}", error);
                }
                Ok(response.status_code)
            }
            // bollard reports a non-zero exit as a wait error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { error, code })) => {
                if !error.is_empty() {
                    debug!(container_id, error = %error, "Wait reported error");
                }
                Ok(code)
            }
            Some(Err(e)) => Err(anyhow!(e).context("Failed to wait for container")),
        }
    }

    async fn logs(&self, container_id: &str) -> Result<(String, String)> {
        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        });
        let mut logs = Docker::logs(self, container_id, logs_options);
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(output) = logs.next().await {
            match output.context("Failed to read container logs")? {
                LogOutput::StdOut { message } => stdout.push_str(&String::from_utf8_lossy(&message)),
                LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                _ => {}
            }
        }
        Ok((stdout, stderr))
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.remove_container(container_id, Some(options))
            .await
            .context("Failed to remove container")
    }
}

/// Container-based engine.
///
/// Containers are privileged (the isolator inside needs namespaces) and have
/// no network. The source is bind-mounted read-only at the same path it has
/// on the host. Whatever happens after the source file is written, the
/// container and the file are removed before `execute` returns.
pub struct DockerEngine<R = Docker> {
    runtime: R,
    languages: LanguageConfigManager,
    launcher: String,
    source_dir: PathBuf,
    timeout: Duration,
}

impl DockerEngine<Docker> {
    pub fn connect(
        docker_host: &str,
        languages: LanguageConfigManager,
        launcher: String,
        source_dir: PathBuf,
    ) -> Result<Self> {
        let docker = if docker_host.starts_with("unix://") {
            Docker::connect_with_unix(docker_host, 120, bollard::API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(docker_host, 120, bollard::API_DEFAULT_VERSION)
        }
        .with_context(|| format!("Failed to connect to Docker daemon at {}", docker_host))?;

        Ok(DockerEngine::with_runtime(docker, languages, launcher, source_dir))
    }

    pub async fn ping(&self) -> Result<()> {
        self.runtime.ping().await.context("Docker daemon not reachable")?;
        Ok(())
    }
}

impl<R: ContainerRuntime> DockerEngine<R> {
    pub fn with_runtime(
        runtime: R,
        languages: LanguageConfigManager,
        launcher: String,
        source_dir: PathBuf,
    ) -> Self {
        DockerEngine {
            runtime,
            languages,
            launcher,
            source_dir,
            timeout: CONTAINER_TIMEOUT,
        }
    }

    /// Replaces the [`CONTAINER_TIMEOUT`] deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn write_source(&self, source: &str) -> Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("mycode-")
            .suffix(".src")
            .tempfile_in(&self.source_dir)
            .with_context(|| format!("create source file in {}", self.source_dir.display()))?;
        file.write_all(source.as_bytes()).context("write source file")?;
        file.flush().context("flush source file")?;
        Ok(file)
    }

    fn container_config(&self, image: &str, language: Language, src_path: &str, stdin: &str) -> Config<String> {
        Config {
            image: Some(image.to_string()),
            cmd: Some(vec![
                self.launcher.clone(),
                language.to_string(),
                src_path.to_string(),
                stdin.to_string(),
            ]),
            labels: Some(HashMap::from([(SOURCE_LABEL.to_string(), src_path.to_string())])),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                privileged: Some(true),
                binds: Some(vec![format!("{0}:{0}:ro", src_path)]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Starts the container and waits for it under the hard deadline
    async fn run_container(&self, container_id: &str) -> Result<ContainerOutput> {
        self.runtime.start(container_id).await?;

        let exit_code = match tokio::time::timeout(self.timeout, self.runtime.wait(container_id)).await {
            Err(_) => bail!("container did not finish within {:?}", self.timeout),
            Ok(code) => code?,
        };

        let (stdout, stderr) = self.runtime.logs(container_id).await?;
        Ok(ContainerOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn remove_container(&self, container_id: &str) {
        if let Err(e) = self.runtime.remove(container_id).await {
            warn!(container_id, error = format!("{:#}", e), "Failed to remove container");
        }
    }

    async fn run_source(&self, image: &str, language: Language, src_path: &str, stdin: &str) -> Result<ExecutionRecord> {
        let config = self.container_config(image, language, src_path, stdin);
        let container_name = format!("mycode-{}", uuid::Uuid::new_v4());
        let container_id = self.runtime.create(&container_name, config).await?;
        debug!(container_id = %container_id, %language, src_path, "Container created");

        let output = self.run_container(&container_id).await;
        self.remove_container(&container_id).await;
        output.and_then(decode_output)
    }
}

/// Turns a finished container's output into the launcher's record
fn decode_output(output: ContainerOutput) -> Result<ExecutionRecord> {
    if !output.stderr.trim().is_empty() {
        warn!(stderr = %output.stderr.trim(), "Container wrote to stderr");
    }

    if output.exit_code == LAUNCHER_COMPILE_FAILED {
        let compiler = serde_json::from_str::<ExecutionRecord>(output.stdout.trim())
            .map(|r| format!("{}{}", r.stdout, r.stderr))
            .unwrap_or_default();
        bail!("compilation failed: {}", compiler.trim());
    }
    if output.exit_code != 0 {
        bail!("container exited with code {}", output.exit_code);
    }

    serde_json::from_str(output.stdout.trim()).context("decode execution record")
}

#[async_trait]
impl<R: ContainerRuntime> ExecutionEngine for DockerEngine<R> {
    async fn execute(&self, language: Language, source: &str, stdin: &str) -> Result<ExecutionRecord> {
        let image = self.languages.get_image(language)?.to_string();
        self.runtime
            .ensure_image(&image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", image))?;

        let source_file = self.write_source(source)?;
        let src_path = source_file.path().display().to_string();

        let result = self.run_source(&image, language, &src_path, stdin).await;

        if let Err(e) = source_file.close() {
            warn!(src_path = %src_path, error = %e, "Failed to remove source file");
        }

        result
    }
}

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::EnvironmentError;
use crate::worker::environment::{EnvironmentProvider, ExecutionUnit, UnitExit, UnitSpec};
use crate::worker::logs::{LogSink, LogStream};

/// File the agent writes into `/output` on success.
pub const ARTIFACT_FILE: &str = "screenshot.png";
/// Agent output captured next to the artifact.
pub const LOG_FILE: &str = "agent.log";

/// Runs each job's agent in its own sandboxed Docker container.
///
/// Containers get:
/// - a dedicated network (or none at all)
/// - dropped capabilities and no privilege escalation
/// - a read-only root filesystem with a writable `/output` mount
/// - memory and CPU limits
#[derive(Debug, Clone)]
pub struct DockerProvider {
    config: SandboxConfig,
}

impl DockerProvider {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn container_name(job_id: &Uuid) -> String {
        format!("agent-{}", job_id)
    }

    pub fn output_dir(&self, job_id: &Uuid) -> PathBuf {
        self.config.output_dir.join(job_id.to_string())
    }

    /// Arguments for `docker run` that start the agent for `spec`.
    pub fn run_args(&self, spec: &UnitSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            format!("--name={}", Self::container_name(&spec.job_id)),
            "--label=app=ephemeral-agent".to_string(),
            format!("--label=job_id={}", spec.job_id),
        ];

        match self.config.network {
            Some(ref network) => args.push(format!("--network={}", network)),
            None => args.push("--network=none".to_string()),
        }

        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());
        args.push("--tmpfs=/tmp".to_string());

        args.push(format!("--env=JOB_ID={}", spec.job_id));
        args.push(format!("--env=TARGET_URL={}", spec.target_url));
        args.push(format!("--env=TIMEOUT_SECONDS={}", spec.timeout_seconds));
        for (key, value) in &spec.params {
            args.push(format!("--env=PARAM_{}={}", env_key(key), value));
        }

        args.push(format!(
            "--volume={}:/output",
            self.output_dir(&spec.job_id).display()
        ));
        args.push(self.config.image.clone());
        args
    }
}

#[async_trait]
impl EnvironmentProvider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn provision(
        &self,
        spec: &UnitSpec,
        logs: LogSink,
    ) -> Result<Arc<dyn ExecutionUnit>, EnvironmentError> {
        let output_dir = self.output_dir(&spec.job_id);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| EnvironmentError::Provision(format!("output dir: {}", e)))?;

        let name = Self::container_name(&spec.job_id);
        tracing::info!(job_id = %spec.job_id, container = %name, image = %self.config.image, "Starting agent container");

        let output = Command::new("docker")
            .args(self.run_args(spec))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EnvironmentError::Provision(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_run_error(stderr.trim()));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tokio::spawn(follow_logs(name.clone(), output_dir.join(LOG_FILE), logs));

        Ok(Arc::new(DockerUnit {
            name,
            container_id,
            output_dir,
        }))
    }

    async fn force_remove(&self, job_id: &Uuid) {
        let name = Self::container_name(job_id);
        match docker(&["rm", "-f", &name]).await {
            Ok(_) => tracing::debug!(container = %name, "Container removed"),
            Err(e) => tracing::debug!(container = %name, error = %e, "Container removal skipped"),
        }
    }
}

/// One agent container.
#[derive(Debug)]
pub struct DockerUnit {
    name: String,
    container_id: String,
    output_dir: PathBuf,
}

impl DockerUnit {
    pub fn container_id(&self) -> &str {
        &self.container_id
    }
}

#[async_trait]
impl ExecutionUnit for DockerUnit {
    fn id(&self) -> &str {
        &self.name
    }

    async fn wait(&self) -> Result<UnitExit, EnvironmentError> {
        let stdout = docker(&["wait", &self.name]).await?;
        let exit_code = parse_exit_code(&stdout)?;

        Ok(UnitExit {
            exit_code,
            artifact_ref: existing(&self.output_dir.join(ARTIFACT_FILE)).await,
            logs_ref: existing(&self.output_dir.join(LOG_FILE)).await,
            error: None,
        })
    }

    async fn signal_stop(&self) -> Result<(), EnvironmentError> {
        docker(&["kill", "--signal=SIGTERM", &self.name]).await.map(|_| ())
    }

    async fn kill(&self) -> Result<(), EnvironmentError> {
        docker(&["kill", &self.name]).await.map(|_| ())
    }
}

/// Run a docker CLI command and return its stdout.
async fn docker(args: &[&str]) -> Result<String, EnvironmentError> {
    let output = Command::new("docker")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| EnvironmentError::Unit(e.to_string()))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(EnvironmentError::Unit(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

/// Stream `docker logs -f` into the hub and the on-disk log file.
async fn follow_logs(name: String, log_path: PathBuf, sink: LogSink) {
    let child = Command::new("docker")
        .args(["logs", "-f", name.as_str()])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(container = %name, error = %e, "Could not follow agent logs");
            return;
        }
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(stdout, LogStream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(stderr, LogStream::Stderr, tx));
    }

    let mut file = tokio::fs::File::create(&log_path).await.ok();
    while let Some((stream, line)) = rx.recv().await {
        if let Some(f) = file.as_mut() {
            if f.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                file = None;
            }
        }
        match stream {
            LogStream::Stderr => sink.stderr(line),
            _ => sink.stdout(line),
        }
    }
    if let Some(mut f) = file {
        let _ = f.flush().await;
    }
    let _ = child.wait().await;
}

async fn pump_lines<R>(
    reader: R,
    stream: LogStream,
    tx: tokio::sync::mpsc::UnboundedSender<(LogStream, String)>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).is_err() {
            break;
        }
    }
}

async fn existing(path: &Path) -> Option<String> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => Some(path.display().to_string()),
        _ => None,
    }
}

fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn parse_exit_code(stdout: &str) -> Result<i32, EnvironmentError> {
    stdout
        .trim()
        .parse::<i32>()
        .map_err(|_| EnvironmentError::Unit(format!("unexpected docker wait output: {:?}", stdout.trim())))
}

/// Capacity problems are worth retrying later; everything else is a plain
/// provisioning failure.
fn classify_run_error(stderr: &str) -> EnvironmentError {
    let lower = stderr.to_ascii_lowercase();
    let exhausted = [
        "no space left",
        "cannot allocate memory",
        "insufficient",
        "resource temporarily unavailable",
        "too many",
    ]
    .iter()
    .any(|needle| lower.contains(needle));

    if exhausted {
        EnvironmentError::ResourceExhausted(stderr.to_string())
    } else {
        EnvironmentError::Provision(stderr.to_string())
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ephemeral_orchestrator::config::{OrchestratorConfig, SandboxConfig};
use ephemeral_orchestrator::scheduler::Job;
use ephemeral_orchestrator::shutdown::install_shutdown_handler;
use ephemeral_orchestrator::worker::DockerProvider;
use ephemeral_orchestrator::{JobRequest, Orchestrator};

#[derive(Parser, Debug)]
#[command(name = "ephemeral-orchestrator")]
#[command(version)]
#[command(about = "Runs browser-automation jobs in ephemeral sandboxed containers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a batch of jobs to completion
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// JSON file holding an array of job submissions
    #[arg(long)]
    jobs: PathBuf,

    /// Maximum number of agents running at once
    #[arg(long, default_value = "8")]
    concurrency: usize,

    /// Agent image started for each job
    #[arg(long, default_value = "ephemeral-agent:latest")]
    image: String,

    /// Docker network for agents ("none" disables networking)
    #[arg(long, default_value = "ephemeral-agent-network")]
    network: String,

    /// Jobs admitted per submitter per minute
    #[arg(long, default_value = "10")]
    rate_limit: u32,

    /// Host directory for per-job artifacts
    #[arg(long, default_value = "/tmp/ephemeral-agent")]
    output_dir: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct JobOutput {
    job_id: String,
    submitter_id: String,
    priority: String,
    status: String,
    exit_code: Option<i32>,
    artifact_ref: Option<String>,
    error: Option<String>,
    duration_seconds: Option<f64>,
}

impl From<&Job> for JobOutput {
    fn from(job: &Job) -> Self {
        let result = job.result.clone().unwrap_or_default();
        Self {
            job_id: job.id.to_string(),
            submitter_id: job.submitter_id.clone(),
            priority: job.priority.to_string(),
            status: job.status.to_string(),
            exit_code: result.exit_code,
            artifact_ref: result.artifact_ref,
            error: result.error_message,
            duration_seconds: result.duration_seconds,
        }
    }
}

async fn run_batch(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let raw = tokio::fs::read_to_string(&args.jobs).await?;
    let requests: Vec<JobRequest> = serde_json::from_str(&raw)?;

    let sandbox = SandboxConfig {
        image: args.image,
        network: (args.network != "none").then_some(args.network),
        output_dir: args.output_dir,
        ..SandboxConfig::default()
    };
    let config = OrchestratorConfig::default()
        .with_concurrency_limit(args.concurrency)
        .with_rate_limit(args.rate_limit, Duration::from_secs(60))
        .with_sandbox(sandbox.clone());

    let orchestrator = Orchestrator::new(config, Arc::new(DockerProvider::new(sandbox)));
    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone())?;
    let workers = orchestrator.spawn(shutdown.clone());

    let mut job_ids = Vec::with_capacity(requests.len());
    for request in requests {
        match orchestrator.submit(request).await {
            Ok(job) => job_ids.push(job.id),
            Err(e) => eprintln!("Error: submission rejected: {}", e),
        }
    }
    tracing::info!(count = job_ids.len(), "Batch submitted");

    let mut poll = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = poll.tick() => {
                let mut pending = 0;
                for id in &job_ids {
                    if !orchestrator.get_status(id).await?.status.is_terminal() {
                        pending += 1;
                    }
                }
                if pending == 0 {
                    break;
                }
            }
        }
    }
    shutdown.cancel();
    let _ = workers.await;

    let mut jobs = Vec::with_capacity(job_ids.len());
    for id in &job_ids {
        jobs.push(orchestrator.get_status(id).await?);
    }
    print_jobs(&jobs, &args.output)?;

    let dead = orchestrator.dead_letters();
    if !dead.is_empty() {
        eprintln!("{} job(s) dead-lettered", dead.len());
    }
    Ok(())
}

fn print_jobs(jobs: &[Job], format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            let output: Vec<JobOutput> = jobs.iter().map(JobOutput::from).collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<8} {:<10} {:<6} RESULT",
                "JOB ID", "PRIORITY", "STATUS", "EXIT"
            );
            println!("{}", "-".repeat(86));
            for job in jobs {
                let row = JobOutput::from(job);
                let exit = row
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let detail = row
                    .error
                    .or(row.artifact_ref)
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<38} {:<8} {:<10} {:<6} {}",
                    row.job_id, row.priority, row.status, exit, detail
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Run(run_args) => run_batch(run_args).await?,
    }

    Ok(())
}

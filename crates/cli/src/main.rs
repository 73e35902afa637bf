//! DocQA CLI - submit question batches against a document workspace and
//! inspect, export and clean up the resulting jobs

mod output;
mod questions;
mod settings;
mod telemetry;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use docqa_core::application::{ExportFormat, QuestionBatchService, ServiceDeps};
use docqa_core::domain::{Job, JobId, JobStatus};
use docqa_core::port::id_provider::UuidProvider;
use docqa_core::port::time_provider::SystemTimeProvider;
use docqa_core::port::JobFilter;
use docqa_core::AppError;
use docqa_infra_http::AnythingLlmClient;
use docqa_infra_sqlite::{create_pool, run_migrations, SqliteJobRepository};
use docqa_infra_system::SysinfoResourceSampler;
use settings::Settings;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "docqa")]
#[command(about = "Batch question answering against document workspaces", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (toml, yaml or json)
    #[arg(long, global = true, env = "DOCQA_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database url (overrides the configuration)
    #[arg(long, global = true, env = "DOCQA_DATABASE_URL")]
    database_url: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Csv,
}

impl From<Format> for ExportFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => ExportFormat::Json,
            Format::Csv => ExportFormat::Csv,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a question batch and wait for it to finish
    Run {
        /// Workspace slug
        #[arg(short, long)]
        workspace: String,

        /// YAML file with the questions
        #[arg(short, long)]
        questions: PathBuf,

        /// Questions in flight at once
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Write the results to this file when done
        #[arg(long)]
        export: Option<PathBuf>,

        /// Export format
        #[arg(long, value_enum, default_value = "json")]
        format: Format,
    },

    /// Show a job
    Show {
        /// Job ID
        job_id: String,

        /// Also print the per-question results
        #[arg(long)]
        results: bool,
    },

    /// List recent jobs
    List {
        /// Only jobs in this status (e.g. COMPLETED)
        #[arg(short, long)]
        status: Option<JobStatus>,

        /// Only jobs for this workspace
        #[arg(short, long)]
        workspace: Option<String>,

        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Export a job's results
    Export {
        /// Job ID
        job_id: String,

        #[arg(long, value_enum)]
        format: Format,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete finished jobs older than the given age
    Cleanup {
        #[arg(long, default_value = "30")]
        days: u32,
    },

    /// Show degradation level, circuit breakers and job counts
    Health {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

async fn build_service(settings: &Settings) -> Result<QuestionBatchService> {
    let database_url = settings.database_url()?;
    let pool = create_pool(&database_url)
        .await
        .with_context(|| format!("Failed to open {}", database_url))?;
    run_migrations(&pool).await?;

    let connections = Arc::new(AtomicU64::new(0));
    let client = AnythingLlmClient::new(&settings.workspace)?
        .with_connection_counter(Arc::clone(&connections));
    let sampler = SysinfoResourceSampler::with_connection_counter(connections);

    let service = QuestionBatchService::build(
        &settings.engine,
        ServiceDeps {
            repo: Arc::new(SqliteJobRepository::new(pool)),
            client: Arc::new(client),
            sampler: Arc::new(sampler),
            time_provider: Arc::new(SystemTimeProvider),
            id_provider: Arc::new(UuidProvider),
        },
    )?;

    info!(
        database_url = %database_url,
        workspace_url = %settings.workspace.base_url,
        "Service ready"
    );
    Ok(service)
}

async fn write_export(
    service: &QuestionBatchService,
    job_id: &JobId,
    format: Format,
    path: Option<&Path>,
) -> Result<()> {
    let rendered = service.export_results(job_id, format.into()).await?;
    match path {
        Some(path) => {
            tokio::fs::write(path, rendered)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!(
                "{}",
                format!("✓ Results written to {}", path.display()).green()
            );
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

/// Wait for a running job, printing progress; `interrupt` cancels it
async fn follow_job<F>(service: &QuestionBatchService, job_id: &JobId, interrupt: F) -> Result<Job>
where
    F: Future,
{
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.tick().await;
    let wait = service.wait_for_job(job_id);
    tokio::pin!(wait, interrupt);

    loop {
        tokio::select! {
            job = &mut wait => return Ok(job?),
            _ = ticker.tick() => {
                if let Ok(job) = service.get_job(job_id).await {
                    eprintln!("  {} {:.0}%", output::colored_status(job.status), job.progress);
                }
            }
            _ = &mut interrupt => {
                eprintln!("{}", "Cancelling, waiting for in-flight questions...".yellow());
                return match service.cancel_job(job_id, "interrupted by user").await {
                    Ok(job) => Ok(job),
                    Err(AppError::Conflict(_)) => Ok(service.get_job(job_id).await?),
                    Err(e) => Err(e.into()),
                };
            }
        }
    }
}

async fn run_batch(
    service: &QuestionBatchService,
    workspace: &str,
    questions_path: &Path,
    concurrency: Option<usize>,
    export: Option<&Path>,
    format: Format,
) -> Result<()> {
    let questions = questions::load_questions(questions_path)?;
    let total = questions.len();
    let job_id = service
        .submit_question_batch(workspace, questions, concurrency)
        .await?;

    eprintln!(
        "{} {} ({} questions)",
        "✓ Job submitted".green().bold(),
        job_id,
        total
    );

    let job = follow_job(service, &job_id, tokio::signal::ctrl_c()).await?;

    output::print_job(&job);
    if job.result.is_some() {
        output::print_report(&service.get_batch_report(&job_id).await?);
        if let Some(path) = export {
            write_export(service, &job_id, format, Some(path)).await?;
        }
    }

    if job.status != JobStatus::Completed {
        anyhow::bail!("Job {} ended {}", job.id, job.status);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = telemetry::init_logging()?;
    telemetry::describe_metrics();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if cli.database_url.is_some() {
        settings.database_url = cli.database_url;
    }
    let service = build_service(&settings).await?;

    match cli.command {
        Commands::Run {
            workspace,
            questions,
            concurrency,
            export,
            format,
        } => {
            run_batch(
                &service,
                &workspace,
                &questions,
                concurrency,
                export.as_deref(),
                format,
            )
            .await?;
        }

        Commands::Show { job_id, results } => {
            let job = service.get_job(&job_id).await?;
            output::print_job(&job);
            if results {
                match service.get_batch_report(&job_id).await {
                    Ok(report) => output::print_report(&report),
                    Err(AppError::NotFound(_)) => {
                        println!("{}", "No results recorded".yellow());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Commands::List {
            status,
            workspace,
            limit,
        } => {
            let jobs = service
                .list_jobs(&JobFilter {
                    status,
                    workspace_id: workspace,
                    limit: Some(limit),
                    ..Default::default()
                })
                .await?;
            output::print_jobs(&jobs);
        }

        Commands::Export {
            job_id,
            format,
            output,
        } => {
            write_export(&service, &job_id, format, output.as_deref()).await?;
        }

        Commands::Cleanup { days } => {
            let deleted = service.cleanup_finished_jobs(days).await?;
            println!(
                "{}",
                format!("✓ {} finished jobs older than {} days deleted", deleted, days).green()
            );
        }

        Commands::Health { json } => {
            let health = service.health().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&health)?);
            } else {
                output::print_health(&health);
            }
        }
    }

    let signalled = service.cancel_all("shutting down");
    if signalled > 0 {
        warn!(signalled, "Batches still running at exit were cancelled");
    }
    Ok(())
}

//! Terminal rendering for jobs, reports and health

use chrono::{DateTime, Local};
use colored::Colorize;
use docqa_core::application::{CircuitState, DegradationLevel, ServiceHealth};
use docqa_core::domain::{BatchReport, Job, JobStatus};
use tabled::settings::Style;
use tabled::{Table, Tabled};

const RESPONSE_PREVIEW_CHARS: usize = 60;

#[derive(Tabled)]
struct JobRow {
    id: String,
    workspace: String,
    status: String,
    progress: String,
    created: String,
    duration: String,
}

#[derive(Tabled)]
struct ResultRow {
    question: String,
    success: String,
    confidence: String,
    #[tabled(rename = "time (s)")]
    time: String,
    attempts: u32,
    response: String,
}

#[derive(Tabled)]
struct BreakerRow {
    service: String,
    state: String,
    failures: u32,
    transitions: u64,
    #[tabled(rename = "retry after")]
    retry_after: String,
}

pub fn format_timestamp(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn format_duration(job: &Job) -> String {
    job.duration_millis()
        .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
        .unwrap_or_else(|| "-".to_string())
}

fn preview(text: &str) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= RESPONSE_PREVIEW_CHARS {
        single_line
    } else {
        let cut: String = single_line.chars().take(RESPONSE_PREVIEW_CHARS).collect();
        format!("{}...", cut)
    }
}

pub fn colored_status(status: JobStatus) -> String {
    let text = status.as_str();
    match status {
        JobStatus::Completed => text.green().bold().to_string(),
        JobStatus::Failed => text.red().bold().to_string(),
        JobStatus::Cancelled => text.yellow().bold().to_string(),
        JobStatus::Processing => text.cyan().to_string(),
        JobStatus::Pending => text.normal().to_string(),
    }
}

pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("{}", "No jobs found".yellow());
        return;
    }

    let rows: Vec<JobRow> = jobs
        .iter()
        .map(|job| JobRow {
            id: job.id.clone(),
            workspace: job.workspace_id.clone(),
            status: job.status.to_string(),
            progress: format!("{:.0}%", job.progress),
            created: format_timestamp(job.created_at),
            duration: format_duration(job),
        })
        .collect();

    println!("{}", Table::new(rows).with(Style::rounded()));
}

pub fn print_job(job: &Job) {
    println!("{} {}", "Job".cyan().bold(), job.id);
    println!("  {} {}", "Workspace:".bold(), job.workspace_id);
    println!("  {} {}", "Status:".bold(), colored_status(job.status));
    println!("  {} {:.1}%", "Progress:".bold(), job.progress);
    println!("  {} {}", "Created:".bold(), format_timestamp(job.created_at));
    if let Some(started) = job.started_at {
        println!("  {} {}", "Started:".bold(), format_timestamp(started));
    }
    if let Some(completed) = job.completed_at {
        println!("  {} {}", "Finished:".bold(), format_timestamp(completed));
        println!("  {} {}", "Duration:".bold(), format_duration(job));
    }
    for (key, value) in &job.metadata {
        println!("  {} {}", format!("{}:", key).bold(), value);
    }
    if let Some(error) = &job.error {
        println!("  {} {}", "Error:".bold(), error.red());
    }
}

pub fn print_report(report: &BatchReport) {
    let summary = &report.summary;

    println!();
    println!("{}", "Results".cyan().bold());
    println!(
        "  {} {}/{} answered, {} failed ({:.1}% success)",
        "Questions:".bold(),
        summary.successful,
        report.total_questions,
        summary.failed,
        summary.success_rate
    );
    println!(
        "  {} {:.3} (high {}, medium {}, low {})",
        "Avg confidence:".bold(),
        summary.average_confidence,
        summary.confidence_distribution.high,
        summary.confidence_distribution.medium,
        summary.confidence_distribution.low
    );
    println!(
        "  {} {:.2}s avg, {:.2}s total",
        "Processing time:".bold(),
        summary.average_processing_time,
        summary.total_processing_time
    );
    for (kind, count) in &summary.error_types {
        println!("  {} {} x{}", "Error:".bold(), kind.red(), count);
    }

    if report.results.is_empty() {
        return;
    }

    let rows: Vec<ResultRow> = report
        .results
        .iter()
        .map(|r| ResultRow {
            question: r.question_id.clone(),
            success: if r.success { "yes" } else { "no" }.to_string(),
            confidence: format!("{:.3}", r.confidence_score),
            time: format!("{:.2}", r.processing_time),
            attempts: r.attempts,
            response: match &r.error {
                Some(error) => preview(error),
                None => preview(&r.response),
            },
        })
        .collect();

    println!();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

pub fn print_health(health: &ServiceHealth) {
    let degradation = &health.degradation;
    let level = degradation.level.as_str();
    let level = match degradation.level {
        DegradationLevel::Full => level.green().bold(),
        DegradationLevel::Degraded => level.yellow().bold(),
        DegradationLevel::Minimal | DegradationLevel::Maintenance => level.red().bold(),
    };

    println!("{}", "Service Health".cyan().bold());
    println!();
    println!("  {} {}", "Level:".bold(), level);
    if degradation.maintenance_mode {
        println!("  {} {}", "Maintenance:".bold(), "ON".red());
    }
    if let Some(usage) = &degradation.usage {
        println!(
            "  {} cpu {:.1}%, memory {:.1}%, disk {:.1}%, {} connections",
            "Resources:".bold(),
            usage.cpu_percent,
            usage.memory_percent,
            usage.disk_percent,
            usage.active_connections
        );
    }

    let jobs = &health.jobs;
    println!();
    println!("  {} {}", "Total jobs:".bold(), jobs.total_jobs);
    for (status, count) in &jobs.by_status {
        println!("    {} {}", format!("{}:", status).bold(), count);
    }
    println!("  {} {:.1}%", "Success rate:".bold(), jobs.success_rate);
    println!(
        "  {} {}/{} ({:.0}%)",
        "Running batches:".bold(),
        jobs.running_batches,
        jobs.max_concurrent_jobs,
        jobs.utilization
    );

    if health.circuit_breakers.is_empty() {
        return;
    }

    let rows: Vec<BreakerRow> = health
        .circuit_breakers
        .iter()
        .map(|stats| BreakerRow {
            service: stats.name.clone(),
            state: stats.state.to_string(),
            failures: stats.failure_count,
            transitions: stats.transition_count,
            retry_after: match (stats.state, stats.retry_after_ms) {
                (CircuitState::Open, Some(ms)) => format!("{:.1}s", ms as f64 / 1000.0),
                _ => "-".to_string(),
            },
        })
        .collect();

    println!();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

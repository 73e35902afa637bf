//! Logging and metric registration for the CLI process

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the tracing subscriber
///
/// # Environment Variables
///
/// - `RUST_LOG`: filter directives (default: `docqa=info`)
/// - `DOCQA_LOG_FORMAT`: `pretty` (default) or `json`
/// - `DOCQA_LOG_DIR`: also write JSON logs to a daily rolling file there
///
/// Console output goes to stderr so exported results can be piped.
/// The returned guard must be held until exit to flush the file sink.
pub fn init_logging() -> Result<Option<WorkerGuard>> {
    let log_format = std::env::var("DOCQA_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("docqa=info"))?;

    let (file_layer, guard) = match std::env::var("DOCQA_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "docqa.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().json().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init()?;
        }
    }

    Ok(guard)
}

/// Register descriptions for the metrics the engine emits
pub fn describe_metrics() {
    metrics::describe_counter!(
        "retry_attempts_total",
        "Retries scheduled after a retryable failure"
    );
    metrics::describe_counter!(
        "circuit_breaker_transitions_total",
        "Circuit breaker state changes"
    );
    metrics::describe_counter!(
        "questions_processed_total",
        "Questions answered or failed, by outcome"
    );
    metrics::describe_counter!(
        "degradation_rejections_total",
        "Operations refused by the degradation controller"
    );
    metrics::describe_gauge!(
        "degradation_level",
        "Current service level (0 full, 1 degraded, 2 minimal, 3 maintenance)"
    );
    metrics::describe_gauge!("active_jobs", "Question batches currently running");
    metrics::describe_histogram!(
        "workspace_call_latency_seconds",
        metrics::Unit::Seconds,
        "Latency of workspace service calls"
    );
    metrics::describe_histogram!(
        "job_duration_seconds",
        metrics::Unit::Seconds,
        "Wall time from job start to terminal status"
    );
}

//! Layered settings: defaults, optional config file, `DOCQA__*` environment

use anyhow::{Context, Result};
use directories::ProjectDirs;
use docqa_core::application::EngineConfig;
use docqa_infra_http::AnythingLlmConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// SQLite url; defaults to a file in the platform data directory
    pub database_url: Option<String>,
    pub workspace: AnythingLlmConfig,
    pub engine: EngineConfig,
}

impl Settings {
    /// Load settings
    ///
    /// Precedence (lowest to highest):
    /// 1. Built-in defaults
    /// 2. `path`, or `docqa.toml|yaml|json` in the working directory if present
    /// 3. Environment variables, e.g. `DOCQA__WORKSPACE__API_KEY`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("docqa").required(false),
        };
        let settings: Settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("DOCQA")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        settings.engine.validate()?;
        Ok(settings)
    }

    /// Resolve the database url, creating the data directory if needed
    pub fn database_url(&self) -> Result<String> {
        if let Some(url) = &self.database_url {
            return Ok(url.clone());
        }
        let dirs = ProjectDirs::from("", "", "docqa")
            .context("Cannot determine a data directory; set database_url")?;
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;
        Ok(format!("sqlite://{}", data_dir.join("jobs.db").display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
database_url = "sqlite::memory:"

[workspace]
base_url = "http://llm.internal:3001"
api_key = "secret"

[engine.execution]
max_concurrent_jobs = 2

[engine.retry]
max_retries = 5
jitter = false
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.database_url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(settings.workspace.base_url, "http://llm.internal:3001");
        assert_eq!(settings.workspace.chat_mode, "query");
        assert_eq!(settings.engine.execution.max_concurrent_jobs, 2);
        assert_eq!(settings.engine.execution.max_concurrency, 10);
        assert_eq!(settings.engine.retry.max_retries, 5);
        assert!(!settings.engine.retry.jitter);
    }

    #[test]
    fn test_invalid_engine_config_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[engine.circuit_breaker]\nfailure_threshold = 0").unwrap();

        let err = Settings::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("failure_threshold"), "{}", err);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        assert!(Settings::load(Some(Path::new("/nonexistent/docqa.toml"))).is_err());
    }

    #[test]
    fn test_explicit_database_url_wins() {
        let settings = Settings {
            database_url: Some("sqlite://custom.db".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.database_url().unwrap(), "sqlite://custom.db");
    }
}

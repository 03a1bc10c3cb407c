pub mod config;
pub mod export;
pub mod migrate;
pub mod pdf;
pub mod retention;

use std::path::{Path, PathBuf};

use anyhow::Context;
use reimburse_core::audit::CallerContext;
use reimburse_core::config::{AppConfig, LoadOptions};
use reimburse_core::errors::{ApplicationError, DomainError};
use reimburse_service::{BootstrapError, RenderedDocument};
use serde::Serialize;
use uuid::Uuid;

/// Error class, message and exit code of a failed command.
pub(crate) type Failure = (&'static str, String, u8);

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    pub(crate) fn from_outcome(command: &str, outcome: Result<String, Failure>) -> Self {
        match outcome {
            Ok(message) => Self::success(command, message),
            Err((error_class, message, exit_code)) => {
                Self::failure(command, error_class, message, exit_code)
            }
        }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

pub(crate) fn load_config() -> Result<AppConfig, Failure> {
    AppConfig::load(LoadOptions::default())
        .map_err(|error| ("config_validation", format!("configuration issue: {error}"), 2))
}

pub(crate) fn runtime() -> Result<tokio::runtime::Runtime, Failure> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|error| ("runtime_init", format!("failed to initialize async runtime: {error}"), 3))
}

pub(crate) fn bootstrap_failure(error: BootstrapError) -> Failure {
    let class = match &error {
        BootstrapError::Config(_) => ("config_validation", 2),
        BootstrapError::DatabaseConnect(_) => ("db_connectivity", 4),
        BootstrapError::Migration(_) => ("migration", 5),
    };
    (class.0, error.to_string(), class.1)
}

pub(crate) fn application_failure(error: ApplicationError) -> Failure {
    let (class, code) = match &error {
        ApplicationError::Domain(DomainError::NotFound { .. }) => ("not_found", 7),
        ApplicationError::Domain(
            DomainError::InvalidStateTransition { .. } | DomainError::ConcurrentModification { .. },
        ) => ("invalid_state", 8),
        ApplicationError::Domain(_) => ("validation", 6),
        ApplicationError::Render(_) => ("render", 9),
        ApplicationError::Persistence(_) | ApplicationError::Upstream(_) => ("db_connectivity", 4),
        ApplicationError::Configuration(_) => ("config_validation", 2),
    };
    (class, error.to_string(), code)
}

pub(crate) fn caller(command: &str) -> CallerContext {
    CallerContext::new(format!("cli:{command}"), format!("cli-{}", Uuid::new_v4()))
}

/// Writes a rendered document into `out_dir` under its suggested name.
pub(crate) async fn write_document(
    out_dir: &Path,
    document: &RenderedDocument,
) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let path = out_dir.join(&document.filename);
    tokio::fs::write(&path, &document.bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub(crate) fn io_failure(error: anyhow::Error) -> Failure {
    ("io", format!("{error:#}"), 10)
}

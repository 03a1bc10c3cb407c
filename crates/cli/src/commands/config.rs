use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use reimburse_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// Effective configuration with the source of each value: `key`, env variable, value.
pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let admins = if config.admin.emails.is_empty() {
        "<none>".to_string()
    } else {
        format!("{} configured", config.admin.emails.len())
    };

    let fields: [(&str, &str, String); 13] = [
        ("database.url", "REIMBURSE_DATABASE_URL", config.database.url.clone()),
        (
            "database.max_connections",
            "REIMBURSE_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections.to_string(),
        ),
        (
            "database.timeout_secs",
            "REIMBURSE_DATABASE_TIMEOUT_SECS",
            config.database.timeout_secs.to_string(),
        ),
        (
            "reimbursement.mileage_rate",
            "REIMBURSE_MILEAGE_RATE",
            config.reimbursement.mileage_rate.to_string(),
        ),
        (
            "reimbursement.mileage_product_code",
            "REIMBURSE_MILEAGE_PRODUCT_CODE",
            config.reimbursement.mileage_product_code.clone(),
        ),
        (
            "retention.archived_age_limit_days",
            "REIMBURSE_ARCHIVED_AGE_LIMIT_DAYS",
            config.retention.archived_age_limit_days.to_string(),
        ),
        (
            "retention.orphan_grace_hours",
            "REIMBURSE_ORPHAN_GRACE_HOURS",
            config.retention.orphan_grace_hours.to_string(),
        ),
        (
            "documents.organization_name",
            "REIMBURSE_ORGANIZATION_NAME",
            config.documents.organization_name.clone(),
        ),
        (
            "documents.max_image_dimension",
            "REIMBURSE_MAX_IMAGE_DIMENSION",
            config.documents.max_image_dimension.to_string(),
        ),
        (
            "documents.jpeg_quality",
            "REIMBURSE_JPEG_QUALITY",
            config.documents.jpeg_quality.to_string(),
        ),
        ("admin.emails", "REIMBURSE_ADMIN_EMAILS", admins),
        ("logging.level", "REIMBURSE_LOGGING_LEVEL", config.logging.level.clone()),
        ("logging.format", "REIMBURSE_LOGGING_FORMAT", format!("{:?}", config.logging.format)),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, env_key, value) in &fields {
        let source = field_source(
            key,
            Some(*env_key),
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(key, value, source));
    }
    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("reimburse.toml"), PathBuf::from("config/reimburse.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

#[cfg(test)]
mod tests {
    use super::{contains_path, field_source};

    #[test]
    fn file_values_are_attributed_to_the_file() {
        let doc: toml::Value = "[retention]\narchived_age_limit_days = 60\n".parse().expect("toml");

        assert!(contains_path(&doc, "retention.archived_age_limit_days"));
        assert!(!contains_path(&doc, "retention.orphan_grace_hours"));
        assert_eq!(
            field_source("retention.archived_age_limit_days", None, Some(&doc), None),
            "file (config file)"
        );
        assert_eq!(field_source("database.url", None, Some(&doc), None), "default");
    }
}

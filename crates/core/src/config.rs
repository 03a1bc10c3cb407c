use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retention::RetentionPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub reimbursement: ReimbursementConfig,
    pub retention: RetentionConfig,
    pub documents: DocumentsConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ReimbursementConfig {
    pub mileage_rate: Decimal,
    pub mileage_product_code: String,
}

#[derive(Clone, Debug)]
pub struct RetentionConfig {
    pub archived_age_limit_days: u32,
    pub orphan_grace_hours: u32,
}

#[derive(Clone, Debug)]
pub struct DocumentsConfig {
    pub organization_name: String,
    pub max_image_dimension: u32,
    pub jpeg_quality: u8,
}

#[derive(Clone, Debug, Default)]
pub struct AdminConfig {
    pub emails: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub mileage_rate: Option<Decimal>,
    pub archived_age_limit_days: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://reimburse.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            reimbursement: ReimbursementConfig {
                mileage_rate: Decimal::new(25, 2),
                mileage_product_code: "v2025_kmkorv".to_string(),
            },
            retention: RetentionConfig { archived_age_limit_days: 30, orphan_grace_hours: 24 },
            documents: DocumentsConfig {
                organization_name: "Reimburse".to_string(),
                max_image_dimension: 1920,
                jpeg_quality: 80,
            },
            admin: AdminConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("reimburse.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            archived_age_limit_days: self.retention.archived_age_limit_days,
            orphan_grace_hours: self.retention.orphan_grace_hours,
        }
    }

    pub fn is_admin(&self, email: &str) -> bool {
        let email = email.trim();
        self.admin.emails.iter().any(|admin| admin.eq_ignore_ascii_case(email))
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(reimbursement) = patch.reimbursement {
            if let Some(rate) = reimbursement.mileage_rate {
                self.reimbursement.mileage_rate = rate.into_decimal("reimbursement.mileage_rate")?;
            }
            if let Some(code) = reimbursement.mileage_product_code {
                self.reimbursement.mileage_product_code = code;
            }
        }

        if let Some(retention) = patch.retention {
            if let Some(days) = retention.archived_age_limit_days {
                self.retention.archived_age_limit_days = days;
            }
            if let Some(hours) = retention.orphan_grace_hours {
                self.retention.orphan_grace_hours = hours;
            }
        }

        if let Some(documents) = patch.documents {
            if let Some(organization_name) = documents.organization_name {
                self.documents.organization_name = organization_name;
            }
            if let Some(max_image_dimension) = documents.max_image_dimension {
                self.documents.max_image_dimension = max_image_dimension;
            }
            if let Some(jpeg_quality) = documents.jpeg_quality {
                self.documents.jpeg_quality = jpeg_quality;
            }
        }

        if let Some(admin) = patch.admin {
            if let Some(emails) = admin.emails {
                self.admin.emails = emails;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("REIMBURSE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("REIMBURSE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("REIMBURSE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("REIMBURSE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("REIMBURSE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("REIMBURSE_MILEAGE_RATE") {
            self.reimbursement.mileage_rate = parse_env("REIMBURSE_MILEAGE_RATE", &value)?;
        }
        if let Some(value) = read_env("REIMBURSE_MILEAGE_PRODUCT_CODE") {
            self.reimbursement.mileage_product_code = value;
        }

        if let Some(value) = read_env("REIMBURSE_ARCHIVED_AGE_LIMIT_DAYS") {
            self.retention.archived_age_limit_days =
                parse_env("REIMBURSE_ARCHIVED_AGE_LIMIT_DAYS", &value)?;
        }
        if let Some(value) = read_env("REIMBURSE_ORPHAN_GRACE_HOURS") {
            self.retention.orphan_grace_hours = parse_env("REIMBURSE_ORPHAN_GRACE_HOURS", &value)?;
        }

        if let Some(value) = read_env("REIMBURSE_ORGANIZATION_NAME") {
            self.documents.organization_name = value;
        }
        if let Some(value) = read_env("REIMBURSE_MAX_IMAGE_DIMENSION") {
            self.documents.max_image_dimension =
                parse_env("REIMBURSE_MAX_IMAGE_DIMENSION", &value)?;
        }
        if let Some(value) = read_env("REIMBURSE_JPEG_QUALITY") {
            self.documents.jpeg_quality = parse_env("REIMBURSE_JPEG_QUALITY", &value)?;
        }

        if let Some(value) = read_env("REIMBURSE_ADMIN_EMAILS") {
            self.admin.emails = value
                .split(',')
                .map(str::trim)
                .filter(|email| !email.is_empty())
                .map(str::to_string)
                .collect();
        }

        let log_level =
            read_env("REIMBURSE_LOGGING_LEVEL").or_else(|| read_env("REIMBURSE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("REIMBURSE_LOGGING_FORMAT").or_else(|| read_env("REIMBURSE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(mileage_rate) = overrides.mileage_rate {
            self.reimbursement.mileage_rate = mileage_rate;
        }
        if let Some(days) = overrides.archived_age_limit_days {
            self.retention.archived_age_limit_days = days;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_reimbursement(&self.reimbursement)?;
        validate_retention(&self.retention)?;
        validate_documents(&self.documents)?;
        validate_admin(&self.admin)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("reimburse.toml"), PathBuf::from("config/reimburse.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_reimbursement(reimbursement: &ReimbursementConfig) -> Result<(), ConfigError> {
    if reimbursement.mileage_rate <= Decimal::ZERO {
        return Err(ConfigError::Validation(
            "reimbursement.mileage_rate must be greater than zero".to_string(),
        ));
    }
    if reimbursement.mileage_product_code.trim().is_empty() {
        return Err(ConfigError::Validation(
            "reimbursement.mileage_product_code must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_retention(retention: &RetentionConfig) -> Result<(), ConfigError> {
    if retention.archived_age_limit_days == 0 {
        return Err(ConfigError::Validation(
            "retention.archived_age_limit_days must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_documents(documents: &DocumentsConfig) -> Result<(), ConfigError> {
    if documents.organization_name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "documents.organization_name must not be empty".to_string(),
        ));
    }
    if !(256..=8192).contains(&documents.max_image_dimension) {
        return Err(ConfigError::Validation(
            "documents.max_image_dimension must be in range 256..=8192".to_string(),
        ));
    }
    if !(1..=100).contains(&documents.jpeg_quality) {
        return Err(ConfigError::Validation(
            "documents.jpeg_quality must be in range 1..=100".to_string(),
        ));
    }
    Ok(())
}

fn validate_admin(admin: &AdminConfig) -> Result<(), ConfigError> {
    if let Some(email) = admin.emails.iter().find(|email| !email.contains('@')) {
        return Err(ConfigError::Validation(format!(
            "admin.emails entry `{email}` is not an email address"
        )));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    reimbursement: Option<ReimbursementPatch>,
    retention: Option<RetentionPatch>,
    documents: Option<DocumentsPatch>,
    admin: Option<AdminPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

/// TOML allows the rate either as a float or as a quoted decimal string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RatePatch {
    Number(f64),
    Text(String),
}

impl RatePatch {
    fn into_decimal(self, key: &str) -> Result<Decimal, ConfigError> {
        let parsed = match &self {
            Self::Number(value) => Decimal::try_from(*value).ok(),
            Self::Text(value) => value.trim().parse::<Decimal>().ok(),
        };
        parsed.map(|rate| rate.normalize()).ok_or_else(|| {
            ConfigError::Validation(format!("{key} must be a decimal number, got {self:?}"))
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ReimbursementPatch {
    mileage_rate: Option<RatePatch>,
    mileage_product_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RetentionPatch {
    archived_age_limit_days: Option<u32>,
    orphan_grace_hours: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DocumentsPatch {
    organization_name: Option<String>,
    max_image_dimension: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct AdminPatch {
    emails: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

use std::sync::Arc;

use reimburse_core::audit::TracingAuditSink;
use reimburse_core::config::{AppConfig, ConfigError, LoadOptions};
use reimburse_db::{connect_with_config, migrations, DbPool, SqlEntryRepository};
use thiserror::Error;
use tracing::info;

use crate::service::ReimbursementService;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: ReimbursementService<SqlEntryRepository>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Connects and migrates using an already loaded configuration.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let service = ReimbursementService::new(
        SqlEntryRepository::new(db_pool.clone()),
        &config,
        Arc::new(TracingAuditSink),
    );
    Ok(Application { config, db_pool, service })
}

#[cfg(test)]
mod tests {
    use reimburse_core::audit::CallerContext;
    use reimburse_core::config::{ConfigOverrides, LoadOptions};
    use reimburse_core::domain::creation::{NewEntry, NewMileage};
    use reimburse_core::errors::{ApplicationError, DomainError};

    use crate::bootstrap::bootstrap;

    fn options(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_invalid_config() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                archived_age_limit_days: Some(0),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().map(|error| error.to_string()).unwrap_or_default();
        assert!(message.contains("retention.archived_age_limit_days"), "{message}");
    }

    #[tokio::test]
    async fn bootstrap_exposes_a_migrated_service() {
        let app = bootstrap(options("sqlite::memory:")).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('entry', 'item', 'mileage', 'attachment')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema query");
        assert_eq!(table_count, 4);

        let caller = CallerContext::system("bootstrap-test");
        let created = app
            .service
            .create_entry(
                &caller,
                NewEntry {
                    name: "Kaisa Kiltalainen".to_string(),
                    contact: "kaisa@example.org".to_string(),
                    iban: "FI2112345600000785".to_string(),
                    title: "Excursion".to_string(),
                    gov_id: Some("131052-308T".to_string()),
                    items: Vec::new(),
                    mileages: vec![NewMileage {
                        account: None,
                        description: "Drive".to_string(),
                        date: chrono::NaiveDate::from_ymd_opt(2024, 2, 1).expect("date"),
                        route: "Espoo - Turku".to_string(),
                        distance_km: 166.0,
                        plate_no: "KIL-1".to_string(),
                    }],
                },
            )
            .await
            .expect("create entry");
        assert_eq!(created.len(), 1);

        let missing = app.service.export_entry(&caller, created[0].id).await;
        assert!(matches!(
            missing,
            Err(ApplicationError::Domain(DomainError::InvalidStateTransition { .. }))
        ));
        app.db_pool.close().await;
    }
}

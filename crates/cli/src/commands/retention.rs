use chrono::Utc;
use reimburse_service::bootstrap_with_config;

use crate::commands::{
    application_failure, bootstrap_failure, caller, load_config, runtime, CommandResult, Failure,
};

/// Deletes archived entries past the configured age limit.
pub fn sweep() -> CommandResult {
    CommandResult::from_outcome("sweep", run_sweep())
}

/// Deletes unlinked uploads past the orphan grace period.
pub fn purge_orphans() -> CommandResult {
    CommandResult::from_outcome("purge-orphans", run_purge())
}

fn run_sweep() -> Result<String, Failure> {
    let config = load_config()?;
    let limit = config.retention.archived_age_limit_days;
    runtime()?.block_on(async {
        let app = bootstrap_with_config(config).await.map_err(bootstrap_failure)?;
        let swept = app
            .service
            .sweep_archived(&caller("sweep"), Utc::now().date_naive())
            .await
            .map_err(application_failure)?;
        app.db_pool.close().await;

        let ids: Vec<String> = swept.iter().map(ToString::to_string).collect();
        Ok::<_, Failure>(format!(
            "deleted {} archived entries older than {limit} days: [{}]",
            swept.len(),
            ids.join(",")
        ))
    })
}

fn run_purge() -> Result<String, Failure> {
    let config = load_config()?;
    runtime()?.block_on(async {
        let app = bootstrap_with_config(config).await.map_err(bootstrap_failure)?;
        let purged = app
            .service
            .purge_orphaned_attachments(&caller("purge-orphans"), Utc::now())
            .await
            .map_err(application_failure)?;
        app.db_pool.close().await;
        Ok::<_, Failure>(format!("deleted {} orphaned attachments", purged.len()))
    })
}

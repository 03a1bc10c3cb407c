use reimburse_db::{connect_with_config, migrations};

use crate::commands::{load_config, runtime, CommandResult, Failure};

pub fn run() -> CommandResult {
    CommandResult::from_outcome("migrate", apply())
}

fn apply() -> Result<String, Failure> {
    let config = load_config()?;
    runtime()?.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<_, Failure>("applied pending migrations".to_string())
    })
}

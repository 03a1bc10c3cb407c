use std::path::Path;

use reimburse_core::domain::entry::EntryId;
use reimburse_service::bootstrap_with_config;

use crate::commands::{
    application_failure, bootstrap_failure, caller, io_failure, load_config, runtime,
    write_document, CommandResult, Failure,
};

/// One id exports a single approved or paid entry; several ids export paid entries
/// together.
pub fn run(entry_ids: &[i64], out_dir: &Path) -> CommandResult {
    let ids: Vec<EntryId> = entry_ids.iter().copied().map(EntryId).collect();
    CommandResult::from_outcome("export", render(&ids, out_dir))
}

fn render(ids: &[EntryId], out_dir: &Path) -> Result<String, Failure> {
    let config = load_config()?;
    runtime()?.block_on(async {
        let app = bootstrap_with_config(config).await.map_err(bootstrap_failure)?;
        let caller = caller("export");
        let document = match ids {
            [single] => app.service.export_entry(&caller, *single).await,
            _ => app.service.export_entries(&caller, ids).await,
        }
        .map_err(application_failure)?;
        app.db_pool.close().await;

        let path = write_document(out_dir, &document).await.map_err(io_failure)?;
        Ok::<_, Failure>(format!("wrote {} ({})", path.display(), document.content_type))
    })
}

use std::path::Path;

use reimburse_core::domain::entry::EntryId;
use reimburse_service::bootstrap_with_config;

use crate::commands::{
    application_failure, bootstrap_failure, caller, io_failure, load_config, runtime,
    write_document, CommandResult, Failure,
};

pub fn run(entry_id: i64, out_dir: &Path) -> CommandResult {
    CommandResult::from_outcome("pdf", render(EntryId(entry_id), out_dir))
}

fn render(entry_id: EntryId, out_dir: &Path) -> Result<String, Failure> {
    let config = load_config()?;
    runtime()?.block_on(async {
        let app = bootstrap_with_config(config).await.map_err(bootstrap_failure)?;
        let document =
            app.service.entry_pdf(&caller("pdf"), entry_id).await.map_err(application_failure)?;
        app.db_pool.close().await;

        let path = write_document(out_dir, &document).await.map_err(io_failure)?;
        Ok::<_, Failure>(format!("wrote {} ({} bytes)", path.display(), document.bytes.len()))
    })
}

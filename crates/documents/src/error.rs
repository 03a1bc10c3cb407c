use thiserror::Error;

use reimburse_core::domain::entry::{EntryId, EntryStatus};
use reimburse_core::errors::ApplicationError;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("attachment {0} has no stored content")]
    MissingAttachment(i64),
    #[error("attachment {attachment_id} cannot be rendered: {reason}")]
    CorruptAttachment { attachment_id: i64, reason: String },
    #[error("entry {entry_id} is {status} but {problem}")]
    Precondition { entry_id: EntryId, status: EntryStatus, problem: String },
    #[error("export needs at least one entry")]
    EmptyExport,
    #[error("pdf backend error: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("image encoding error: {0}")]
    Image(#[from] image::ImageError),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    pub(crate) fn corrupt(attachment_id: i64, reason: impl ToString) -> Self {
        Self::CorruptAttachment { attachment_id, reason: reason.to_string() }
    }
}

impl From<RenderError> for ApplicationError {
    fn from(value: RenderError) -> Self {
        Self::Render(value.to_string())
    }
}

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use reimburse_core::domain::attachment::{
    Attachment, AttachmentContent, AttachmentId, NewAttachment,
};
use reimburse_core::domain::claim::{
    BookkeepingTarget, Item, ItemId, ItemUpdate, Mileage, MileageId, MileageUpdate,
};
use reimburse_core::domain::creation::EntryDraft;
use reimburse_core::domain::entry::{Entry, EntryId};
use reimburse_core::errors::{ApplicationError, DomainError};
use reimburse_core::retention::RetentionPolicy;

pub mod entry;
pub mod memory;

pub use entry::SqlEntryRepository;
pub use memory::InMemoryEntryRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Domain(error) => Self::Domain(error),
            RepositoryError::Database(error) => Self::Persistence(error.to_string()),
            RepositoryError::Decode(message) => Self::Persistence(message),
        }
    }
}

/// Storage for the entry aggregate and its attachment blobs. Every method runs as one
/// unit of work: either all of its writes land or none do.
#[async_trait]
pub trait EntryRepository: Send + Sync {
    async fn insert_attachment(
        &self,
        upload: NewAttachment,
        uploaded_at: DateTime<Utc>,
    ) -> Result<Attachment, RepositoryError>;

    async fn attachment_content(
        &self,
        id: AttachmentId,
    ) -> Result<Option<AttachmentContent>, RepositoryError>;

    async fn delete_attachment(&self, id: AttachmentId) -> Result<(), RepositoryError>;

    /// Persists every draft and links the referenced attachments. Unknown attachment ids
    /// and ids that already belong to an item abort the whole call.
    async fn create_entries(
        &self,
        drafts: Vec<EntryDraft>,
        submitted_at: DateTime<Utc>,
    ) -> Result<Vec<Entry>, RepositoryError>;

    async fn find_entry(&self, id: EntryId) -> Result<Option<Entry>, RepositoryError>;

    /// Loads the entries in the order given; a missing id is `NotFound`.
    async fn find_entries(&self, ids: &[EntryId]) -> Result<Vec<Entry>, RepositoryError>;

    async fn list_entries(&self) -> Result<Vec<Entry>, RepositoryError>;

    async fn update_item(&self, id: ItemId, update: ItemUpdate) -> Result<Item, RepositoryError>;

    async fn update_mileage(
        &self,
        id: MileageId,
        update: MileageUpdate,
    ) -> Result<Mileage, RepositoryError>;

    async fn update_bookkeeping(
        &self,
        target: BookkeepingTarget,
        account: Option<String>,
    ) -> Result<(), RepositoryError>;

    /// Writes the lifecycle and archived flag of each entry, guarded by the version the
    /// entry was read at. A stale version rolls back the whole batch with
    /// `ConcurrentModification`.
    async fn save_lifecycles(&self, entries: &[Entry]) -> Result<(), RepositoryError>;

    /// Removes an archived entry with its items, mileages and attachments.
    async fn delete_entry(&self, entry: &Entry) -> Result<(), RepositoryError>;

    async fn sweep_archived(
        &self,
        policy: RetentionPolicy,
        today: NaiveDate,
    ) -> Result<Vec<EntryId>, RepositoryError>;

    async fn purge_orphaned_attachments(
        &self,
        uploaded_before: DateTime<Utc>,
    ) -> Result<Vec<AttachmentId>, RepositoryError>;
}

pub(crate) fn normalize_account(account: Option<String>) -> Option<String> {
    account.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

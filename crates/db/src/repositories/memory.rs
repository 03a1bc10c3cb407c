use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use reimburse_core::domain::attachment::{
    Attachment, AttachmentContent, AttachmentId, AttachmentLink, NewAttachment,
};
use reimburse_core::domain::claim::{
    BookkeepingTarget, Item, ItemId, ItemUpdate, Mileage, MileageId, MileageUpdate,
};
use reimburse_core::domain::creation::{DraftClaims, EntryDraft};
use reimburse_core::domain::entry::{Claims, Entry, EntryId, Lifecycle};
use reimburse_core::errors::DomainError;
use reimburse_core::lifecycle::Operation;
use reimburse_core::retention::RetentionPolicy;

use super::{normalize_account, EntryRepository, RepositoryError};

/// Process-local store with the same contract as the SQL repository. Each write works
/// on a copy of the tables and swaps it in only when every step succeeded. Blobs are
/// shared between the copies.
#[derive(Default)]
pub struct InMemoryEntryRepository {
    tables: RwLock<Tables>,
}

impl InMemoryEntryRepository {
    async fn write<T, F>(&self, change: F) -> Result<T, RepositoryError>
    where
        T: Send,
        F: FnOnce(&mut Tables) -> Result<T, DomainError> + Send,
    {
        let mut tables = self.tables.write().await;
        let mut staged = tables.clone();
        let value = change(&mut staged)?;
        *tables = staged;
        Ok(value)
    }
}

#[derive(Clone, Debug, Default)]
struct Tables {
    last_entry_id: i64,
    last_item_id: i64,
    last_mileage_id: i64,
    last_attachment_id: i64,
    entries: BTreeMap<i64, EntryRow>,
    items: BTreeMap<i64, ItemRow>,
    mileages: BTreeMap<i64, Mileage>,
    attachments: BTreeMap<i64, StoredAttachment>,
}

#[derive(Clone, Debug)]
struct EntryRow {
    id: EntryId,
    name: String,
    contact: String,
    iban: String,
    title: String,
    gov_id: Option<String>,
    mileage_claims: bool,
    submitted_at: DateTime<Utc>,
    lifecycle: Lifecycle,
    archived: bool,
    version: i64,
}

#[derive(Clone, Debug)]
struct ItemRow {
    id: ItemId,
    entry_id: EntryId,
    description: String,
    date: NaiveDate,
    account: Option<String>,
}

#[derive(Clone, Debug)]
struct StoredAttachment {
    attachment: Attachment,
    data: Arc<[u8]>,
}

impl Tables {
    fn entry(&self, id: EntryId) -> Option<Entry> {
        let row = self.entries.get(&id.0)?;
        let claims = if row.mileage_claims {
            Claims::Mileages(
                self.mileages.values().filter(|mileage| mileage.entry_id == id).cloned().collect(),
            )
        } else {
            Claims::Items(
                self.items
                    .values()
                    .filter(|item| item.entry_id == id)
                    .filter_map(|item| self.item(item.id))
                    .collect(),
            )
        };

        Some(Entry {
            id: row.id,
            name: row.name.clone(),
            contact: row.contact.clone(),
            iban: row.iban.clone(),
            title: row.title.clone(),
            gov_id: row.gov_id.clone(),
            submitted_at: row.submitted_at,
            lifecycle: row.lifecycle.clone(),
            archived: row.archived,
            claims,
            version: row.version,
        })
    }

    fn item(&self, id: ItemId) -> Option<Item> {
        let row = self.items.get(&id.0)?;
        Some(Item {
            id: row.id,
            entry_id: row.entry_id,
            description: row.description.clone(),
            date: row.date,
            account: row.account.clone(),
            attachments: self
                .attachments
                .values()
                .filter(|stored| stored.attachment.item_id == Some(id))
                .map(|stored| stored.attachment.clone())
                .collect(),
        })
    }

    fn link(&mut self, item_id: ItemId, link: &AttachmentLink) -> Result<(), DomainError> {
        let stored = self
            .attachments
            .get_mut(&link.attachment_id.0)
            .ok_or_else(|| DomainError::not_found("attachment", link.attachment_id.0))?;

        if let Some(owner) = stored.attachment.item_id {
            if owner != item_id {
                return Err(DomainError::validation(format!(
                    "attachment {} already belongs to item {}",
                    link.attachment_id.0, owner.0
                )));
            }
        }

        stored.attachment.item_id = Some(item_id);
        stored.attachment.value_cents = link.value_cents;
        stored.attachment.is_not_receipt = link.is_not_receipt;
        Ok(())
    }

    fn insert_draft(&mut self, draft: EntryDraft, submitted_at: DateTime<Utc>) -> Result<EntryId, DomainError> {
        self.last_entry_id += 1;
        let entry_id = EntryId(self.last_entry_id);
        let mileage_claims = matches!(draft.claims, DraftClaims::Mileages(_));

        self.entries.insert(
            entry_id.0,
            EntryRow {
                id: entry_id,
                name: draft.name,
                contact: draft.contact,
                iban: draft.iban,
                title: draft.title,
                gov_id: draft.gov_id,
                mileage_claims,
                submitted_at,
                lifecycle: Lifecycle::Submitted,
                archived: false,
                version: 0,
            },
        );

        match draft.claims {
            DraftClaims::Items(items) => {
                for item in items {
                    self.last_item_id += 1;
                    let item_id = ItemId(self.last_item_id);
                    self.items.insert(
                        item_id.0,
                        ItemRow {
                            id: item_id,
                            entry_id,
                            description: item.description.trim().to_string(),
                            date: item.date,
                            account: normalize_account(item.account.clone()),
                        },
                    );
                    for link in &item.attachments {
                        self.link(item_id, link)?;
                    }
                }
            }
            DraftClaims::Mileages(mileages) => {
                for mileage in mileages {
                    self.last_mileage_id += 1;
                    self.mileages.insert(
                        self.last_mileage_id,
                        Mileage {
                            id: MileageId(self.last_mileage_id),
                            entry_id,
                            description: mileage.description.trim().to_string(),
                            date: mileage.date,
                            route: mileage.route.trim().to_string(),
                            distance_km: mileage.distance_km,
                            plate_no: mileage.plate_no.trim().to_string(),
                            account: normalize_account(mileage.account),
                        },
                    );
                }
            }
        }

        Ok(entry_id)
    }

    fn remove_entry(&mut self, id: EntryId) {
        let item_ids: BTreeSet<ItemId> =
            self.items.values().filter(|item| item.entry_id == id).map(|item| item.id).collect();
        self.attachments.retain(|_, stored| {
            stored.attachment.item_id.map_or(true, |item_id| !item_ids.contains(&item_id))
        });
        self.items.retain(|_, item| item.entry_id != id);
        self.mileages.retain(|_, mileage| mileage.entry_id != id);
        self.entries.remove(&id.0);
    }
}

#[async_trait::async_trait]
impl EntryRepository for InMemoryEntryRepository {
    async fn insert_attachment(
        &self,
        upload: NewAttachment,
        uploaded_at: DateTime<Utc>,
    ) -> Result<Attachment, RepositoryError> {
        self.write(|tables| {
            tables.last_attachment_id += 1;
            let attachment = Attachment {
                id: AttachmentId(tables.last_attachment_id),
                item_id: None,
                filename: upload.filename,
                file_type: upload.file_type,
                value_cents: None,
                is_not_receipt: false,
                uploaded_at,
            };
            tables.attachments.insert(
                attachment.id.0,
                StoredAttachment { attachment: attachment.clone(), data: upload.data.into() },
            );
            Ok(attachment)
        })
        .await
    }

    async fn attachment_content(
        &self,
        id: AttachmentId,
    ) -> Result<Option<AttachmentContent>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.attachments.get(&id.0).map(|stored| AttachmentContent {
            attachment: stored.attachment.clone(),
            data: stored.data.to_vec(),
        }))
    }

    async fn delete_attachment(&self, id: AttachmentId) -> Result<(), RepositoryError> {
        self.write(|tables| {
            tables
                .attachments
                .remove(&id.0)
                .map(|_| ())
                .ok_or_else(|| DomainError::not_found("attachment", id.0))
        })
        .await
    }

    async fn create_entries(
        &self,
        drafts: Vec<EntryDraft>,
        submitted_at: DateTime<Utc>,
    ) -> Result<Vec<Entry>, RepositoryError> {
        self.write(|tables| {
            let ids = drafts
                .into_iter()
                .map(|draft| tables.insert_draft(draft, submitted_at))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().filter_map(|id| tables.entry(id)).collect())
        })
        .await
    }

    async fn find_entry(&self, id: EntryId) -> Result<Option<Entry>, RepositoryError> {
        Ok(self.tables.read().await.entry(id))
    }

    async fn find_entries(&self, ids: &[EntryId]) -> Result<Vec<Entry>, RepositoryError> {
        let tables = self.tables.read().await;
        ids.iter()
            .map(|id| tables.entry(*id).ok_or_else(|| DomainError::not_found("entry", id.0).into()))
            .collect()
    }

    async fn list_entries(&self) -> Result<Vec<Entry>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.entries.keys().filter_map(|id| tables.entry(EntryId(*id))).collect())
    }

    async fn update_item(&self, id: ItemId, update: ItemUpdate) -> Result<Item, RepositoryError> {
        update.validate()?;
        self.write(|tables| {
            if !tables.items.contains_key(&id.0) {
                return Err(DomainError::not_found("item", id.0));
            }

            let keep: BTreeSet<AttachmentId> =
                update.attachments.iter().map(|link| link.attachment_id).collect();
            tables.attachments.retain(|attachment_id, stored| {
                stored.attachment.item_id != Some(id) || keep.contains(&AttachmentId(*attachment_id))
            });
            for link in &update.attachments {
                tables.link(id, link)?;
            }

            if let Some(row) = tables.items.get_mut(&id.0) {
                row.description = update.description.trim().to_string();
                row.date = update.date;
            }
            tables.item(id).ok_or_else(|| DomainError::not_found("item", id.0))
        })
        .await
    }

    async fn update_mileage(
        &self,
        id: MileageId,
        update: MileageUpdate,
    ) -> Result<Mileage, RepositoryError> {
        update.validate()?;
        self.write(|tables| {
            let mileage = tables
                .mileages
                .get_mut(&id.0)
                .ok_or_else(|| DomainError::not_found("mileage", id.0))?;
            mileage.description = update.description.trim().to_string();
            mileage.date = update.date;
            mileage.route = update.route.trim().to_string();
            mileage.distance_km = update.distance_km;
            mileage.plate_no = update.plate_no.trim().to_string();
            mileage.account = normalize_account(update.account);
            Ok(mileage.clone())
        })
        .await
    }

    async fn update_bookkeeping(
        &self,
        target: BookkeepingTarget,
        account: Option<String>,
    ) -> Result<(), RepositoryError> {
        let account = normalize_account(account);
        self.write(|tables| match target {
            BookkeepingTarget::Item(id) => {
                let item =
                    tables.items.get_mut(&id.0).ok_or_else(|| DomainError::not_found("item", id.0))?;
                item.account = account;
                Ok(())
            }
            BookkeepingTarget::Mileage(id) => {
                let mileage = tables
                    .mileages
                    .get_mut(&id.0)
                    .ok_or_else(|| DomainError::not_found("mileage", id.0))?;
                mileage.account = account;
                Ok(())
            }
        })
        .await
    }

    async fn save_lifecycles(&self, entries: &[Entry]) -> Result<(), RepositoryError> {
        self.write(|tables| {
            for entry in entries {
                let row = tables
                    .entries
                    .get_mut(&entry.id.0)
                    .ok_or_else(|| DomainError::not_found("entry", entry.id.0))?;
                if row.version != entry.version {
                    return Err(DomainError::ConcurrentModification { entry_id: entry.id });
                }
                row.lifecycle = entry.lifecycle.clone();
                row.archived = entry.archived;
                row.version += 1;
            }
            Ok(())
        })
        .await
    }

    async fn delete_entry(&self, entry: &Entry) -> Result<(), RepositoryError> {
        self.write(|tables| {
            let row = tables
                .entries
                .get(&entry.id.0)
                .ok_or_else(|| DomainError::not_found("entry", entry.id.0))?;
            if row.version != entry.version {
                return Err(DomainError::ConcurrentModification { entry_id: entry.id });
            }
            if !row.archived {
                return Err(DomainError::InvalidStateTransition {
                    entry_id: entry.id,
                    status: row.lifecycle.status(),
                    operation: Operation::Delete,
                });
            }
            tables.remove_entry(entry.id);
            Ok(())
        })
        .await
    }

    async fn sweep_archived(
        &self,
        policy: RetentionPolicy,
        today: NaiveDate,
    ) -> Result<Vec<EntryId>, RepositoryError> {
        self.write(|tables| {
            let expired: Vec<EntryId> = tables
                .entries
                .keys()
                .filter_map(|id| tables.entry(EntryId(*id)))
                .filter(|entry| policy.is_expired(entry, today))
                .map(|entry| entry.id)
                .collect();
            for id in &expired {
                tables.remove_entry(*id);
            }
            Ok(expired)
        })
        .await
    }

    async fn purge_orphaned_attachments(
        &self,
        uploaded_before: DateTime<Utc>,
    ) -> Result<Vec<AttachmentId>, RepositoryError> {
        self.write(|tables| {
            let orphaned: Vec<AttachmentId> = tables
                .attachments
                .values()
                .filter(|stored| {
                    !stored.attachment.is_linked() && stored.attachment.uploaded_at < uploaded_before
                })
                .map(|stored| stored.attachment.id)
                .collect();
            for id in &orphaned {
                tables.attachments.remove(&id.0);
            }
            Ok(orphaned)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{NaiveDate, Utc};

    use reimburse_core::domain::attachment::{AttachmentId, AttachmentLink, NewAttachment};
    use reimburse_core::domain::creation::{NewEntry, NewItem};
    use reimburse_core::errors::DomainError;

    use super::InMemoryEntryRepository;
    use crate::repositories::{EntryRepository, RepositoryError};

    fn item(attachments: Vec<AttachmentLink>) -> NewItem {
        NewItem {
            account: None,
            description: "Coffee".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 5, 2).expect("valid date"),
            attachments,
        }
    }

    fn request(items: Vec<NewItem>) -> NewEntry {
        NewEntry {
            name: "Maija".to_string(),
            contact: "maija@example.org".to_string(),
            iban: "DE89370400440532013000".to_string(),
            title: "Board meeting".to_string(),
            gov_id: None,
            items,
            mileages: Vec::new(),
        }
    }

    #[tokio::test]
    async fn failed_write_leaves_tables_untouched() {
        let repo = InMemoryEntryRepository::default();
        let upload = NewAttachment::from_upload(Some("r.png"), b"\x89PNG\r\n\x1a\nrest".to_vec())
            .expect("png upload");
        let attachment = repo.insert_attachment(upload, Utc::now()).await.expect("insert").id;

        let links = vec![
            AttachmentLink { attachment_id: attachment, value_cents: Some(120), is_not_receipt: false },
            AttachmentLink { attachment_id: AttachmentId(42), value_cents: Some(80), is_not_receipt: false },
        ];
        let error = repo
            .create_entries(request(vec![item(links)]).plan().expect("plan"), Utc::now())
            .await
            .expect_err("missing attachment");

        assert!(matches!(
            error,
            RepositoryError::Domain(DomainError::NotFound { resource: "attachment", id: 42 })
        ));
        assert!(repo.list_entries().await.expect("list").is_empty());
        let content = repo.attachment_content(attachment).await.expect("lookup").expect("exists");
        assert_eq!(content.attachment.item_id, None);
        assert_eq!(content.data, b"\x89PNG\r\n\x1a\nrest".to_vec());
    }

    #[tokio::test]
    async fn writes_share_stored_blobs_instead_of_copying_them() {
        let repo = InMemoryEntryRepository::default();
        let upload = NewAttachment::from_upload(Some("r.pdf"), b"%PDF-1.7 receipt".to_vec())
            .expect("pdf upload");
        let attachment = repo.insert_attachment(upload, Utc::now()).await.expect("insert").id;
        let blob = |tables: &super::Tables| {
            Arc::clone(&tables.attachments.get(&attachment.0).expect("stored").data)
        };
        let before = blob(&*repo.tables.read().await);

        let link = AttachmentLink { attachment_id: attachment, value_cents: Some(990), is_not_receipt: false };
        repo.create_entries(request(vec![item(vec![link])]).plan().expect("plan"), Utc::now())
            .await
            .expect("create");

        let after = blob(&*repo.tables.read().await);
        assert!(Arc::ptr_eq(&before, &after));
        let content = repo.attachment_content(attachment).await.expect("lookup").expect("exists");
        assert_eq!(content.data, b"%PDF-1.7 receipt".to_vec());
        assert!(content.attachment.item_id.is_some());
    }

    #[tokio::test]
    async fn ids_are_assigned_in_insertion_order() {
        let repo = InMemoryEntryRepository::default();
        let first = repo
            .create_entries(request(vec![item(Vec::new())]).plan().expect("plan"), Utc::now())
            .await
            .expect("first");
        let second = repo
            .create_entries(request(vec![item(Vec::new())]).plan().expect("plan"), Utc::now())
            .await
            .expect("second");

        assert!(first[0].id < second[0].id);
        assert!(first[0].items()[0].id < second[0].items()[0].id);
        let found = repo.find_entries(&[second[0].id, first[0].id]).await.expect("find");
        assert_eq!(found[0].id, second[0].id);
    }
}

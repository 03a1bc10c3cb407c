use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use reimburse_core::domain::attachment::{
    Attachment, AttachmentContent, AttachmentId, AttachmentLink, FileType, NewAttachment,
};
use reimburse_core::domain::claim::{
    BookkeepingTarget, Item, ItemId, ItemUpdate, Mileage, MileageId, MileageUpdate,
};
use reimburse_core::domain::creation::{DraftClaims, EntryDraft};
use reimburse_core::domain::entry::{Claims, Entry, EntryId, EntryStatus, Lifecycle};
use reimburse_core::errors::DomainError;
use reimburse_core::lifecycle::Operation;
use reimburse_core::retention::RetentionPolicy;

use super::{normalize_account, EntryRepository, RepositoryError};
use crate::DbPool;

const DATE_FORMAT: &str = "%Y-%m-%d";

const ENTRY_COLUMNS: &str = "id, name, contact, iban, title, gov_id, claim_kind, status,
    submitted_at, approval_date, approval_note, rejection_date, paid_date, archived, version";

const ATTACHMENT_COLUMNS: &str =
    "id, item_id, filename, file_type, value_cents, is_not_receipt, uploaded_at";

pub struct SqlEntryRepository {
    pool: DbPool,
}

impl SqlEntryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl EntryRepository for SqlEntryRepository {
    async fn insert_attachment(
        &self,
        upload: NewAttachment,
        uploaded_at: DateTime<Utc>,
    ) -> Result<Attachment, RepositoryError> {
        let stored_at = encode_timestamp(uploaded_at);
        let id = sqlx::query(
            "INSERT INTO attachment (item_id, filename, file_type, data, value_cents, is_not_receipt, uploaded_at)
             VALUES (NULL, ?, ?, ?, NULL, 0, ?)",
        )
        .bind(&upload.filename)
        .bind(upload.file_type.as_str())
        .bind(&upload.data)
        .bind(&stored_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Attachment {
            id: AttachmentId(id),
            item_id: None,
            filename: upload.filename,
            file_type: upload.file_type,
            value_cents: None,
            is_not_receipt: false,
            uploaded_at: parse_timestamp("uploaded_at", stored_at)?,
        })
    }

    async fn attachment_content(
        &self,
        id: AttachmentId,
    ) -> Result<Option<AttachmentContent>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {ATTACHMENT_COLUMNS}, data FROM attachment WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(AttachmentContent { attachment: attachment_from_row(&row)?, data: row.try_get("data")? })
        })
        .transpose()
    }

    async fn delete_attachment(&self, id: AttachmentId) -> Result<(), RepositoryError> {
        let deleted = sqlx::query("DELETE FROM attachment WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(DomainError::not_found("attachment", id.0).into());
        }
        Ok(())
    }

    async fn create_entries(
        &self,
        drafts: Vec<EntryDraft>,
        submitted_at: DateTime<Utc>,
    ) -> Result<Vec<Entry>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let submitted_at = encode_timestamp(submitted_at);
        let mut ids = Vec::with_capacity(drafts.len());

        for draft in drafts {
            let claim_kind = match draft.claims {
                DraftClaims::Items(_) => "items",
                DraftClaims::Mileages(_) => "mileages",
            };
            let entry_id = sqlx::query(
                "INSERT INTO entry (name, contact, iban, title, gov_id, claim_kind, status, submitted_at)
                 VALUES (?, ?, ?, ?, ?, ?, 'submitted', ?)",
            )
            .bind(&draft.name)
            .bind(&draft.contact)
            .bind(&draft.iban)
            .bind(&draft.title)
            .bind(draft.gov_id.as_deref())
            .bind(claim_kind)
            .bind(&submitted_at)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            match draft.claims {
                DraftClaims::Items(items) => {
                    for item in items {
                        let item_id = sqlx::query(
                            "INSERT INTO item (entry_id, description, date, account) VALUES (?, ?, ?, ?)",
                        )
                        .bind(entry_id)
                        .bind(item.description.trim())
                        .bind(encode_date(item.date))
                        .bind(normalize_account(item.account.clone()))
                        .execute(&mut *tx)
                        .await?
                        .last_insert_rowid();

                        for link in &item.attachments {
                            link_attachment(&mut tx, ItemId(item_id), link).await?;
                        }
                    }
                }
                DraftClaims::Mileages(mileages) => {
                    for mileage in mileages {
                        sqlx::query(
                            "INSERT INTO mileage (entry_id, description, date, route, distance, plate_no, account)
                             VALUES (?, ?, ?, ?, ?, ?, ?)",
                        )
                        .bind(entry_id)
                        .bind(mileage.description.trim())
                        .bind(encode_date(mileage.date))
                        .bind(mileage.route.trim())
                        .bind(mileage.distance_km)
                        .bind(mileage.plate_no.trim())
                        .bind(normalize_account(mileage.account))
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            }
            ids.push(EntryId(entry_id));
        }

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = load_entry(&mut tx, id).await?.ok_or_else(|| {
                RepositoryError::Decode(format!("entry {id} vanished during creation"))
            })?;
            entries.push(entry);
        }

        tx.commit().await?;
        Ok(entries)
    }

    async fn find_entry(&self, id: EntryId) -> Result<Option<Entry>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        load_entry(&mut conn, id).await
    }

    async fn find_entries(&self, ids: &[EntryId]) -> Result<Vec<Entry>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = load_entry(&mut conn, *id)
                .await?
                .ok_or_else(|| DomainError::not_found("entry", id.0))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn list_entries(&self) -> Result<Vec<Entry>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        let ids = sqlx::query("SELECT id FROM entry ORDER BY id ASC")
            .fetch_all(&mut *conn)
            .await?
            .iter()
            .map(|row| row.try_get::<i64, _>("id").map(EntryId))
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = load_entry(&mut conn, id).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn update_item(&self, id: ItemId, update: ItemUpdate) -> Result<Item, RepositoryError> {
        update.validate()?;
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT id FROM item WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(DomainError::not_found("item", id.0).into());
        }

        let keep: BTreeSet<i64> =
            update.attachments.iter().map(|link| link.attachment_id.0).collect();
        let owned = sqlx::query("SELECT id FROM attachment WHERE item_id = ?")
            .bind(id.0)
            .fetch_all(&mut *tx)
            .await?;
        for row in owned {
            let attachment_id = row.try_get::<i64, _>("id")?;
            if !keep.contains(&attachment_id) {
                sqlx::query("DELETE FROM attachment WHERE id = ?")
                    .bind(attachment_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for link in &update.attachments {
            link_attachment(&mut tx, id, link).await?;
        }

        sqlx::query("UPDATE item SET description = ?, date = ? WHERE id = ?")
            .bind(update.description.trim())
            .bind(encode_date(update.date))
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        let item = load_item(&mut tx, id)
            .await?
            .ok_or_else(|| DomainError::not_found("item", id.0))?;
        tx.commit().await?;
        Ok(item)
    }

    async fn update_mileage(
        &self,
        id: MileageId,
        update: MileageUpdate,
    ) -> Result<Mileage, RepositoryError> {
        update.validate()?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE mileage
             SET description = ?, date = ?, route = ?, distance = ?, plate_no = ?, account = ?
             WHERE id = ?",
        )
        .bind(update.description.trim())
        .bind(encode_date(update.date))
        .bind(update.route.trim())
        .bind(update.distance_km)
        .bind(update.plate_no.trim())
        .bind(normalize_account(update.account))
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DomainError::not_found("mileage", id.0).into());
        }

        let row = sqlx::query(
            "SELECT id, entry_id, description, date, route, distance, plate_no, account
             FROM mileage WHERE id = ?",
        )
        .bind(id.0)
        .fetch_one(&mut *tx)
        .await?;
        let mileage = mileage_from_row(&row)?;
        tx.commit().await?;
        Ok(mileage)
    }

    async fn update_bookkeeping(
        &self,
        target: BookkeepingTarget,
        account: Option<String>,
    ) -> Result<(), RepositoryError> {
        let (statement, resource, id) = match target {
            BookkeepingTarget::Item(id) => ("UPDATE item SET account = ? WHERE id = ?", "item", id.0),
            BookkeepingTarget::Mileage(id) => {
                ("UPDATE mileage SET account = ? WHERE id = ?", "mileage", id.0)
            }
        };

        let updated = sqlx::query(statement)
            .bind(normalize_account(account))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(DomainError::not_found(resource, id).into());
        }
        Ok(())
    }

    async fn save_lifecycles(&self, entries: &[Entry]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            let lifecycle = &entry.lifecycle;
            let updated = sqlx::query(
                "UPDATE entry
                 SET status = ?, approval_date = ?, approval_note = ?, rejection_date = ?,
                     paid_date = ?, archived = ?, version = version + 1
                 WHERE id = ? AND version = ?",
            )
            .bind(lifecycle.status().as_str())
            .bind(lifecycle.approval_date().map(encode_date))
            .bind(lifecycle.approval_note())
            .bind(lifecycle.rejection_date().map(encode_date))
            .bind(lifecycle.paid_date().map(encode_date))
            .bind(entry.archived)
            .bind(entry.id.0)
            .bind(entry.version)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                return Err(missing_or_stale(&mut tx, entry.id).await?.into());
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_entry(&self, entry: &Entry) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status, archived, version FROM entry WHERE id = ?")
            .bind(entry.id.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DomainError::not_found("entry", entry.id.0))?;

        if row.try_get::<i64, _>("version")? != entry.version {
            return Err(DomainError::ConcurrentModification { entry_id: entry.id }.into());
        }
        if !row.try_get::<bool, _>("archived")? {
            return Err(DomainError::InvalidStateTransition {
                entry_id: entry.id,
                status: parse_status(row.try_get("status")?)?,
                operation: Operation::Delete,
            }
            .into());
        }

        delete_entry_rows(&mut tx, entry.id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn sweep_archived(
        &self,
        policy: RetentionPolicy,
        today: NaiveDate,
    ) -> Result<Vec<EntryId>, RepositoryError> {
        let cutoff = encode_date(policy.cutoff(today));
        let mut tx = self.pool.begin().await?;

        let ids = sqlx::query(
            "SELECT id FROM entry
             WHERE archived = 1
               AND ((status = 'paid' AND paid_date < ?) OR (status = 'denied' AND rejection_date < ?))
             ORDER BY id ASC",
        )
        .bind(&cutoff)
        .bind(&cutoff)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.try_get::<i64, _>("id").map(EntryId))
        .collect::<Result<Vec<_>, _>>()?;

        for id in &ids {
            delete_entry_rows(&mut tx, *id).await?;
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn purge_orphaned_attachments(
        &self,
        uploaded_before: DateTime<Utc>,
    ) -> Result<Vec<AttachmentId>, RepositoryError> {
        let cutoff = encode_timestamp(uploaded_before);
        let mut tx = self.pool.begin().await?;

        let ids = sqlx::query(
            "SELECT id FROM attachment WHERE item_id IS NULL AND uploaded_at < ? ORDER BY id ASC",
        )
        .bind(&cutoff)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.try_get::<i64, _>("id").map(AttachmentId))
        .collect::<Result<Vec<_>, _>>()?;

        sqlx::query("DELETE FROM attachment WHERE item_id IS NULL AND uploaded_at < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(ids)
    }
}

/// Points an attachment at `item_id` and records its declared value. The attachment must
/// exist and be either unlinked or already owned by the same item.
async fn link_attachment(
    conn: &mut SqliteConnection,
    item_id: ItemId,
    link: &AttachmentLink,
) -> Result<(), RepositoryError> {
    let row = sqlx::query("SELECT item_id FROM attachment WHERE id = ?")
        .bind(link.attachment_id.0)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DomainError::not_found("attachment", link.attachment_id.0))?;

    if let Some(owner) = row.try_get::<Option<i64>, _>("item_id")? {
        if owner != item_id.0 {
            return Err(DomainError::validation(format!(
                "attachment {} already belongs to item {owner}",
                link.attachment_id.0
            ))
            .into());
        }
    }

    sqlx::query("UPDATE attachment SET item_id = ?, value_cents = ?, is_not_receipt = ? WHERE id = ?")
        .bind(item_id.0)
        .bind(link.value_cents)
        .bind(link.is_not_receipt)
        .bind(link.attachment_id.0)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn missing_or_stale(
    conn: &mut SqliteConnection,
    id: EntryId,
) -> Result<DomainError, RepositoryError> {
    let exists = sqlx::query("SELECT id FROM entry WHERE id = ?")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?
        .is_some();

    Ok(if exists {
        DomainError::ConcurrentModification { entry_id: id }
    } else {
        DomainError::not_found("entry", id.0)
    })
}

async fn delete_entry_rows(conn: &mut SqliteConnection, id: EntryId) -> Result<(), RepositoryError> {
    sqlx::query("DELETE FROM attachment WHERE item_id IN (SELECT id FROM item WHERE entry_id = ?)")
        .bind(id.0)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM item WHERE entry_id = ?").bind(id.0).execute(&mut *conn).await?;
    sqlx::query("DELETE FROM mileage WHERE entry_id = ?").bind(id.0).execute(&mut *conn).await?;
    sqlx::query("DELETE FROM entry WHERE id = ?").bind(id.0).execute(&mut *conn).await?;
    Ok(())
}

async fn load_entry(
    conn: &mut SqliteConnection,
    id: EntryId,
) -> Result<Option<Entry>, RepositoryError> {
    let Some(row) = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM entry WHERE id = ?"))
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };

    let claim_kind = row.try_get::<String, _>("claim_kind")?;
    let claims = match claim_kind.as_str() {
        "items" => Claims::Items(load_items(conn, id).await?),
        "mileages" => Claims::Mileages(load_mileages(conn, id).await?),
        other => return Err(RepositoryError::Decode(format!("unknown claim kind `{other}`"))),
    };

    entry_from_row(&row, claims).map(Some)
}

async fn load_items(conn: &mut SqliteConnection, entry_id: EntryId) -> Result<Vec<Item>, RepositoryError> {
    let ids = sqlx::query("SELECT id FROM item WHERE entry_id = ? ORDER BY id ASC")
        .bind(entry_id.0)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|row| row.try_get::<i64, _>("id").map(ItemId))
        .collect::<Result<Vec<_>, _>>()?;

    let mut items = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(item) = load_item(conn, id).await? {
            items.push(item);
        }
    }
    Ok(items)
}

async fn load_item(conn: &mut SqliteConnection, id: ItemId) -> Result<Option<Item>, RepositoryError> {
    let Some(row) =
        sqlx::query("SELECT id, entry_id, description, date, account FROM item WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?
    else {
        return Ok(None);
    };

    let attachments = sqlx::query(&format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachment WHERE item_id = ? ORDER BY id ASC"
    ))
    .bind(id.0)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(attachment_from_row)
    .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(Item {
        id: ItemId(row.try_get("id")?),
        entry_id: EntryId(row.try_get("entry_id")?),
        description: row.try_get("description")?,
        date: parse_date("date", row.try_get("date")?)?,
        account: row.try_get("account")?,
        attachments,
    }))
}

async fn load_mileages(
    conn: &mut SqliteConnection,
    entry_id: EntryId,
) -> Result<Vec<Mileage>, RepositoryError> {
    sqlx::query(
        "SELECT id, entry_id, description, date, route, distance, plate_no, account
         FROM mileage WHERE entry_id = ? ORDER BY id ASC",
    )
    .bind(entry_id.0)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(mileage_from_row)
    .collect()
}

fn entry_from_row(row: &SqliteRow, claims: Claims) -> Result<Entry, RepositoryError> {
    let status = parse_status(row.try_get("status")?)?;
    let lifecycle = Lifecycle::from_columns(
        status,
        parse_optional_date("approval_date", row.try_get("approval_date")?)?,
        row.try_get("approval_note")?,
        parse_optional_date("rejection_date", row.try_get("rejection_date")?)?,
        parse_optional_date("paid_date", row.try_get("paid_date")?)?,
    )
    .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(Entry {
        id: EntryId(row.try_get("id")?),
        name: row.try_get("name")?,
        contact: row.try_get("contact")?,
        iban: row.try_get("iban")?,
        title: row.try_get("title")?,
        gov_id: row.try_get("gov_id")?,
        submitted_at: parse_timestamp("submitted_at", row.try_get("submitted_at")?)?,
        lifecycle,
        archived: row.try_get("archived")?,
        claims,
        version: row.try_get("version")?,
    })
}

fn mileage_from_row(row: &SqliteRow) -> Result<Mileage, RepositoryError> {
    Ok(Mileage {
        id: MileageId(row.try_get("id")?),
        entry_id: EntryId(row.try_get("entry_id")?),
        description: row.try_get("description")?,
        date: parse_date("date", row.try_get("date")?)?,
        route: row.try_get("route")?,
        distance_km: row.try_get("distance")?,
        plate_no: row.try_get("plate_no")?,
        account: row.try_get("account")?,
    })
}

fn attachment_from_row(row: &SqliteRow) -> Result<Attachment, RepositoryError> {
    let file_type_raw = row.try_get::<String, _>("file_type")?;
    let file_type = FileType::parse(&file_type_raw);
    if !file_type.is_supported() {
        return Err(RepositoryError::Decode(format!("unknown file type `{file_type_raw}`")));
    }

    Ok(Attachment {
        id: AttachmentId(row.try_get("id")?),
        item_id: row.try_get::<Option<i64>, _>("item_id")?.map(ItemId),
        filename: row.try_get("filename")?,
        file_type,
        value_cents: row.try_get("value_cents")?,
        is_not_receipt: row.try_get("is_not_receipt")?,
        uploaded_at: parse_timestamp("uploaded_at", row.try_get("uploaded_at")?)?,
    })
}

fn parse_status(value: String) -> Result<EntryStatus, RepositoryError> {
    value.parse().map_err(|_| RepositoryError::Decode(format!("unknown entry status `{value}`")))
}

fn encode_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Fixed-width UTC form so that stored timestamps order correctly as text.
fn encode_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_date(column: &str, value: String) -> Result<NaiveDate, RepositoryError> {
    NaiveDate::parse_from_str(&value, DATE_FORMAT).map_err(|error| {
        RepositoryError::Decode(format!("invalid date in `{column}`: `{value}` ({error})"))
    })
}

fn parse_optional_date(
    column: &str,
    value: Option<String>,
) -> Result<Option<NaiveDate>, RepositoryError> {
    value.map(|date| parse_date(column, date)).transpose()
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

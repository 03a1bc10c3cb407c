use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use reimburse_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, CallerContext};
use reimburse_core::config::AppConfig;
use reimburse_core::domain::attachment::{Attachment, AttachmentContent, AttachmentId, NewAttachment};
use reimburse_core::domain::claim::{
    BookkeepingTarget, Item, ItemId, ItemUpdate, Mileage, MileageId, MileageUpdate,
};
use reimburse_core::domain::creation::NewEntry;
use reimburse_core::domain::entry::{Entry, EntryId, EntryStatus};
use reimburse_core::errors::{ApplicationError, DomainError};
use reimburse_core::lifecycle::{
    LifecycleEngine, Transition, TransitionOutcome, BATCH_EXPORT_STATUSES, SINGLE_EXPORT_STATUSES,
};
use reimburse_core::retention::RetentionPolicy;
use reimburse_db::EntryRepository;
use reimburse_documents::{
    AttachmentBlobs, ExportGenerator, ExportSource, PdfGenerator, RenderedDocument,
};

/// Entry point for every operation on reimbursement entries. Holds the repository, the
/// lifecycle rules, both document generators and the audit sink.
pub struct ReimbursementService<R> {
    repository: Arc<R>,
    engine: LifecycleEngine,
    audit: Arc<dyn AuditSink>,
    pdf: PdfGenerator,
    export: ExportGenerator,
    retention: RetentionPolicy,
}

impl<R> Clone for ReimbursementService<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            engine: self.engine,
            audit: Arc::clone(&self.audit),
            pdf: self.pdf.clone(),
            export: self.export.clone(),
            retention: self.retention,
        }
    }
}

impl<R> ReimbursementService<R>
where
    R: EntryRepository + 'static,
{
    pub fn new(repository: R, config: &AppConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            repository: Arc::new(repository),
            engine: LifecycleEngine,
            audit,
            pdf: PdfGenerator::from_config(config),
            export: ExportGenerator::from_config(config),
            retention: config.retention_policy(),
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Stores an upload unlinked. Bytes without a recognised signature are rejected before
    /// anything is written.
    pub async fn upload_attachment(
        &self,
        caller: &CallerContext,
        filename: Option<&str>,
        data: Vec<u8>,
    ) -> Result<Attachment, ApplicationError> {
        let upload = match NewAttachment::from_upload(filename, data) {
            Ok(upload) => upload,
            Err(error) => {
                self.emit(
                    AuditEvent::new(
                        None,
                        caller,
                        "attachment.upload_rejected",
                        AuditCategory::Attachment,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("error", error.to_string()),
                );
                return Err(error.into());
            }
        };

        let attachment = self.repository.insert_attachment(upload, Utc::now()).await?;
        self.emit(
            AuditEvent::new(
                None,
                caller,
                "attachment.uploaded",
                AuditCategory::Attachment,
                AuditOutcome::Success,
            )
            .with_metadata("attachment_id", attachment.id.0.to_string())
            .with_metadata("file_type", attachment.file_type.as_str()),
        );
        Ok(attachment)
    }

    pub async fn attachment_content(
        &self,
        id: AttachmentId,
    ) -> Result<AttachmentContent, ApplicationError> {
        self.repository
            .attachment_content(id)
            .await?
            .ok_or_else(|| DomainError::not_found("attachment", id.0).into())
    }

    pub async fn delete_attachment(
        &self,
        caller: &CallerContext,
        id: AttachmentId,
    ) -> Result<(), ApplicationError> {
        self.repository.delete_attachment(id).await?;
        self.emit(
            AuditEvent::new(
                None,
                caller,
                "attachment.deleted",
                AuditCategory::Attachment,
                AuditOutcome::Success,
            )
            .with_metadata("attachment_id", id.0.to_string()),
        );
        Ok(())
    }

    /// Validates and persists a submission. A request with both items and mileages
    /// yields two entries, mileage entry first.
    pub async fn create_entry(
        &self,
        caller: &CallerContext,
        request: NewEntry,
    ) -> Result<Vec<Entry>, ApplicationError> {
        let drafts = request.plan()?;
        let entries = self.repository.create_entries(drafts, Utc::now()).await?;

        for entry in &entries {
            self.emit(
                AuditEvent::new(
                    Some(entry.id),
                    caller,
                    "entry.created",
                    AuditCategory::Ingress,
                    AuditOutcome::Success,
                )
                .with_metadata("claims", entry.claims.len().to_string())
                .with_metadata("travel", entry.is_travel().to_string()),
            );
        }
        info!(
            event_name = "entry.created",
            correlation_id = %caller.correlation_id,
            entry_ids = %join_ids(entries.iter().map(|entry| entry.id)),
            "entries created"
        );
        Ok(entries)
    }

    pub async fn get_entry(&self, id: EntryId) -> Result<Entry, ApplicationError> {
        self.repository
            .find_entry(id)
            .await?
            .ok_or_else(|| DomainError::not_found("entry", id.0).into())
    }

    pub async fn list_entries(&self) -> Result<Vec<Entry>, ApplicationError> {
        Ok(self.repository.list_entries().await?)
    }

    pub async fn update_item(
        &self,
        caller: &CallerContext,
        id: ItemId,
        update: ItemUpdate,
    ) -> Result<Item, ApplicationError> {
        let item = self.repository.update_item(id, update).await?;
        self.emit(
            AuditEvent::new(
                Some(item.entry_id),
                caller,
                "item.updated",
                AuditCategory::Ingress,
                AuditOutcome::Success,
            )
            .with_metadata("item_id", id.0.to_string())
            .with_metadata("attachments", item.attachments.len().to_string()),
        );
        Ok(item)
    }

    pub async fn update_mileage(
        &self,
        caller: &CallerContext,
        id: MileageId,
        update: MileageUpdate,
    ) -> Result<Mileage, ApplicationError> {
        let mileage = self.repository.update_mileage(id, update).await?;
        self.emit(
            AuditEvent::new(
                Some(mileage.entry_id),
                caller,
                "mileage.updated",
                AuditCategory::Ingress,
                AuditOutcome::Success,
            )
            .with_metadata("mileage_id", id.0.to_string()),
        );
        Ok(mileage)
    }

    pub async fn update_bookkeeping(
        &self,
        caller: &CallerContext,
        target: BookkeepingTarget,
        account: Option<String>,
    ) -> Result<(), ApplicationError> {
        self.repository.update_bookkeeping(target, account).await?;
        self.emit(
            AuditEvent::new(
                None,
                caller,
                "bookkeeping.updated",
                AuditCategory::Ingress,
                AuditOutcome::Success,
            )
            .with_metadata("target", format!("{target:?}")),
        );
        Ok(())
    }

    /// Applies `transition` to every listed entry or to none of them. Duplicate ids are
    /// collapsed; an empty list is a validation error.
    pub async fn transition(
        &self,
        caller: &CallerContext,
        ids: &[EntryId],
        transition: Transition,
    ) -> Result<Vec<TransitionOutcome>, ApplicationError> {
        let ids = distinct(ids)?;
        let mut entries = self.repository.find_entries(&ids).await?;
        let outcomes =
            self.engine.apply_batch_with_audit(&mut entries, &transition, self.audit.as_ref(), caller)?;

        if let Err(error) = self.repository.save_lifecycles(&entries).await {
            warn!(
                event_name = "entry.transition_not_saved",
                correlation_id = %caller.correlation_id,
                operation = transition.operation().as_str(),
                entry_ids = %join_ids(ids.iter().copied()),
                error = %error,
                "transition rolled back"
            );
            return Err(error.into());
        }
        Ok(outcomes)
    }

    pub async fn approve(
        &self,
        caller: &CallerContext,
        ids: &[EntryId],
        date: NaiveDate,
        note: &str,
    ) -> Result<Vec<TransitionOutcome>, ApplicationError> {
        self.transition(caller, ids, Transition::Approve { date, note: note.to_string() }).await
    }

    /// Denies with today's date as the rejection date.
    pub async fn deny(
        &self,
        caller: &CallerContext,
        ids: &[EntryId],
    ) -> Result<Vec<TransitionOutcome>, ApplicationError> {
        self.transition(caller, ids, Transition::Deny { today: Utc::now().date_naive() }).await
    }

    pub async fn pay(
        &self,
        caller: &CallerContext,
        ids: &[EntryId],
        date: NaiveDate,
    ) -> Result<Vec<TransitionOutcome>, ApplicationError> {
        self.transition(caller, ids, Transition::Pay { date }).await
    }

    pub async fn reset(
        &self,
        caller: &CallerContext,
        ids: &[EntryId],
    ) -> Result<Vec<TransitionOutcome>, ApplicationError> {
        self.transition(caller, ids, Transition::Reset).await
    }

    pub async fn archive(
        &self,
        caller: &CallerContext,
        ids: &[EntryId],
    ) -> Result<Vec<TransitionOutcome>, ApplicationError> {
        self.transition(caller, ids, Transition::Archive).await
    }

    pub async fn delete_entry(
        &self,
        caller: &CallerContext,
        id: EntryId,
    ) -> Result<(), ApplicationError> {
        let entry = self.get_entry(id).await?;
        if let Err(error) = self.engine.ensure_deletable(&entry) {
            self.emit(
                AuditEvent::new(
                    Some(id),
                    caller,
                    "entry.delete_rejected",
                    AuditCategory::Lifecycle,
                    AuditOutcome::Rejected,
                )
                .with_metadata("status", entry.status().as_str()),
            );
            return Err(error.into());
        }

        self.repository.delete_entry(&entry).await?;
        self.emit(AuditEvent::new(
            Some(id),
            caller,
            "entry.deleted",
            AuditCategory::Lifecycle,
            AuditOutcome::Success,
        ));
        Ok(())
    }

    /// Printable form of one entry in any status.
    pub async fn entry_pdf(
        &self,
        caller: &CallerContext,
        id: EntryId,
    ) -> Result<RenderedDocument, ApplicationError> {
        let entry = self.get_entry(id).await?;
        let document = self.render_pdf(entry).await;
        self.audit_document(caller, &[id], "document.pdf_rendered", &document);
        document
    }

    /// Accounting file for a single approved or paid entry. The entry's PDF is bundled
    /// only once it is paid.
    pub async fn export_entry(
        &self,
        caller: &CallerContext,
        id: EntryId,
    ) -> Result<RenderedDocument, ApplicationError> {
        let entry = self.get_entry(id).await?;
        self.engine.ensure_exportable(&entry, SINGLE_EXPORT_STATUSES)?;

        let pdf = if entry.status() == EntryStatus::Paid {
            Some(self.render_pdf(entry.clone()).await?)
        } else {
            None
        };
        let document = self.render_export(vec![ExportSource { entry, pdf }]).await;
        self.audit_document(caller, &[id], "document.export_rendered", &document);
        document
    }

    /// Accounting file for several paid entries, each with its PDF. Every entry is
    /// checked before anything is rendered.
    pub async fn export_entries(
        &self,
        caller: &CallerContext,
        ids: &[EntryId],
    ) -> Result<RenderedDocument, ApplicationError> {
        let ids = distinct(ids)?;
        let entries = self.repository.find_entries(&ids).await?;
        for entry in &entries {
            self.engine.ensure_exportable(entry, BATCH_EXPORT_STATUSES)?;
        }

        let mut sources = Vec::with_capacity(entries.len());
        for entry in entries {
            let pdf = self.render_pdf(entry.clone()).await?;
            sources.push(ExportSource { entry, pdf: Some(pdf) });
        }
        let document = self.render_export(sources).await;
        self.audit_document(caller, &ids, "document.export_rendered", &document);
        document
    }

    /// Deletes archived entries whose paid or rejection date is older than the
    /// configured age limit, counted back from `today`.
    pub async fn sweep_archived(
        &self,
        caller: &CallerContext,
        today: NaiveDate,
    ) -> Result<Vec<EntryId>, ApplicationError> {
        let swept = self.repository.sweep_archived(self.retention, today).await?;
        self.emit(
            AuditEvent::new(
                None,
                caller,
                "retention.sweep_completed",
                AuditCategory::Retention,
                AuditOutcome::Success,
            )
            .with_metadata("cutoff", self.retention.cutoff(today).to_string())
            .with_metadata("deleted", join_ids(swept.iter().copied())),
        );
        Ok(swept)
    }

    /// Deletes unlinked uploads older than the orphan grace period.
    pub async fn purge_orphaned_attachments(
        &self,
        caller: &CallerContext,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<AttachmentId>, ApplicationError> {
        let purged =
            self.repository.purge_orphaned_attachments(self.retention.orphan_cutoff(now)).await?;
        self.emit(
            AuditEvent::new(
                None,
                caller,
                "retention.orphans_purged",
                AuditCategory::Retention,
                AuditOutcome::Success,
            )
            .with_metadata("count", purged.len().to_string()),
        );
        Ok(purged)
    }

    async fn attachment_blobs(&self, entry: &Entry) -> Result<AttachmentBlobs, ApplicationError> {
        let mut blobs = AttachmentBlobs::new();
        for attachment in entry.attachments() {
            if let Some(content) = self.repository.attachment_content(attachment.id).await? {
                blobs.insert(attachment.id, content.data);
            }
        }
        Ok(blobs)
    }

    async fn render_pdf(&self, entry: Entry) -> Result<RenderedDocument, ApplicationError> {
        let blobs = self.attachment_blobs(&entry).await?;
        let generator = self.pdf.clone();
        let generated_at = Utc::now();
        tokio::task::spawn_blocking(move || generator.generate(&entry, &blobs, generated_at))
            .await
            .map_err(|error| ApplicationError::Render(format!("pdf worker failed: {error}")))?
            .map_err(ApplicationError::from)
    }

    async fn render_export(
        &self,
        sources: Vec<ExportSource>,
    ) -> Result<RenderedDocument, ApplicationError> {
        let generator = self.export.clone();
        tokio::task::spawn_blocking(move || generator.generate(sources))
            .await
            .map_err(|error| ApplicationError::Render(format!("export worker failed: {error}")))?
            .map_err(ApplicationError::from)
    }

    fn audit_document(
        &self,
        caller: &CallerContext,
        ids: &[EntryId],
        event_type: &str,
        result: &Result<RenderedDocument, ApplicationError>,
    ) {
        let entry_id = match ids {
            [single] => Some(*single),
            _ => None,
        };
        let event = match result {
            Ok(document) => AuditEvent::new(
                entry_id,
                caller,
                event_type,
                AuditCategory::Document,
                AuditOutcome::Success,
            )
            .with_metadata("filename", document.filename.clone())
            .with_metadata("bytes", document.bytes.len().to_string()),
            Err(error) => AuditEvent::new(
                entry_id,
                caller,
                event_type,
                AuditCategory::Document,
                AuditOutcome::Failed,
            )
            .with_metadata("error", error.to_string()),
        };
        self.emit(event.with_metadata("entry_ids", join_ids(ids.iter().copied())));
    }

    fn emit(&self, event: AuditEvent) {
        self.audit.emit(event);
    }
}

fn distinct(ids: &[EntryId]) -> Result<Vec<EntryId>, DomainError> {
    if ids.is_empty() {
        return Err(DomainError::validation("at least one entry id is required"));
    }
    let mut seen = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.contains(id) {
            seen.push(*id);
        }
    }
    Ok(seen)
}

fn join_ids(ids: impl Iterator<Item = EntryId>) -> String {
    ids.map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use chrono::{Duration, NaiveDate, Utc};
    use image::{DynamicImage, ImageFormat, RgbImage};

    use reimburse_core::audit::{AuditOutcome, CallerContext, InMemoryAuditSink};
    use reimburse_core::config::AppConfig;
    use reimburse_core::domain::attachment::AttachmentLink;
    use reimburse_core::domain::creation::{NewEntry, NewItem, NewMileage};
    use reimburse_core::domain::entry::{EntryId, EntryStatus};
    use reimburse_core::errors::{ApplicationError, DomainError};
    use reimburse_db::InMemoryEntryRepository;

    use super::ReimbursementService;

    fn service() -> (ReimbursementService<InMemoryEntryRepository>, InMemoryAuditSink) {
        let sink = InMemoryAuditSink::default();
        let service = ReimbursementService::new(
            InMemoryEntryRepository::default(),
            &AppConfig::default(),
            Arc::new(sink.clone()),
        );
        (service, sink)
    }

    fn caller() -> CallerContext {
        CallerContext::new("treasurer@example.org", "req-test")
    }

    fn day(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).expect("valid date")
    }

    fn png() -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(40, 30))
            .write_to(&mut bytes, ImageFormat::Png)
            .expect("encode png");
        bytes.into_inner()
    }

    fn request(links: Vec<AttachmentLink>, with_mileage: bool) -> NewEntry {
        NewEntry {
            name: "Teemu Teekkari".to_string(),
            contact: "teemu@example.org".to_string(),
            iban: "FI21 1234 5600 0007 85".to_string(),
            title: "Sauna evening".to_string(),
            gov_id: Some("131052-308T".to_string()),
            items: vec![NewItem {
                account: None,
                description: "Sausages".to_string(),
                date: day(1),
                attachments: links,
            }],
            mileages: if with_mileage {
                vec![NewMileage {
                    account: None,
                    description: "Supplies run".to_string(),
                    date: day(1),
                    route: "Otaniemi - Kamppi".to_string(),
                    distance_km: 12.0,
                    plate_no: "XYZ-789".to_string(),
                }]
            } else {
                Vec::new()
            },
        }
    }

    async fn submitted_with_receipt(
        service: &ReimbursementService<InMemoryEntryRepository>,
    ) -> EntryId {
        let attachment = service
            .upload_attachment(&caller(), Some("receipt.png"), png())
            .await
            .expect("upload");
        let link = AttachmentLink {
            attachment_id: attachment.id,
            value_cents: Some(1999),
            is_not_receipt: false,
        };
        service.create_entry(&caller(), request(vec![link], false)).await.expect("create")[0].id
    }

    #[tokio::test]
    async fn unsupported_uploads_are_rejected_without_storing_anything() {
        let (service, sink) = service();

        let error = service
            .upload_attachment(&caller(), Some("notes.txt"), b"plain text".to_vec())
            .await
            .expect_err("unsupported");
        assert_eq!(error, ApplicationError::Domain(DomainError::UnsupportedFileFormat));

        let purged = service
            .purge_orphaned_attachments(&caller(), Utc::now() + Duration::days(365))
            .await
            .expect("purge");
        assert!(purged.is_empty());
        assert_eq!(sink.events()[0].outcome, AuditOutcome::Rejected);
    }

    #[tokio::test]
    async fn mixed_requests_create_two_entries() {
        let (service, _) = service();
        let entries = service.create_entry(&caller(), request(Vec::new(), true)).await.expect("create");

        assert_eq!(entries.len(), 2);
        assert_eq!(entries.iter().filter(|entry| entry.is_travel()).count(), 1);
        assert_eq!(service.list_entries().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn failing_batch_member_leaves_every_entry_untouched() {
        let (service, sink) = service();
        let first = submitted_with_receipt(&service).await;
        let second = submitted_with_receipt(&service).await;
        service.deny(&caller(), &[second]).await.expect("deny");

        let error = service
            .approve(&caller(), &[first, second], day(10), "Board 6/2024")
            .await
            .expect_err("second entry is denied");
        assert!(matches!(
            error,
            ApplicationError::Domain(DomainError::InvalidStateTransition { entry_id, .. }) if entry_id == second
        ));
        assert_eq!(service.get_entry(first).await.expect("first").status(), EntryStatus::Submitted);
        assert!(sink
            .events()
            .iter()
            .any(|event| event.event_type == "entry.transition_rejected"));
    }

    #[tokio::test]
    async fn entries_move_through_the_full_lifecycle() {
        let (service, _) = service();
        let id = submitted_with_receipt(&service).await;

        service.approve(&caller(), &[id, id], day(10), "Board 6/2024").await.expect("approve");
        service.pay(&caller(), &[id], day(12)).await.expect("pay");
        let delete_early = service.delete_entry(&caller(), id).await;
        assert!(matches!(
            delete_early,
            Err(ApplicationError::Domain(DomainError::InvalidStateTransition { .. }))
        ));

        service.archive(&caller(), &[id]).await.expect("archive");
        service.delete_entry(&caller(), id).await.expect("delete");
        assert!(matches!(
            service.get_entry(id).await,
            Err(ApplicationError::Domain(DomainError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn empty_batches_are_validation_errors() {
        let (service, _) = service();
        assert!(matches!(
            service.reset(&caller(), &[]).await,
            Err(ApplicationError::Domain(DomainError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn exports_respect_status_gates() {
        let (service, _) = service();
        let id = submitted_with_receipt(&service).await;

        let submitted = service.export_entry(&caller(), id).await;
        assert!(matches!(
            submitted,
            Err(ApplicationError::Domain(DomainError::InvalidStateTransition { .. }))
        ));

        service.approve(&caller(), &[id], day(10), "Board 6/2024").await.expect("approve");
        let approved = service.export_entry(&caller(), id).await.expect("single export");
        assert_eq!(approved.content_type, "text/csv");
        assert!(matches!(
            service.export_entries(&caller(), &[id]).await,
            Err(ApplicationError::Domain(DomainError::InvalidStateTransition { .. }))
        ));

        service.pay(&caller(), &[id], day(12)).await.expect("pay");
        let paid = service.export_entries(&caller(), &[id]).await.expect("batch export");
        assert_eq!(paid.content_type, "application/zip");
    }

    #[tokio::test]
    async fn pdf_rendering_runs_for_every_status() {
        let (service, sink) = service();
        let id = submitted_with_receipt(&service).await;

        let document = service.entry_pdf(&caller(), id).await.expect("pdf");
        assert!(document.bytes.starts_with(b"%PDF"));
        assert!(document.filename.starts_with("Teemu_Teekkari-"));
        assert!(sink
            .events()
            .iter()
            .any(|event| event.event_type == "document.pdf_rendered"
                && event.outcome == AuditOutcome::Success));
    }
}

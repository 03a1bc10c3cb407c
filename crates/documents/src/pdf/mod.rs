//! Printable reimbursement form for a single entry.
//!
//! The first pages hold the submitter details, the status line and the claim table.
//! Every attachment of the entry follows as a numbered appendix: raster receipts as one
//! page each, PDF receipts page by page with the appendix label drawn over them.

mod appendix;
mod layout;

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Object, ObjectId, Stream, StringFormat};
use rust_decimal::prelude::RoundingStrategy;
use rust_decimal::Decimal;

use reimburse_core::config::{AppConfig, DocumentsConfig, ReimbursementConfig};
use reimburse_core::domain::attachment::{Attachment, AttachmentId, FileType};
use reimburse_core::domain::entry::{Entry, Lifecycle};

use crate::charset::encode_legacy;
use crate::error::RenderError;
use crate::{file_stem, RenderedDocument, PDF_CONTENT_TYPE};
use appendix::{ImageLimits, IMAGE_NAME, LABEL_FONT};
use layout::{real, Summary, SummaryRow, BOLD_FONT, PAGE_HEIGHT, PAGE_WIDTH, REGULAR_FONT};

/// Raw attachment bytes keyed by attachment id.
pub type AttachmentBlobs = BTreeMap<AttachmentId, Vec<u8>>;

const PRODUCER: &str = "reimburse-documents";

pub(crate) fn euros(cents: i64) -> String {
    money(Decimal::new(cents, 2))
}

pub(crate) fn money(value: Decimal) -> String {
    format!("{:.2}", value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

fn display_date(date: NaiveDate) -> String {
    date.format("%d.%m.%Y").to_string()
}

#[derive(Clone, Debug)]
pub struct PdfGenerator {
    organization_name: String,
    mileage_rate: Decimal,
    limits: ImageLimits,
}

struct Appendix<'a> {
    number: usize,
    attachment: &'a Attachment,
    bytes: &'a [u8],
    file_type: FileType,
}

impl PdfGenerator {
    pub fn new(reimbursement: &ReimbursementConfig, documents: &DocumentsConfig) -> Self {
        Self {
            organization_name: documents.organization_name.clone(),
            mileage_rate: reimbursement.mileage_rate,
            limits: ImageLimits {
                max_dimension: documents.max_image_dimension,
                jpeg_quality: documents.jpeg_quality,
            },
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.reimbursement, &config.documents)
    }

    /// `{name}-{DD-MM-YYYY}-{id}.pdf` with the name reduced to file-safe characters.
    pub fn filename(entry: &Entry) -> String {
        format!(
            "{}-{}-{}.pdf",
            file_stem(&entry.name),
            entry.submission_date().format("%d-%m-%Y"),
            entry.id
        )
    }

    /// Renders `entry` with its appendix pages. `generated_at` stamps the status line and
    /// the document metadata, so equal inputs give byte-identical output.
    pub fn generate(
        &self,
        entry: &Entry,
        blobs: &AttachmentBlobs,
        generated_at: DateTime<Utc>,
    ) -> Result<RenderedDocument, RenderError> {
        let status = status_lines(entry, generated_at.date_naive())?;
        let appendices = collect_appendices(entry, blobs)?;
        let summary = self.summary(entry, status, &appendices);

        let mut builder = PdfBuilder::new();
        for operations in layout::summary_pages(&summary) {
            builder.add_page(operations, None)?;
        }

        for appendix in &appendices {
            let label = appendix::label(appendix.number, appendix.attachment);
            let attachment_id = appendix.attachment.id.0;
            if appendix.file_type == FileType::Pdf {
                let page_ids = appendix::import_pdf_pages(
                    &mut builder.doc,
                    attachment_id,
                    appendix.bytes,
                    self.limits,
                )?;
                for page_id in page_ids {
                    appendix::label_imported_page(
                        &mut builder.doc,
                        page_id,
                        builder.pages_id,
                        builder.bold_font,
                        &label,
                    )?;
                    builder.kids.push(page_id);
                }
            } else {
                let raster = appendix::prepare_raster(
                    attachment_id,
                    appendix.bytes,
                    appendix.file_type,
                    self.limits,
                )?;
                let image_id = builder.doc.add_object(appendix::image_xobject(&raster));
                builder.add_page(appendix::image_page_operations(&label, &raster), Some(image_id))?;
            }
        }

        let info = dictionary! {
            "Title" => pdf_text(&summary.header),
            "Author" => pdf_text(&self.organization_name),
            "Subject" => pdf_text(&format!("Entry {}: {}", entry.id, entry.title)),
            "Producer" => pdf_text(PRODUCER),
            "CreationDate" => pdf_text(&generated_at.format("D:%Y%m%d%H%M%SZ").to_string())
        };
        let bytes = builder.finish(info)?;

        tracing::debug!(
            event_name = "documents.pdf_rendered",
            entry_id = entry.id.0,
            appendix_count = appendices.len(),
            byte_count = bytes.len(),
            "entry document rendered"
        );

        Ok(RenderedDocument {
            filename: Self::filename(entry),
            content_type: PDF_CONTENT_TYPE,
            bytes,
        })
    }

    fn summary(&self, entry: &Entry, status: Vec<String>, appendices: &[Appendix<'_>]) -> Summary {
        let form = if entry.is_travel() { "Travel reimbursement form" } else { "Expense reimbursement form" };

        let mut info = vec![format!("Name: {}", entry.name), format!("IBAN: {}", entry.iban)];
        if let Some(gov_id) = &entry.gov_id {
            info.push(format!("Government ID: {gov_id}"));
        }
        info.push(format!("Date: {}", display_date(entry.submission_date())));

        let reference_column = if entry.is_travel() { "Mileage allowance" } else { "Receipts" };
        let rate = format!("{} €/km", self.mileage_rate.normalize());

        let mut rows = Vec::new();
        for item in entry.items() {
            let numbers: Vec<String> = appendices
                .iter()
                .filter(|appendix| appendix.attachment.item_id == Some(item.id))
                .map(|appendix| appendix.number.to_string())
                .collect();
            rows.push(SummaryRow {
                date: display_date(item.date),
                description: item.description.clone(),
                reference: if entry.is_travel() {
                    rate.clone()
                } else if numbers.is_empty() {
                    "-".to_string()
                } else {
                    numbers.join(", ")
                },
                price: format!("{} €", money(item.price())),
            });
        }
        for mileage in entry.mileages() {
            rows.push(SummaryRow {
                date: display_date(mileage.date),
                description: format!(
                    "Mileage allowance: {}\nRoute: {}\nDistance: {} km\nPlate: {}",
                    mileage.description,
                    mileage.route,
                    mileage.distance().normalize(),
                    mileage.plate_no
                ),
                reference: rate.clone(),
                price: format!("{} €", money(mileage.price(self.mileage_rate))),
            });
        }

        Summary {
            header: format!("{} - {form}", self.organization_name),
            info,
            status,
            reason: format!("Reason: {}", entry.title),
            columns: ["Date", "Description", reference_column, "Price"].map(String::from),
            rows,
            total: format!("{} €", money(entry.total(self.mileage_rate))),
        }
    }
}

/// Status wording per lifecycle state. Blank approval notes are refused rather than
/// printed, since a form without its approval basis is not a valid record.
fn status_lines(entry: &Entry, today: NaiveDate) -> Result<Vec<String>, RenderError> {
    let missing_note = |note: &str| {
        if note.trim().is_empty() {
            Err(RenderError::Precondition {
                entry_id: entry.id,
                status: entry.status(),
                problem: "the approval note is missing".to_string(),
            })
        } else {
            Ok(())
        }
    };

    Ok(match &entry.lifecycle {
        Lifecycle::Submitted => vec![format!("Awaiting approval (as of {})", display_date(today))],
        Lifecycle::Approved { approval_date, approval_note } => {
            missing_note(approval_note)?;
            vec![
                format!("Approved {}, basis: {approval_note}", display_date(*approval_date)),
                format!("Not paid (as of {})", display_date(today)),
            ]
        }
        Lifecycle::Paid { approval_date, approval_note, paid_date } => {
            missing_note(approval_note)?;
            vec![
                format!("Approved {}, basis: {approval_note}", display_date(*approval_date)),
                format!("Paid {}", display_date(*paid_date)),
            ]
        }
        Lifecycle::Denied { rejection_date } => {
            vec![format!("Denied ({})", display_date(*rejection_date))]
        }
    })
}

/// Numbers every attachment in item order. Attachments flagged as non-receipts are
/// rendered too; only their value is left out of the label.
fn collect_appendices<'a>(
    entry: &'a Entry,
    blobs: &'a AttachmentBlobs,
) -> Result<Vec<Appendix<'a>>, RenderError> {
    entry
        .attachments()
        .enumerate()
        .map(|(index, attachment)| {
            let bytes =
                blobs.get(&attachment.id).ok_or(RenderError::MissingAttachment(attachment.id.0))?;
            let file_type = FileType::detect(bytes);
            if !file_type.is_supported() {
                return Err(RenderError::corrupt(attachment.id.0, "unsupported file signature"));
            }
            Ok(Appendix { number: index + 1, attachment, bytes, file_type })
        })
        .collect()
}

fn pdf_text(value: &str) -> Object {
    Object::String(encode_legacy(value), StringFormat::Literal)
}

struct PdfBuilder {
    doc: lopdf::Document,
    pages_id: ObjectId,
    regular_font: ObjectId,
    bold_font: ObjectId,
    kids: Vec<ObjectId>,
}

impl PdfBuilder {
    fn new() -> Self {
        let mut doc = lopdf::Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let regular_font = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding"
        });
        let bold_font = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica-Bold",
            "Encoding" => "WinAnsiEncoding"
        });
        Self { doc, pages_id, regular_font, bold_font, kids: Vec::new() }
    }

    fn add_page(
        &mut self,
        operations: Vec<Operation>,
        image: Option<ObjectId>,
    ) -> Result<ObjectId, RenderError> {
        let content_id =
            self.doc.add_object(Stream::new(Dictionary::new(), Content { operations }.encode()?));

        let mut resources = dictionary! {
            "Font" => dictionary! {
                REGULAR_FONT => self.regular_font,
                BOLD_FONT => self.bold_font,
                LABEL_FONT => self.bold_font
            }
        };
        if let Some(image_id) = image {
            resources.set("XObject", dictionary! { IMAGE_NAME => image_id });
        }

        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![Object::Integer(0), Object::Integer(0), real(PAGE_WIDTH), real(PAGE_HEIGHT)],
            "Contents" => content_id,
            "Resources" => resources
        });
        self.kids.push(page_id);
        Ok(page_id)
    }

    fn finish(mut self, info: Dictionary) -> Result<Vec<u8>, RenderError> {
        let count = i64::try_from(self.kids.len()).unwrap_or(i64::MAX);
        let kids: Vec<Object> = self.kids.iter().copied().map(Object::Reference).collect();
        self.doc.objects.insert(
            self.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count
            }),
        );

        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id
        });
        let info_id = self.doc.add_object(info);
        self.doc.trailer.set("Root", catalog_id);
        self.doc.trailer.set("Info", info_id);
        self.doc.compress();

        let mut bytes = Vec::new();
        self.doc.save_to(&mut bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};
    use image::{DynamicImage, ImageFormat, RgbImage};
    use rust_decimal::Decimal;

    use reimburse_core::config::{DocumentsConfig, ReimbursementConfig};
    use reimburse_core::domain::attachment::{Attachment, AttachmentId, FileType};
    use reimburse_core::domain::claim::{Item, ItemId, Mileage, MileageId};
    use reimburse_core::domain::entry::{Claims, Entry, EntryId, Lifecycle};

    use super::{status_lines, AttachmentBlobs, PdfGenerator};
    use crate::error::RenderError;

    fn generator() -> PdfGenerator {
        PdfGenerator::new(
            &ReimbursementConfig {
                mileage_rate: Decimal::new(25, 2),
                mileage_product_code: "v2025_kmkorv".to_string(),
            },
            &DocumentsConfig {
                organization_name: "Guild".to_string(),
                max_image_dimension: 800,
                jpeg_quality: 80,
            },
        )
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).expect("valid date")
    }

    fn attachment(id: i64, item: i64, file_type: FileType, value_cents: i64) -> Attachment {
        Attachment {
            id: AttachmentId(id),
            item_id: Some(ItemId(item)),
            filename: format!("receipt-{id}"),
            file_type,
            value_cents: Some(value_cents),
            is_not_receipt: false,
            uploaded_at: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).single().expect("timestamp"),
        }
    }

    fn entry(lifecycle: Lifecycle, claims: Claims, gov_id: Option<&str>) -> Entry {
        Entry {
            id: EntryId(17),
            name: "Essi Esimerkki".to_string(),
            contact: "essi@example.org".to_string(),
            iban: "FI2112345600000785".to_string(),
            title: "Spring excursion".to_string(),
            gov_id: gov_id.map(str::to_string),
            submitted_at: Utc.with_ymd_and_hms(2024, 3, 4, 12, 30, 0).single().expect("timestamp"),
            lifecycle,
            archived: false,
            claims,
            version: 0,
        }
    }

    fn png() -> Vec<u8> {
        let mut bytes = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(1200, 600))
            .write_to(&mut bytes, ImageFormat::Png)
            .expect("encode png");
        bytes.into_inner()
    }

    fn receipt_pdf() -> Vec<u8> {
        use lopdf::content::{Content, Operation};
        use lopdf::{dictionary, Object, Stream};

        let mut doc = lopdf::Document::with_version("1.4");
        let pages_id = doc.new_object_id();
        let content = Content {
            operations: vec![
                Operation::new("re", vec![10_i64.into(), 10_i64.into(), 50_i64.into(), 50_i64.into()]),
                Operation::new("f", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(lopdf::Dictionary::new(), content.encode().expect("encode")));
        let mut kids = Vec::new();
        for _ in 0..2 {
            kids.push(Object::Reference(doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id
            })));
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => 2_i64,
                "MediaBox" => vec![0_i64.into(), 0_i64.into(), 300_i64.into(), 400_i64.into()],
                "Resources" => lopdf::Dictionary::new()
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).expect("save receipt");
        bytes
    }

    fn items_entry(lifecycle: Lifecycle) -> (Entry, AttachmentBlobs) {
        let item = Item {
            id: ItemId(5),
            entry_id: EntryId(17),
            description: "Bus tickets".to_string(),
            date: date(2),
            account: None,
            attachments: vec![
                attachment(1, 5, FileType::Png, 1250),
                attachment(2, 5, FileType::Pdf, 800),
            ],
        };
        let blobs = AttachmentBlobs::from([(AttachmentId(1), png()), (AttachmentId(2), receipt_pdf())]);
        (entry(lifecycle, Claims::Items(vec![item]), None), blobs)
    }

    #[test]
    fn renders_summary_and_every_appendix_page() {
        let (entry, blobs) = items_entry(Lifecycle::Submitted);
        let generated_at = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).single().expect("timestamp");

        let document = generator().generate(&entry, &blobs, generated_at).expect("render");

        assert_eq!(document.filename, "Essi_Esimerkki-04-03-2024-17.pdf");
        assert_eq!(document.content_type, "application/pdf");
        let parsed = lopdf::Document::load_mem(&document.bytes).expect("valid pdf");
        assert_eq!(parsed.get_pages().len(), 1 + 1 + 2);
    }

    #[test]
    fn rendering_is_deterministic_for_a_fixed_timestamp() {
        let (entry, blobs) = items_entry(Lifecycle::Submitted);
        let generated_at = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).single().expect("timestamp");

        let first = generator().generate(&entry, &blobs, generated_at).expect("render");
        let second = generator().generate(&entry, &blobs, generated_at).expect("render");
        assert_eq!(first.bytes, second.bytes);
    }

    #[test]
    fn approved_entry_without_note_fails_before_rendering() {
        let lifecycle = Lifecycle::Approved { approval_date: date(5), approval_note: "  ".to_string() };
        let (entry, blobs) = items_entry(lifecycle);

        let error = generator().generate(&entry, &blobs, Utc::now()).expect_err("precondition");
        assert!(matches!(error, RenderError::Precondition { .. }));
    }

    #[test]
    fn missing_or_unknown_blobs_are_fatal() {
        let (entry, mut blobs) = items_entry(Lifecycle::Submitted);
        blobs.remove(&AttachmentId(2));
        let error = generator().generate(&entry, &blobs, Utc::now()).expect_err("missing blob");
        assert!(matches!(error, RenderError::MissingAttachment(2)));

        blobs.insert(AttachmentId(2), b"not a receipt".to_vec());
        let error = generator().generate(&entry, &blobs, Utc::now()).expect_err("unknown bytes");
        assert!(matches!(error, RenderError::CorruptAttachment { attachment_id: 2, .. }));
    }

    #[test]
    fn status_lines_follow_the_lifecycle() {
        let today = date(20);
        let paid = Lifecycle::Paid {
            approval_date: date(5),
            approval_note: "Board 3/2024".to_string(),
            paid_date: date(9),
        };
        let lines = status_lines(&entry(paid, Claims::Items(Vec::new()), None), today).expect("paid");
        assert_eq!(lines, vec!["Approved 05.03.2024, basis: Board 3/2024", "Paid 09.03.2024"]);

        let denied = Lifecycle::Denied { rejection_date: date(6) };
        let lines = status_lines(&entry(denied, Claims::Items(Vec::new()), None), today).expect("denied");
        assert_eq!(lines, vec!["Denied (06.03.2024)"]);
    }

    #[test]
    fn travel_entries_render_mileage_rows() {
        let mileage = Mileage {
            id: MileageId(3),
            entry_id: EntryId(17),
            description: "Board meeting".to_string(),
            date: date(2),
            route: "Espoo - Tampere".to_string(),
            distance_km: 180.0,
            plate_no: "ABC-123".to_string(),
            account: None,
        };
        let entry = entry(Lifecycle::Submitted, Claims::Mileages(vec![mileage]), Some("131052-308T"));
        let summary = generator().summary(&entry, Vec::new(), &[]);

        assert_eq!(summary.header, "Guild - Travel reimbursement form");
        assert!(summary.info.contains(&"Government ID: 131052-308T".to_string()));
        assert_eq!(summary.columns[2], "Mileage allowance");
        assert_eq!(summary.rows[0].reference, "0.25 €/km");
        assert_eq!(summary.rows[0].price, "45.00 €");
        assert!(summary.rows[0].description.contains("Distance: 180 km"));
        assert_eq!(summary.total, "45.00 €");
    }
}

//! Accounting import file.
//!
//! Entries are turned into accounting records, records of the same payee are merged,
//! and each record is written as a `K` (expense) and/or `T` (travel) header row followed
//! by its item rows. The file is semicolon separated and Windows-1252 encoded. When any
//! record still carries its PDF the CSV is bundled with the PDFs into a ZIP archive.

use std::io::{Cursor, Write};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use reimburse_core::config::{AppConfig, ReimbursementConfig};
use reimburse_core::domain::entry::{Entry, EntryId};

use crate::charset::encode_legacy;
use crate::error::RenderError;
use crate::{file_stem, RenderedDocument, CSV_CONTENT_TYPE, ZIP_CONTENT_TYPE};

const DESCRIPTION_LIMIT: usize = 80;
const PAYMENT_METHOD: &str = "Tilisiirto";

/// An entry to export together with its rendered form, if one was produced.
#[derive(Clone, Debug)]
pub struct ExportSource {
    pub entry: Entry,
    pub pdf: Option<RenderedDocument>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowKind {
    Expense,
    Mileage,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExportRow {
    pub kind: RowKind,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub account: Option<String>,
}

/// One payee's rows. Merged records keep every constituent entry id but no PDF, since
/// the import format references a single attachment per record.
#[derive(Clone, Debug)]
pub struct AccountingRecord {
    pub entry_ids: Vec<EntryId>,
    pub name: String,
    pub iban: String,
    pub gov_id: String,
    pub submission_date: NaiveDate,
    pub rows: Vec<ExportRow>,
    pub pdf: Option<RenderedDocument>,
}

impl AccountingRecord {
    fn same_payee(&self, other: &Self) -> bool {
        self.iban == other.iban && self.gov_id == other.gov_id
    }

    fn absorb(&mut self, other: Self) {
        self.rows.extend(other.rows);
        self.entry_ids.extend(other.entry_ids);
        self.submission_date = self.submission_date.min(other.submission_date);
        self.pdf = None;
    }

    fn has(&self, kind: RowKind) -> bool {
        self.rows.iter().any(|row| row.kind == kind)
    }

    fn joined_ids(&self) -> String {
        join_ids(&self.entry_ids)
    }
}

#[derive(Clone, Debug)]
pub struct ExportGenerator {
    mileage_rate: Decimal,
    mileage_product_code: String,
}

impl ExportGenerator {
    pub fn new(reimbursement: &ReimbursementConfig) -> Self {
        Self {
            mileage_rate: reimbursement.mileage_rate,
            mileage_product_code: reimbursement.mileage_product_code.clone(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.reimbursement)
    }

    pub fn rows(&self, entry: &Entry) -> Vec<ExportRow> {
        let items = entry.items().iter().map(|item| ExportRow {
            kind: RowKind::Expense,
            description: item.description.clone(),
            quantity: Decimal::ONE,
            unit_price: item.price(),
            account: item.account.clone(),
        });
        let mileages = entry.mileages().iter().map(|mileage| ExportRow {
            kind: RowKind::Mileage,
            description: format!("Mileage allowance: {}", mileage.description),
            quantity: mileage.distance(),
            unit_price: self.mileage_rate,
            account: mileage.account.clone(),
        });
        items.chain(mileages).collect()
    }

    pub fn record(&self, source: ExportSource) -> AccountingRecord {
        let ExportSource { entry, pdf } = source;
        AccountingRecord {
            entry_ids: vec![entry.id],
            rows: self.rows(&entry),
            iban: strip_whitespace(&entry.iban),
            gov_id: entry.gov_id.as_deref().map(strip_whitespace).unwrap_or_default(),
            submission_date: entry.submission_date(),
            name: entry.name,
            pdf,
        }
    }

    /// Folds records of the same payee (whitespace-insensitive IBAN and government id)
    /// into the first record seen for that payee, keeping first-seen order.
    pub fn merge(records: Vec<AccountingRecord>) -> Vec<AccountingRecord> {
        let mut merged: Vec<AccountingRecord> = Vec::new();
        for record in records {
            match merged.iter_mut().find(|existing| existing.same_payee(&record)) {
                Some(existing) => existing.absorb(record),
                None => merged.push(record),
            }
        }
        merged
    }

    /// Writes the CSV rows for already merged records, encoded as Windows-1252.
    pub fn csv(&self, records: &[AccountingRecord]) -> Result<Vec<u8>, RenderError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .flexible(true)
            .quote_style(csv::QuoteStyle::Never)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());

        for record in records {
            for kind in [RowKind::Expense, RowKind::Mileage] {
                if !record.has(kind) {
                    continue;
                }
                writer.write_record(header_fields(record, kind))?;
                for row in record.rows.iter().filter(|row| row.kind == kind) {
                    writer.write_record(self.row_fields(row))?;
                }
            }
        }

        let bytes = writer.into_inner().map_err(|error| RenderError::Io(error.into_error()))?;
        Ok(encode_legacy(&String::from_utf8_lossy(&bytes)))
    }

    /// Builds the export for `sources` in the given order. The first source names the
    /// file; the result is a bare CSV unless some merged record still has its PDF.
    pub fn generate(&self, sources: Vec<ExportSource>) -> Result<RenderedDocument, RenderError> {
        let Some(first) = sources.first() else {
            return Err(RenderError::EmptyExport);
        };
        let date = first.entry.submission_date().format("%Y-%m-%d").to_string();
        let document_name = format!("{}-{date}-{}", file_stem(&first.entry.name), first.entry.id);
        let ids: Vec<EntryId> = sources.iter().map(|source| source.entry.id).collect();
        let multi_name = format!("{date}-entries-{}", join_ids(&ids));
        let single = sources.len() == 1;

        let records = Self::merge(sources.into_iter().map(|source| self.record(source)).collect());
        let csv = self.csv(&records)?;
        let pdfs: Vec<&RenderedDocument> =
            records.iter().filter_map(|record| record.pdf.as_ref()).collect();

        let stem = if single { &document_name } else { &multi_name };
        let document = if pdfs.is_empty() {
            RenderedDocument {
                filename: format!("{stem}.csv"),
                content_type: CSV_CONTENT_TYPE,
                bytes: csv,
            }
        } else {
            RenderedDocument {
                filename: format!("{stem}.zip"),
                content_type: ZIP_CONTENT_TYPE,
                bytes: bundle(&format!("{multi_name}.csv"), &csv, &pdfs)?,
            }
        };

        tracing::debug!(
            event_name = "documents.export_rendered",
            entry_ids = %join_ids(&ids),
            record_count = records.len(),
            pdf_count = pdfs.len(),
            filename = %document.filename,
            "accounting export rendered"
        );
        Ok(document)
    }

    fn row_fields(&self, row: &ExportRow) -> Vec<String> {
        let (product_code, unit) = match row.kind {
            RowKind::Expense => ("", "kpl"),
            RowKind::Mileage => (self.mileage_product_code.as_str(), "km"),
        };
        let mut fields = vec![
            String::new(),
            truncate_description(&row.description),
            product_code.to_string(),
            row.quantity.normalize().to_string(),
            unit.to_string(),
            price_field(row.unit_price),
            "0".to_string(),
            "0".to_string(),
        ];
        fields.extend(blanks(5));
        fields.push(row.account.clone().unwrap_or_default());
        fields
    }
}

fn header_fields(record: &AccountingRecord, kind: RowKind) -> Vec<String> {
    let (code, gov_id) = match kind {
        RowKind::Expense => ("K", ""),
        RowKind::Mileage => ("T", record.gov_id.as_str()),
    };
    let date = record.submission_date.format("%d.%m.%Y").to_string();
    let notes = match &record.pdf {
        Some(_) => String::new(),
        None => format!("Remember to attach the PDFs: {}", record.joined_ids()),
    };
    let pdf_name = record.pdf.as_ref().map(|pdf| pdf.filename.clone()).unwrap_or_default();

    let name = single_line(&record.name);
    let mut fields: Vec<String> = [code, "EUR", "", record.iban.as_str(), gov_id, PAYMENT_METHOD, name.as_str()]
        .iter()
        .map(|field| field.to_string())
        .collect();
    fields.extend(["", "0", "t", "t", "0"].map(String::from));
    fields.extend([date.clone(), String::new(), date]);
    fields.extend(blanks(4));
    fields.push(notes);
    fields.extend(blanks(5));
    fields.push("6".to_string());
    fields.extend(blanks(2));
    fields.push("t".to_string());
    fields.extend(blanks(4));
    fields.push(pdf_name);
    fields
}

fn blanks(count: usize) -> Vec<String> {
    vec![String::new(); count]
}

fn bundle(csv_name: &str, csv: &[u8], pdfs: &[&RenderedDocument]) -> Result<Vec<u8>, RenderError> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(csv_name, options)?;
    zip.write_all(csv)?;
    for pdf in pdfs {
        zip.start_file(pdf.filename.as_str(), options)?;
        zip.write_all(&pdf.bytes)?;
    }
    Ok(zip.finish()?.into_inner())
}

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|ch| !ch.is_whitespace()).collect()
}

fn join_ids(ids: &[EntryId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join("-")
}

fn truncate_description(value: &str) -> String {
    single_line(&value.chars().take(DESCRIPTION_LIMIT).collect::<String>())
}

/// Fields are written unquoted, so a line break would split the record.
fn single_line(value: &str) -> String {
    value.chars().map(|ch| if ch == '\n' || ch == '\r' { ' ' } else { ch }).collect()
}

/// At least two decimals, more only when the value carries them (e.g. a 0.255 €/km rate).
fn price_field(value: Decimal) -> String {
    let value = value.normalize();
    if value.scale() < 2 {
        format!("{value:.2}")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use reimburse_core::config::ReimbursementConfig;
    use reimburse_core::domain::attachment::{Attachment, AttachmentId, FileType};
    use reimburse_core::domain::claim::{Item, ItemId, Mileage, MileageId};
    use reimburse_core::domain::entry::{Claims, Entry, EntryId, Lifecycle};

    use super::{price_field, truncate_description, ExportGenerator, ExportSource};
    use crate::error::RenderError;
    use crate::RenderedDocument;

    fn generator() -> ExportGenerator {
        ExportGenerator::new(&ReimbursementConfig {
            mileage_rate: Decimal::new(25, 2),
            mileage_product_code: "v2025_kmkorv".to_string(),
        })
    }

    fn paid() -> Lifecycle {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 5, 2).expect("date");
        Lifecycle::Paid { approval_date: date, approval_note: "Board 4/2024".to_string(), paid_date: date }
    }

    fn item(entry: i64, description: &str, cents: i64) -> Item {
        Item {
            id: ItemId(entry * 10),
            entry_id: EntryId(entry),
            description: description.to_string(),
            date: chrono::NaiveDate::from_ymd_opt(2024, 4, 20).expect("date"),
            account: Some("4000".to_string()),
            attachments: vec![Attachment {
                id: AttachmentId(entry * 100),
                item_id: Some(ItemId(entry * 10)),
                filename: "receipt.png".to_string(),
                file_type: FileType::Png,
                value_cents: Some(cents),
                is_not_receipt: false,
                uploaded_at: Utc::now(),
            }],
        }
    }

    fn entry(id: i64, iban: &str, day: u32, claims: Claims, gov_id: Option<&str>) -> Entry {
        Entry {
            id: EntryId(id),
            name: "Maija Meikäläinen".to_string(),
            contact: "maija@example.org".to_string(),
            iban: iban.to_string(),
            title: "Club evening".to_string(),
            gov_id: gov_id.map(str::to_string),
            submitted_at: Utc.with_ymd_and_hms(2024, 4, day, 10, 0, 0).single().expect("timestamp"),
            lifecycle: paid(),
            archived: false,
            claims,
            version: 0,
        }
    }

    fn pdf(name: &str) -> RenderedDocument {
        RenderedDocument {
            filename: name.to_string(),
            content_type: "application/pdf",
            bytes: b"%PDF-1.5 test".to_vec(),
        }
    }

    fn lines(bytes: &[u8]) -> Vec<String> {
        bytes
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| line.iter().map(|byte| char::from(*byte)).collect())
            .collect()
    }

    #[test]
    fn single_entry_without_pdf_is_a_bare_csv() {
        let source = ExportSource {
            entry: entry(7, "FI21 1234 5600 0007 85", 21, Claims::Items(vec![item(7, "Snacks", 1250)]), None),
            pdf: None,
        };

        let document = generator().generate(vec![source]).expect("export");

        assert_eq!(document.filename, "Maija_Meik_l_inen-2024-04-21-7.csv");
        assert_eq!(document.content_type, "text/csv");
        let rows = lines(&document.bytes);
        assert_eq!(rows.len(), 2);

        let header: Vec<&str> = rows[0].split(';').collect();
        assert_eq!(header.len(), 34);
        assert_eq!(header[0], "K");
        assert_eq!(header[3], "FI2112345600000785");
        assert_eq!(header[4], "");
        assert_eq!(header[12], "21.04.2024");
        assert_eq!(header[19], "Remember to attach the PDFs: 7");

        let row: Vec<&str> = rows[1].split(';').collect();
        assert_eq!(row.len(), 14);
        assert_eq!(&row[1..6], &["Snacks", "", "1", "kpl", "12.50"]);
        assert_eq!(row[13], "4000");
    }

    #[test]
    fn output_is_windows_1252() {
        let source = ExportSource {
            entry: entry(7, "FI2112345600000785", 21, Claims::Items(vec![item(7, "Kahvi", 300)]), None),
            pdf: None,
        };
        let document = generator().generate(vec![source]).expect("export");
        assert!(document.bytes.contains(&0xE4));
        assert!(std::str::from_utf8(&document.bytes).is_err());
    }

    #[test]
    fn same_payee_entries_merge_and_drop_their_pdfs() {
        let gov_id = Some("131052-308T");
        let mileage = Mileage {
            id: MileageId(1),
            entry_id: EntryId(9),
            description: "Trip\nto the venue".to_string(),
            date: chrono::NaiveDate::from_ymd_opt(2024, 4, 18).expect("date"),
            route: "Espoo - Vantaa".to_string(),
            distance_km: 42.5,
            plate_no: "ABC-123".to_string(),
            account: None,
        };
        let sources = vec![
            ExportSource {
                entry: entry(8, "FI00 1234", 22, Claims::Items(vec![item(8, "Prizes", 4000)]), gov_id),
                pdf: Some(pdf("a.pdf")),
            },
            ExportSource {
                entry: entry(9, "FI001234", 19, Claims::Mileages(vec![mileage]), gov_id),
                pdf: Some(pdf("b.pdf")),
            },
        ];

        let generator = generator();
        let records = ExportGenerator::merge(
            sources.iter().cloned().map(|source| generator.record(source)).collect(),
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry_ids, vec![EntryId(8), EntryId(9)]);
        assert_eq!(records[0].rows.len(), 2);
        assert_eq!(records[0].submission_date, chrono::NaiveDate::from_ymd_opt(2024, 4, 19).expect("date"));
        assert!(records[0].pdf.is_none());

        let document = generator.generate(sources).expect("export");
        assert_eq!(document.filename, "2024-04-22-entries-8-9.csv");
        let rows = lines(&document.bytes);
        assert_eq!(rows.len(), 4);
        assert!(rows[0].starts_with("K;EUR;;FI001234;;"));
        assert!(rows[2].starts_with("T;EUR;;FI001234;131052-308T;"));
        assert!(rows[2].contains("Remember to attach the PDFs: 8-9"));
        assert_eq!(&rows[3].split(';').collect::<Vec<_>>()[1..6], &[
            "Mileage allowance: Trip to the venue",
            "v2025_kmkorv",
            "42.5",
            "km",
            "0.25",
        ]);
    }

    #[test]
    fn records_with_pdfs_are_zipped_with_the_csv() {
        let sources = vec![
            ExportSource {
                entry: entry(3, "FI2112345600000785", 10, Claims::Items(vec![item(3, "Paint", 990)]), None),
                pdf: Some(pdf("Maija-10-04-2024-3.pdf")),
            },
            ExportSource {
                entry: entry(4, "FI5710203000012345", 12, Claims::Items(vec![item(4, "Tape", 450)]), None),
                pdf: Some(pdf("Maija-12-04-2024-4.pdf")),
            },
        ];

        let document = generator().generate(sources).expect("export");
        assert_eq!(document.filename, "2024-04-10-entries-3-4.zip");
        assert_eq!(document.content_type, "application/zip");

        let mut archive = zip::ZipArchive::new(Cursor::new(document.bytes)).expect("zip");
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"2024-04-10-entries-3-4.csv".to_string()));
        assert!(names.contains(&"Maija-12-04-2024-4.pdf".to_string()));

        let mut csv = Vec::new();
        archive
            .by_name("2024-04-10-entries-3-4.csv")
            .expect("csv member")
            .read_to_end(&mut csv)
            .expect("read csv");
        assert!(lines(&csv)[0].ends_with(";Maija-10-04-2024-3.pdf"));
    }

    #[test]
    fn single_entry_with_pdf_keeps_its_document_name() {
        let source = ExportSource {
            entry: entry(5, "FI2112345600000785", 2, Claims::Items(vec![item(5, "Cake", 2000)]), None),
            pdf: Some(pdf("Maija-02-04-2024-5.pdf")),
        };
        let document = generator().generate(vec![source]).expect("export");
        assert_eq!(document.filename, "Maija_Meik_l_inen-2024-04-02-5.zip");
    }

    #[test]
    fn quotes_and_line_breaks_are_written_verbatim_on_one_line() {
        let mut payee = entry(6, "FI2112345600000785", 3, Claims::Items(vec![item(6, "12\" pizza", 1500)]), None);
        payee.name = "O\"Neil\nSmith".to_string();
        let source = ExportSource { entry: payee, pdf: None };

        let document = generator().generate(vec![source]).expect("export");
        let rows = lines(&document.bytes);

        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("K;EUR;;FI2112345600000785;;Tilisiirto;O\"Neil Smith;;0;"), "{}", rows[0]);
        assert!(rows[1].starts_with(";12\" pizza;;1;kpl;15.00;"), "{}", rows[1]);
        assert!(!rows.iter().any(|row| row.contains("\"\"")));
    }

    #[test]
    fn empty_exports_are_rejected() {
        assert!(matches!(generator().generate(Vec::new()), Err(RenderError::EmptyExport)));
    }

    #[test]
    fn text_and_price_fields_are_normalised() {
        let long = "x".repeat(90);
        assert_eq!(truncate_description(&long).len(), 80);
        assert_eq!(truncate_description("a\nb"), "a b");
        assert_eq!(price_field(Decimal::new(25, 2)), "0.25");
        assert_eq!(price_field(Decimal::new(3, 1)), "0.30");
        assert_eq!(price_field(Decimal::new(255, 3)), "0.255");
        assert_eq!(price_field(Decimal::new(40, 0)), "40.00");
    }
}

//! Document rendering for reimbursement entries: the printable PDF form with its
//! appendix pages, and the accounting import file (CSV, optionally zipped with PDFs).

pub mod charset;
pub mod error;
pub mod export;
pub mod pdf;

pub use error::RenderError;
pub use export::{AccountingRecord, ExportGenerator, ExportRow, ExportSource, RowKind};
pub use pdf::{AttachmentBlobs, PdfGenerator};

pub const PDF_CONTENT_TYPE: &str = "application/pdf";
pub const CSV_CONTENT_TYPE: &str = "text/csv";
pub const ZIP_CONTENT_TYPE: &str = "application/zip";

/// A rendered file ready to be handed to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedDocument {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Replaces every character outside `[A-Za-z0-9_-]` with `_` so the value can be used
/// as a file name stem.
pub fn file_stem(raw: &str) -> String {
    raw.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::file_stem;

    #[test]
    fn file_stem_replaces_unsafe_characters() {
        assert_eq!(file_stem("Matti Meikäläinen"), "Matti_Meik_l_inen");
        assert_eq!(file_stem("a/b\\c-d_e"), "a_b_c-d_e");
    }
}

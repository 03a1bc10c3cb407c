use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::claim::ItemId;
use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttachmentId(pub i64);

/// File kind recognised from the leading magic bytes of an upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Pdf,
    Png,
    Gif,
    Jpeg,
    Unknown,
}

const PDF_SIGNATURE: &[u8] = b"%PDF";
const PNG_SIGNATURE: &[u8] = b"\x89PNG";
const GIF_SIGNATURE: &[u8] = b"GIF8";
const JPEG_SIGNATURE: &[u8] = b"\xFF\xD8\xFF";

impl FileType {
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(PDF_SIGNATURE) {
            Self::Pdf
        } else if bytes.starts_with(PNG_SIGNATURE) {
            Self::Png
        } else if bytes.starts_with(GIF_SIGNATURE) {
            Self::Gif
        } else if bytes.starts_with(JPEG_SIGNATURE) {
            Self::Jpeg
        } else {
            Self::Unknown
        }
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    pub fn is_raster(self) -> bool {
        matches!(self, Self::Png | Self::Gif | Self::Jpeg)
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Jpeg => "image/jpeg",
            Self::Unknown => "application/octet-stream",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Jpeg => "jpeg",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "pdf" => Self::Pdf,
            "png" => Self::Png,
            "gif" => Self::Gif,
            "jpeg" => Self::Jpeg,
            _ => Self::Unknown,
        }
    }
}

/// Keeps letters, digits, space, `.`, `_` and `-`; everything else is dropped.
pub fn sanitize_filename(raw: &str) -> String {
    raw.chars()
        .filter(|ch| ch.is_alphanumeric() || matches!(ch, ' ' | '.' | '_' | '-'))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub item_id: Option<ItemId>,
    pub filename: String,
    pub file_type: FileType,
    pub value_cents: Option<i64>,
    pub is_not_receipt: bool,
    pub uploaded_at: DateTime<Utc>,
}

impl Attachment {
    pub fn is_linked(&self) -> bool {
        self.item_id.is_some()
    }
}

/// A validated upload, not yet persisted and not linked to any item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewAttachment {
    pub filename: String,
    pub file_type: FileType,
    pub data: Vec<u8>,
}

impl NewAttachment {
    pub fn from_upload(filename: Option<&str>, data: Vec<u8>) -> Result<Self, DomainError> {
        let file_type = FileType::detect(&data);
        if !file_type.is_supported() {
            return Err(DomainError::UnsupportedFileFormat);
        }

        let filename = filename.map(sanitize_filename).unwrap_or_default();
        let filename = if filename.trim().is_empty() {
            format!("attachment.{}", file_type.as_str())
        } else {
            filename
        };

        Ok(Self { filename, file_type, data })
    }
}

/// Reference from an item request to an uploaded attachment, carrying the declared value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentLink {
    pub attachment_id: AttachmentId,
    pub value_cents: Option<i64>,
    #[serde(default)]
    pub is_not_receipt: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AttachmentContent {
    pub attachment: Attachment,
    pub data: Vec<u8>,
}

impl AttachmentContent {
    pub fn content_type(&self) -> &'static str {
        self.attachment.file_type.content_type()
    }
}

#[cfg(test)]
mod tests {
    use super::{sanitize_filename, FileType, NewAttachment};
    use crate::errors::DomainError;

    #[test]
    fn detects_supported_signatures() {
        assert_eq!(FileType::detect(b"%PDF-1.7\n..."), FileType::Pdf);
        assert_eq!(FileType::detect(b"\x89PNG\r\n\x1a\n"), FileType::Png);
        assert_eq!(FileType::detect(b"GIF89a......"), FileType::Gif);
        assert_eq!(FileType::detect(b"GIF87a......"), FileType::Gif);
        assert_eq!(FileType::detect(b"\xFF\xD8\xFF\xE0JFIF"), FileType::Jpeg);
    }

    #[test]
    fn unknown_and_short_inputs_are_not_supported() {
        assert_eq!(FileType::detect(b"PK\x03\x04"), FileType::Unknown);
        assert_eq!(FileType::detect(b"%PD"), FileType::Unknown);
        assert_eq!(FileType::detect(b""), FileType::Unknown);
        assert!(!FileType::Unknown.is_supported());
        assert_eq!(FileType::Unknown.content_type(), "application/octet-stream");
    }

    #[test]
    fn filename_keeps_only_safe_characters() {
        assert_eq!(sanitize_filename("../../etc/pass wd.pdf"), "....etcpass wd.pdf");
        assert_eq!(sanitize_filename("kuitti_2024-05 (1).jpg"), "kuitti_2024-05 1.jpg");
        assert_eq!(sanitize_filename("Päivä.png"), "Päivä.png");
    }

    #[test]
    fn upload_rejects_unknown_bytes() {
        let error = NewAttachment::from_upload(Some("notes.txt"), b"hello".to_vec())
            .expect_err("plain text must be rejected");
        assert_eq!(error, DomainError::UnsupportedFileFormat);
    }

    #[test]
    fn upload_without_usable_filename_gets_a_default() {
        let upload =
            NewAttachment::from_upload(Some("///"), b"%PDF-1.4".to_vec()).expect("pdf upload");
        assert_eq!(upload.filename, "attachment.pdf");
        assert_eq!(upload.file_type, FileType::Pdf);
    }
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::attachment::Attachment;
use crate::domain::claim::{Item, Mileage};
use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub i64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Submitted,
    Approved,
    Denied,
    Paid,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Paid => "paid",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "submitted" => Ok(Self::Submitted),
            "approved" => Ok(Self::Approved),
            "denied" => Ok(Self::Denied),
            "paid" => Ok(Self::Paid),
            other => Err(DomainError::InvariantViolation(format!("unknown entry status `{other}`"))),
        }
    }
}

/// Status together with the dates and note that are valid for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Lifecycle {
    Submitted,
    Approved { approval_date: NaiveDate, approval_note: String },
    Denied { rejection_date: NaiveDate },
    Paid { approval_date: NaiveDate, approval_note: String, paid_date: NaiveDate },
}

impl Lifecycle {
    pub fn status(&self) -> EntryStatus {
        match self {
            Self::Submitted => EntryStatus::Submitted,
            Self::Approved { .. } => EntryStatus::Approved,
            Self::Denied { .. } => EntryStatus::Denied,
            Self::Paid { .. } => EntryStatus::Paid,
        }
    }

    pub fn approval_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Approved { approval_date, .. } | Self::Paid { approval_date, .. } => {
                Some(*approval_date)
            }
            _ => None,
        }
    }

    pub fn approval_note(&self) -> Option<&str> {
        match self {
            Self::Approved { approval_note, .. } | Self::Paid { approval_note, .. } => {
                Some(approval_note.as_str())
            }
            _ => None,
        }
    }

    pub fn rejection_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Denied { rejection_date } => Some(*rejection_date),
            _ => None,
        }
    }

    pub fn paid_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Paid { paid_date, .. } => Some(*paid_date),
            _ => None,
        }
    }

    /// Rebuilds the variant from flat storage columns. Any column that does not
    /// belong to the status is an invariant violation.
    pub fn from_columns(
        status: EntryStatus,
        approval_date: Option<NaiveDate>,
        approval_note: Option<String>,
        rejection_date: Option<NaiveDate>,
        paid_date: Option<NaiveDate>,
    ) -> Result<Self, DomainError> {
        let mismatch = |detail: &str| -> Result<Self, DomainError> {
            Err(DomainError::InvariantViolation(format!("{status} entry {detail}")))
        };

        match status {
            EntryStatus::Submitted => {
                if approval_date.is_some()
                    || approval_note.is_some()
                    || rejection_date.is_some()
                    || paid_date.is_some()
                {
                    return mismatch("carries decision dates");
                }
                Ok(Self::Submitted)
            }
            EntryStatus::Approved => match (approval_date, approval_note) {
                (Some(approval_date), Some(approval_note))
                    if rejection_date.is_none() && paid_date.is_none() =>
                {
                    Ok(Self::Approved { approval_date, approval_note })
                }
                _ => mismatch("needs approval date and note only"),
            },
            EntryStatus::Denied => match rejection_date {
                Some(rejection_date)
                    if approval_date.is_none() && approval_note.is_none() && paid_date.is_none() =>
                {
                    Ok(Self::Denied { rejection_date })
                }
                _ => mismatch("needs rejection date only"),
            },
            EntryStatus::Paid => match (approval_date, approval_note, paid_date) {
                (Some(approval_date), Some(approval_note), Some(paid_date))
                    if rejection_date.is_none() =>
                {
                    Ok(Self::Paid { approval_date, approval_note, paid_date })
                }
                _ => mismatch("needs approval and paid dates"),
            },
        }
    }
}

/// An entry holds either purchase items or mileage claims, never both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "claims", rename_all = "snake_case")]
pub enum Claims {
    Items(Vec<Item>),
    Mileages(Vec<Mileage>),
}

impl Claims {
    pub fn items(&self) -> &[Item] {
        match self {
            Self::Items(items) => items,
            Self::Mileages(_) => &[],
        }
    }

    pub fn mileages(&self) -> &[Mileage] {
        match self {
            Self::Items(_) => &[],
            Self::Mileages(mileages) => mileages,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Items(items) => items.len(),
            Self::Mileages(mileages) => mileages.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub name: String,
    pub contact: String,
    pub iban: String,
    pub title: String,
    pub gov_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub lifecycle: Lifecycle,
    pub archived: bool,
    pub claims: Claims,
    pub version: i64,
}

impl Entry {
    pub fn status(&self) -> EntryStatus {
        self.lifecycle.status()
    }

    /// Travel reimbursement forms are the ones carrying a government id.
    pub fn is_travel(&self) -> bool {
        self.gov_id.is_some()
    }

    pub fn submission_date(&self) -> NaiveDate {
        self.submitted_at.date_naive()
    }

    pub fn items(&self) -> &[Item] {
        self.claims.items()
    }

    pub fn mileages(&self) -> &[Mileage] {
        self.claims.mileages()
    }

    pub fn attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.items().iter().flat_map(|item| item.attachments.iter())
    }

    pub fn total(&self, mileage_rate: Decimal) -> Decimal {
        let items: Decimal = self.items().iter().map(Item::price).sum();
        let mileages: Decimal =
            self.mileages().iter().map(|mileage| mileage.price(mileage_rate)).sum();
        items + mileages
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{EntryStatus, Lifecycle};
    use crate::errors::DomainError;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).expect("valid date")
    }

    #[test]
    fn status_round_trips_through_storage_text() {
        for status in
            [EntryStatus::Submitted, EntryStatus::Approved, EntryStatus::Denied, EntryStatus::Paid]
        {
            assert_eq!(status.as_str().parse::<EntryStatus>(), Ok(status));
        }
        assert!("archived".parse::<EntryStatus>().is_err());
    }

    #[test]
    fn from_columns_accepts_consistent_rows() {
        let paid = Lifecycle::from_columns(
            EntryStatus::Paid,
            Some(date(1)),
            Some("board 2024/6".to_string()),
            None,
            Some(date(3)),
        )
        .expect("paid row");

        assert_eq!(paid.approval_date(), Some(date(1)));
        assert_eq!(paid.approval_note(), Some("board 2024/6"));
        assert_eq!(paid.paid_date(), Some(date(3)));
        assert_eq!(paid.rejection_date(), None);
    }

    #[test]
    fn from_columns_rejects_illegal_combinations() {
        let approved_without_note =
            Lifecycle::from_columns(EntryStatus::Approved, Some(date(1)), None, None, None);
        let denied_with_paid_date =
            Lifecycle::from_columns(EntryStatus::Denied, None, None, Some(date(2)), Some(date(3)));
        let submitted_with_rejection =
            Lifecycle::from_columns(EntryStatus::Submitted, None, None, Some(date(2)), None);

        for result in [approved_without_note, denied_with_paid_date, submitted_with_rejection] {
            assert!(matches!(result, Err(DomainError::InvariantViolation(_))));
        }
    }
}

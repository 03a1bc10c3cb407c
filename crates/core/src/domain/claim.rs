use std::collections::BTreeSet;

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::attachment::{Attachment, AttachmentLink};
use crate::domain::creation::{validate_attachment_value, validate_mileage_fields};
use crate::domain::entry::EntryId;
use crate::domain::validation::require_text;
use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MileageId(pub i64);

/// Expense line backed by receipts. Its price is the sum of the attachment values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub entry_id: EntryId,
    pub description: String,
    pub date: NaiveDate,
    pub account: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl Item {
    pub fn value_cents(&self) -> i64 {
        self.attachments.iter().filter_map(|attachment| attachment.value_cents).sum()
    }

    pub fn price(&self) -> Decimal {
        Decimal::new(self.value_cents(), 2)
    }
}

/// Driven distance, priced at the configured per-kilometre rate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mileage {
    pub id: MileageId,
    pub entry_id: EntryId,
    pub description: String,
    pub date: NaiveDate,
    pub route: String,
    pub distance_km: f64,
    pub plate_no: String,
    pub account: Option<String>,
}

impl Mileage {
    pub fn distance(&self) -> Decimal {
        Decimal::try_from(self.distance_km).unwrap_or(Decimal::ZERO)
    }

    pub fn price(&self, rate: Decimal) -> Decimal {
        (self.distance() * rate).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    }
}

/// Replacement content for an existing item. The attachment list replaces the current links.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub description: String,
    pub date: NaiveDate,
    pub attachments: Vec<AttachmentLink>,
}

impl ItemUpdate {
    pub fn validate(&self) -> Result<(), DomainError> {
        require_text("item description", &self.description)?;
        let mut seen = BTreeSet::new();
        for link in &self.attachments {
            if !seen.insert(link.attachment_id) {
                return Err(DomainError::validation(format!(
                    "attachment {} is referenced more than once",
                    link.attachment_id.0
                )));
            }
            validate_attachment_value(link)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MileageUpdate {
    pub description: String,
    pub date: NaiveDate,
    pub route: String,
    pub distance_km: f64,
    pub plate_no: String,
    pub account: Option<String>,
}

impl MileageUpdate {
    pub fn validate(&self) -> Result<(), DomainError> {
        validate_mileage_fields(&self.description, &self.route, self.distance_km, &self.plate_no)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BookkeepingTarget {
    Item(ItemId),
    Mileage(MileageId),
}

impl BookkeepingTarget {
    pub fn from_flag(id: i64, is_mileage: bool) -> Self {
        if is_mileage {
            Self::Mileage(MileageId(id))
        } else {
            Self::Item(ItemId(id))
        }
    }
}

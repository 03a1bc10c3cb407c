use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::attachment::{AttachmentId, AttachmentLink};
use crate::domain::validation::{require_text, validate_iban, validate_personal_id};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub description: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub attachments: Vec<AttachmentLink>,
    #[serde(default)]
    pub account: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewMileage {
    pub description: String,
    pub date: NaiveDate,
    pub route: String,
    pub distance_km: f64,
    pub plate_no: String,
    #[serde(default)]
    pub account: Option<String>,
}

/// Creation request as submitted by a member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub name: String,
    pub contact: String,
    pub iban: String,
    pub title: String,
    #[serde(default)]
    pub gov_id: Option<String>,
    #[serde(default)]
    pub items: Vec<NewItem>,
    #[serde(default)]
    pub mileages: Vec<NewMileage>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "claims", rename_all = "snake_case")]
pub enum DraftClaims {
    Items(Vec<NewItem>),
    Mileages(Vec<NewMileage>),
}

/// One entry to persist. A request may yield one or two of these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub name: String,
    pub contact: String,
    pub iban: String,
    pub title: String,
    pub gov_id: Option<String>,
    pub claims: DraftClaims,
}

impl EntryDraft {
    pub fn attachment_ids(&self) -> Vec<AttachmentId> {
        match &self.claims {
            DraftClaims::Items(items) => items
                .iter()
                .flat_map(|item| item.attachments.iter().map(|link| link.attachment_id))
                .collect(),
            DraftClaims::Mileages(_) => Vec::new(),
        }
    }
}

impl NewEntry {
    /// Validates the request and splits it into per-kind drafts, mileage draft first.
    /// Only the mileage draft keeps the government id.
    pub fn plan(self) -> Result<Vec<EntryDraft>, DomainError> {
        self.validate()?;

        let Self { name, contact, iban, title, gov_id, items, mileages } = self;
        let draft = |gov_id: Option<String>, claims: DraftClaims| EntryDraft {
            name: name.trim().to_string(),
            contact: contact.trim().to_string(),
            iban: iban.trim().to_string(),
            title: title.trim().to_string(),
            gov_id,
            claims,
        };

        let mut drafts = Vec::with_capacity(2);
        if !mileages.is_empty() {
            let gov_id = gov_id.map(|value| value.trim().to_ascii_uppercase());
            drafts.push(draft(gov_id, DraftClaims::Mileages(mileages)));
        }
        if !items.is_empty() {
            drafts.push(draft(None, DraftClaims::Items(items)));
        }
        Ok(drafts)
    }

    fn validate(&self) -> Result<(), DomainError> {
        require_text("name", &self.name)?;
        require_text("contact", &self.contact)?;
        require_text("title", &self.title)?;
        validate_iban(&self.iban)?;

        if self.items.is_empty() && self.mileages.is_empty() {
            return Err(DomainError::validation("entry must contain items or mileages"));
        }

        match self.gov_id.as_deref() {
            Some(gov_id) if !gov_id.trim().is_empty() => validate_personal_id(gov_id)?,
            _ if !self.mileages.is_empty() => {
                return Err(DomainError::validation("government id is required for mileages"));
            }
            _ => {}
        }

        let mut seen = BTreeSet::new();
        for item in &self.items {
            require_text("item description", &item.description)?;
            for link in &item.attachments {
                if !seen.insert(link.attachment_id) {
                    return Err(DomainError::validation(format!(
                        "attachment {} is referenced more than once",
                        link.attachment_id.0
                    )));
                }
                validate_attachment_value(link)?;
            }
        }

        for mileage in &self.mileages {
            validate_mileage_fields(
                &mileage.description,
                &mileage.route,
                mileage.distance_km,
                &mileage.plate_no,
            )?;
        }
        Ok(())
    }
}

pub fn validate_attachment_value(link: &AttachmentLink) -> Result<(), DomainError> {
    match link.value_cents {
        Some(value) if value <= 0 => Err(DomainError::validation(format!(
            "attachment {} value must be positive",
            link.attachment_id.0
        ))),
        _ => Ok(()),
    }
}

pub fn validate_mileage_fields(
    description: &str,
    route: &str,
    distance_km: f64,
    plate_no: &str,
) -> Result<(), DomainError> {
    require_text("mileage description", description)?;
    require_text("route", route)?;
    require_text("plate number", plate_no)?;
    if !distance_km.is_finite() || distance_km <= 0.0 {
        return Err(DomainError::validation("distance must be a positive number of kilometres"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{DraftClaims, NewEntry, NewItem, NewMileage};
    use crate::domain::attachment::{AttachmentId, AttachmentLink};
    use crate::errors::DomainError;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 2).expect("valid date")
    }

    fn item(attachment: i64) -> NewItem {
        NewItem {
            account: None,
            description: "Sauna supplies".to_string(),
            date: date(),
            attachments: vec![AttachmentLink {
                attachment_id: AttachmentId(attachment),
                value_cents: Some(1999),
                is_not_receipt: false,
            }],
        }
    }

    fn mileage() -> NewMileage {
        NewMileage {
            account: None,
            description: "Annual meeting".to_string(),
            date: date(),
            route: "Espoo - Tampere - Espoo".to_string(),
            distance_km: 342.0,
            plate_no: "XYZ-987".to_string(),
        }
    }

    fn request(items: Vec<NewItem>, mileages: Vec<NewMileage>) -> NewEntry {
        NewEntry {
            name: " Maija Meikäläinen ".to_string(),
            contact: "maija@example.org".to_string(),
            iban: "FI21 1234 5600 0007 85".to_string(),
            title: "Spring event".to_string(),
            gov_id: Some("131052-308t".to_string()),
            items,
            mileages,
        }
    }

    #[test]
    fn mixed_request_splits_into_two_single_kind_drafts() {
        let drafts = request(vec![item(1)], vec![mileage()]).plan().expect("plan");

        assert_eq!(drafts.len(), 2);
        assert!(matches!(drafts[0].claims, DraftClaims::Mileages(ref m) if m.len() == 1));
        assert_eq!(drafts[0].gov_id.as_deref(), Some("131052-308T"));
        assert!(matches!(drafts[1].claims, DraftClaims::Items(ref i) if i.len() == 1));
        assert_eq!(drafts[1].gov_id, None);
        for draft in &drafts {
            assert_eq!(draft.name, "Maija Meikäläinen");
            assert_eq!(draft.iban, "FI21 1234 5600 0007 85");
        }
    }

    #[test]
    fn item_only_request_drops_government_id() {
        let drafts = request(vec![item(1), item(2)], Vec::new()).plan().expect("plan");

        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].gov_id, None);
        assert_eq!(drafts[0].attachment_ids(), vec![AttachmentId(1), AttachmentId(2)]);
    }

    #[test]
    fn mileage_without_government_id_is_rejected() {
        let mut request = request(Vec::new(), vec![mileage()]);
        request.gov_id = None;

        assert!(matches!(request.plan(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn empty_request_is_rejected() {
        assert!(matches!(request(Vec::new(), Vec::new()).plan(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn duplicate_attachment_reference_is_rejected() {
        let error = request(vec![item(5), item(5)], Vec::new()).plan().expect_err("duplicate");
        assert_eq!(
            error,
            DomainError::Validation("attachment 5 is referenced more than once".to_string())
        );
    }

    #[test]
    fn non_positive_distance_and_value_are_rejected() {
        let mut bad_mileage = mileage();
        bad_mileage.distance_km = f64::NAN;
        assert!(request(Vec::new(), vec![bad_mileage]).plan().is_err());

        let mut bad_item = item(1);
        bad_item.attachments[0].value_cents = Some(0);
        assert!(request(vec![bad_item], Vec::new()).plan().is_err());
    }

    #[test]
    fn invalid_iban_is_rejected() {
        let mut request = request(vec![item(1)], Vec::new());
        request.iban = "FI00 1234".to_string();
        assert!(matches!(request.plan(), Err(DomainError::Validation(_))));
    }
}

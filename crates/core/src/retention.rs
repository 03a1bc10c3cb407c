use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::domain::attachment::Attachment;
use crate::domain::entry::{Entry, Lifecycle};

/// Age limits for archived entries and never-linked uploads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub archived_age_limit_days: u32,
    pub orphan_grace_hours: u32,
}

impl RetentionPolicy {
    /// Dates strictly before the cutoff are past the age limit.
    pub fn cutoff(&self, today: NaiveDate) -> NaiveDate {
        today - Duration::days(i64::from(self.archived_age_limit_days))
    }

    pub fn orphan_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(i64::from(self.orphan_grace_hours))
    }

    /// Archived entries are swept once their paid or rejection date passes the cutoff.
    pub fn is_expired(&self, entry: &Entry, today: NaiveDate) -> bool {
        if !entry.archived {
            return false;
        }
        let cutoff = self.cutoff(today);
        match &entry.lifecycle {
            Lifecycle::Paid { paid_date, .. } => *paid_date < cutoff,
            Lifecycle::Denied { rejection_date } => *rejection_date < cutoff,
            Lifecycle::Submitted | Lifecycle::Approved { .. } => false,
        }
    }

    pub fn is_orphan_expired(&self, attachment: &Attachment, now: DateTime<Utc>) -> bool {
        !attachment.is_linked() && attachment.uploaded_at < self.orphan_cutoff(now)
    }
}

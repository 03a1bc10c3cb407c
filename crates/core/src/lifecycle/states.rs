use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::entry::{EntryId, EntryStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Approve,
    Deny,
    Pay,
    Reset,
    Archive,
    Delete,
    Export,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Deny => "deny",
            Self::Pay => "pay",
            Self::Reset => "reset",
            Self::Archive => "archive",
            Self::Delete => "delete",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status-changing command applied to one or more entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Transition {
    Approve { date: NaiveDate, note: String },
    Deny { today: NaiveDate },
    Pay { date: NaiveDate },
    Reset,
    Archive,
}

impl Transition {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Approve { .. } => Operation::Approve,
            Self::Deny { .. } => Operation::Deny,
            Self::Pay { .. } => Operation::Pay,
            Self::Reset => Operation::Reset,
            Self::Archive => Operation::Archive,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub entry_id: EntryId,
    pub operation: Operation,
    pub from: EntryStatus,
    pub to: EntryStatus,
    pub archived: bool,
}

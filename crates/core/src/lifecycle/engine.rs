use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, CallerContext};
use crate::domain::entry::{Entry, EntryStatus, Lifecycle};
use crate::domain::validation::require_text;
use crate::errors::DomainError;
use crate::lifecycle::states::{Operation, Transition, TransitionOutcome};

/// Statuses allowed in a multi-entry accounting export.
pub const BATCH_EXPORT_STATUSES: &[EntryStatus] = &[EntryStatus::Paid];
/// Statuses allowed when exporting a single entry.
pub const SINGLE_EXPORT_STATUSES: &[EntryStatus] = &[EntryStatus::Approved, EntryStatus::Paid];

#[derive(Clone, Copy, Debug, Default)]
pub struct LifecycleEngine;

impl LifecycleEngine {
    /// Computes the lifecycle and archived flag an entry would have after `transition`.
    pub fn next(
        &self,
        entry: &Entry,
        transition: &Transition,
    ) -> Result<(Lifecycle, bool), DomainError> {
        let rejected = || DomainError::InvalidStateTransition {
            entry_id: entry.id,
            status: entry.status(),
            operation: transition.operation(),
        };

        let next = match (&entry.lifecycle, transition) {
            (Lifecycle::Submitted, Transition::Approve { date, note }) => {
                require_text("approval note", note)?;
                Lifecycle::Approved { approval_date: *date, approval_note: note.trim().to_string() }
            }
            (Lifecycle::Submitted, Transition::Deny { today }) => {
                Lifecycle::Denied { rejection_date: *today }
            }
            (Lifecycle::Approved { approval_date, approval_note }, Transition::Pay { date }) => {
                Lifecycle::Paid {
                    approval_date: *approval_date,
                    approval_note: approval_note.clone(),
                    paid_date: *date,
                }
            }
            (
                Lifecycle::Approved { .. } | Lifecycle::Denied { .. } | Lifecycle::Paid { .. },
                Transition::Reset,
            ) => Lifecycle::Submitted,
            (Lifecycle::Denied { .. } | Lifecycle::Paid { .. }, Transition::Archive) => {
                return Ok((entry.lifecycle.clone(), true));
            }
            _ => return Err(rejected()),
        };

        Ok((next, entry.archived))
    }

    pub fn apply(
        &self,
        entry: &mut Entry,
        transition: &Transition,
    ) -> Result<TransitionOutcome, DomainError> {
        let (lifecycle, archived) = self.next(entry, transition)?;
        Ok(commit(entry, transition.operation(), lifecycle, archived))
    }

    /// Checks every entry first and mutates only when all of them accept the transition.
    pub fn apply_batch(
        &self,
        entries: &mut [Entry],
        transition: &Transition,
    ) -> Result<Vec<TransitionOutcome>, DomainError> {
        let planned = entries
            .iter()
            .map(|entry| self.next(entry, transition))
            .collect::<Result<Vec<_>, _>>()?;

        let operation = transition.operation();
        Ok(entries
            .iter_mut()
            .zip(planned)
            .map(|(entry, (lifecycle, archived))| commit(entry, operation, lifecycle, archived))
            .collect())
    }

    pub fn apply_batch_with_audit<S>(
        &self,
        entries: &mut [Entry],
        transition: &Transition,
        sink: &S,
        caller: &CallerContext,
    ) -> Result<Vec<TransitionOutcome>, DomainError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply_batch(entries, transition);
        match &result {
            Ok(outcomes) => {
                for outcome in outcomes {
                    sink.emit(
                        AuditEvent::new(
                            Some(outcome.entry_id),
                            caller,
                            "entry.transition_applied",
                            AuditCategory::Lifecycle,
                            AuditOutcome::Success,
                        )
                        .with_metadata("operation", outcome.operation.as_str())
                        .with_metadata("from", outcome.from.as_str())
                        .with_metadata("to", outcome.to.as_str())
                        .with_metadata("archived", outcome.archived.to_string()),
                    );
                }
            }
            Err(error) => {
                let entry_id = match error {
                    DomainError::InvalidStateTransition { entry_id, .. } => Some(*entry_id),
                    _ => None,
                };
                sink.emit(
                    AuditEvent::new(
                        entry_id,
                        caller,
                        "entry.transition_rejected",
                        AuditCategory::Lifecycle,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("operation", transition.operation().as_str())
                    .with_metadata("batch_size", entries.len().to_string())
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }

    pub fn ensure_deletable(&self, entry: &Entry) -> Result<(), DomainError> {
        if entry.archived {
            Ok(())
        } else {
            Err(DomainError::InvalidStateTransition {
                entry_id: entry.id,
                status: entry.status(),
                operation: Operation::Delete,
            })
        }
    }

    pub fn ensure_exportable(
        &self,
        entry: &Entry,
        allowed: &[EntryStatus],
    ) -> Result<(), DomainError> {
        if allowed.contains(&entry.status()) {
            Ok(())
        } else {
            Err(DomainError::InvalidStateTransition {
                entry_id: entry.id,
                status: entry.status(),
                operation: Operation::Export,
            })
        }
    }
}

fn commit(
    entry: &mut Entry,
    operation: Operation,
    lifecycle: Lifecycle,
    archived: bool,
) -> TransitionOutcome {
    let from = entry.status();
    entry.lifecycle = lifecycle;
    entry.archived = archived;
    TransitionOutcome { entry_id: entry.id, operation, from, to: entry.status(), archived }
}

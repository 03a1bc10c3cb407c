pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod retention;

pub use audit::{AuditSink, CallerContext, InMemoryAuditSink, TracingAuditSink};
pub use config::AppConfig;
pub use domain::attachment::{
    Attachment, AttachmentContent, AttachmentId, AttachmentLink, FileType, NewAttachment,
};
pub use domain::claim::{BookkeepingTarget, Item, ItemId, ItemUpdate, Mileage, MileageId, MileageUpdate};
pub use domain::creation::{DraftClaims, EntryDraft, NewEntry, NewItem, NewMileage};
pub use domain::entry::{Claims, Entry, EntryId, EntryStatus, Lifecycle};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use lifecycle::{LifecycleEngine, Operation, Transition, TransitionOutcome};
pub use retention::RetentionPolicy;

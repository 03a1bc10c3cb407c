pub mod engine;
pub mod states;

pub use engine::{LifecycleEngine, BATCH_EXPORT_STATUSES, SINGLE_EXPORT_STATUSES};
pub use states::{Operation, Transition, TransitionOutcome};

pub mod attachment;
pub mod claim;
pub mod creation;
pub mod entry;
pub mod validation;

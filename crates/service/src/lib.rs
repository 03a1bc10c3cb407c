//! Application layer: wires the entry repository, the lifecycle rules and the document
//! generators behind one service, plus process bootstrap and logging setup.

pub mod bootstrap;
pub mod logging;
pub mod service;

pub use bootstrap::{bootstrap, bootstrap_with_config, Application, BootstrapError};
pub use logging::init_logging;
pub use reimburse_documents::RenderedDocument;
pub use service::ReimbursementService;

pub mod draft_service;
pub mod extraction_service;
pub mod record_service;

pub use draft_service::DraftService;
pub use extraction_service::{ExtractionService, SourceFile};
pub use record_service::{CommitRequest, RecordService};

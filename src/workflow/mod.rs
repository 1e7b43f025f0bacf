pub mod autosave;
pub mod session_ctx;
pub mod submission_flow;

pub use autosave::{AutosaveCommand, Autosaver, DraftSnapshot};
pub use session_ctx::SessionCtx;
pub use submission_flow::{FlowServices, FlowState, SubmissionFlow};

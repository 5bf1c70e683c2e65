//! # dbguard-task
//!
//! Job tracking for remote background work.
//!
//! ## Features
//!
//! - Job lifecycle (`running → processing → completed | failed`, `error`)
//! - Dual completion paths: status polling and agent push notification
//! - At-most-once completion handler dispatch via tagged handlers
//! - Composite (master) jobs aggregating sub-job outcomes
//! - Paged listing for status query surfaces

pub mod composite;
pub mod handler;
pub mod job;
pub mod registry;
pub mod state;

pub use composite::{CompositeHandler, SUB_JOB_ERROR_LIMIT};
pub use handler::{CompletionHandler, HandlerKind, HandlerRegistry};
pub use job::{
    new_job_id, normalize_paging, Job, JobPage, JobSpec, TransportRef, DEFAULT_PAGE,
    DEFAULT_PAGE_SIZE,
};
pub use registry::{JobRegistry, CTX_CHECKSUM, CTX_FILE_NAME, CTX_NOTIFIED_SUCCESS};
pub use state::JobStatus;

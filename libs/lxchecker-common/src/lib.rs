pub mod config;
pub mod grading;
pub mod metadata;
pub mod redis;
pub mod store;
pub mod types;

// Re-export commonly used types for convenience
pub use config::Config;
pub use store::{MemoryStore, RedisStore, StoreError, SubmissionStore};
pub use types::{
    Assignment, CompletionEvent, ExecutionFailure, ExecutionResult, FailureKind, Submission,
    SubmissionJob, SubmissionStatus, SubmitOptions, SubmitResponse, TeacherGrade,
};

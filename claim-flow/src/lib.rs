pub mod error;
pub mod machine;
pub mod reducer;
pub mod services;
pub mod session;
pub mod state;
pub mod storage;
pub mod validator;

// Re-export commonly used types
pub use error::{FlowError, Result};
pub use machine::{FlowMachine, NewUpload};
pub use reducer::{reduce, FlowAction};
pub use services::{
    AuthOutcome, Authenticator, ClaimSubmission, ClaimSubmitter, DocumentValidator,
    InsuredDirectory, InsuredPerson, UploadDigest,
};
pub use session::{is_locked, is_session_valid, now_ms};
pub use state::{
    FlowState, SubmissionBlocker, UploadCategory, UploadRecord, UploadStatus, Uploads,
};
pub use storage::{
    load_state, persist_state, FileSnapshotStore, InMemorySnapshotStore, SnapshotStore,
};
pub use validator::{local_check, validate_upload, Verdict};

use thiserror::Error;

use crate::state::SubmissionBlocker;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("too many failed attempts, locked until epoch-ms {until}")]
    Locked { until: i64 },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("captcha must be affirmed before authenticating")]
    CaptchaRequired,

    #[error("session expired")]
    SessionExpired,

    #[error("submission requirements not met")]
    SubmissionNotReady(Vec<SubmissionBlocker>),

    #[error("unknown upload category: {0}")]
    UnknownCategory(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("collaborator error: {0}")]
    Collaborator(String),
}

pub type Result<T> = std::result::Result<T, FlowError>;

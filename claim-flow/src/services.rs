//! Contracts for the external collaborators the flow depends on.
//!
//! The flow machine only sees these traits; concrete transports (HTTP
//! backends, stubs for tests and demos) live with the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::{UploadCategory, UploadStatus};
use crate::validator::Verdict;

/// Outcome of an authentication attempt
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Granted { token: String, expires_at: i64 },
    Denied,
}

/// One insured person as returned by the directory, already masked for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsuredPerson {
    pub id: String,
    pub masked_name: String,
    pub relationship: String,
    pub age_range: String,
}

/// Name + status digest of one upload, sent with the claim submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadDigest {
    pub category: UploadCategory,
    pub name: String,
    pub status: UploadStatus,
}

/// Everything the submission backend needs to register the claim
#[derive(Debug, Clone, Serialize)]
pub struct ClaimSubmission {
    pub token: String,
    pub expires_at: i64,
    pub insured_id: String,
    pub claim_type: String,
    pub uploads: Vec<UploadDigest>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify policy id + date of birth. A denied attempt is a normal
    /// outcome, not an error; errors are reserved for transport faults.
    async fn authenticate(
        &self,
        policy_id: &str,
        date_of_birth: &str,
        captcha_affirmed: bool,
    ) -> Result<AuthOutcome>;
}

#[async_trait]
pub trait InsuredDirectory: Send + Sync {
    /// List insured persons for the policy behind the session.
    /// Fails with `FlowError::SessionExpired` when the session is stale.
    async fn insured_list(&self, token: &str, expires_at: i64) -> Result<Vec<InsuredPerson>>;
}

#[async_trait]
pub trait DocumentValidator: Send + Sync {
    /// Semantic check of one file's raw bytes against its declared category.
    /// Errors are treated by the pipeline as a failed validation, never
    /// propagated further.
    async fn validate(
        &self,
        bytes: &[u8],
        filename: &str,
        category: UploadCategory,
    ) -> Result<Verdict>;
}

#[async_trait]
pub trait ClaimSubmitter: Send + Sync {
    /// Register the claim and return its confirmation number.
    /// Fails with `FlowError::SessionExpired` when the session is stale.
    async fn submit(&self, submission: ClaimSubmission) -> Result<String>;
}

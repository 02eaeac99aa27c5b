//! Collaborator implementations behind the flow machine's traits.
//!
//! Authentication, insured directory and claim submission are stub backends
//! with simulated latency; document validation goes over HTTP to the real
//! validation endpoint when `VALIDATION_URL` is configured.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use claim_flow::{
    now_ms, session, AuthOutcome, Authenticator, ClaimSubmission, ClaimSubmitter,
    DocumentValidator, FlowError, InsuredDirectory, InsuredPerson, Result, UploadCategory,
    Verdict,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

fn is_live(token: &str, expires_at: i64) -> bool {
    claim_flow::is_session_valid(Some(token), Some(expires_at))
}

/// Random latency so the async paths in the flow are actually exercised
async fn simulated_delay() {
    let ms = rand::rng().random_range(100..400);
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Accepts one fixed policy/date-of-birth pair, like the staging backend
pub struct StubAuthenticator;

const ACCEPTED_POLICY: &str = "POL-12345";
const ACCEPTED_DOB: &str = "1989-05-10";

#[async_trait]
impl Authenticator for StubAuthenticator {
    async fn authenticate(
        &self,
        policy_id: &str,
        date_of_birth: &str,
        captcha_affirmed: bool,
    ) -> Result<AuthOutcome> {
        simulated_delay().await;
        if !captcha_affirmed {
            return Ok(AuthOutcome::Denied);
        }
        if policy_id == ACCEPTED_POLICY && date_of_birth == ACCEPTED_DOB {
            let token = format!("atlas-{}", Uuid::new_v4().simple());
            return Ok(AuthOutcome::Granted {
                token,
                expires_at: now_ms() + session::SESSION_TTL_MS,
            });
        }
        Ok(AuthOutcome::Denied)
    }
}

pub struct StubInsuredDirectory;

#[async_trait]
impl InsuredDirectory for StubInsuredDirectory {
    async fn insured_list(&self, token: &str, expires_at: i64) -> Result<Vec<InsuredPerson>> {
        simulated_delay().await;
        if !is_live(token, expires_at) {
            return Err(FlowError::SessionExpired);
        }
        let person = |id: &str, name: &str, relationship: &str, ages: &str| InsuredPerson {
            id: id.to_string(),
            masked_name: name.to_string(),
            relationship: relationship.to_string(),
            age_range: ages.to_string(),
        };
        Ok(vec![
            person("ins-1", "Ma*** U***a", "holder", "30-39"),
            person("ins-2", "Lu*** U***a", "dependent", "10-19"),
            person("ins-3", "An*** G***a", "dependent", "20-29"),
            person("ins-4", "Jo*** M***a", "dependent", "40-49"),
        ])
    }
}

#[derive(Serialize)]
struct ValidationRequest {
    file_base64: String,
    filename: String,
    category: String,
}

#[derive(Deserialize)]
struct ValidationResponse {
    valid: bool,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP-backed document validator. Any transport fault or non-success
/// response becomes an error here; the pipeline in `claim-flow` maps it to
/// the fallback Invalid verdict.
pub struct HttpDocumentValidator {
    client: reqwest::Client,
    url: String,
}

impl HttpDocumentValidator {
    pub fn new(url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(25))
            .build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl DocumentValidator for HttpDocumentValidator {
    async fn validate(
        &self,
        bytes: &[u8],
        filename: &str,
        category: UploadCategory,
    ) -> Result<Verdict> {
        let request = ValidationRequest {
            file_base64: BASE64.encode(bytes),
            filename: filename.to_string(),
            category: category.as_str().to_string(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| FlowError::Collaborator(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FlowError::Collaborator(format!(
                "validation endpoint returned {}",
                response.status()
            )));
        }

        let body: ValidationResponse = response
            .json()
            .await
            .map_err(|e| FlowError::Collaborator(e.to_string()))?;

        debug!(%filename, %category, valid = body.valid, "remote validation response");
        Ok(Verdict {
            valid: body.valid,
            message: body.message,
        })
    }
}

/// Accepts every structurally valid file; used when no validation endpoint
/// is configured so the flow stays usable offline
pub struct OfflineDocumentValidator;

#[async_trait]
impl DocumentValidator for OfflineDocumentValidator {
    async fn validate(
        &self,
        _bytes: &[u8],
        _filename: &str,
        _category: UploadCategory,
    ) -> Result<Verdict> {
        simulated_delay().await;
        Ok(Verdict::accept())
    }
}

pub struct StubClaimSubmitter;

#[async_trait]
impl ClaimSubmitter for StubClaimSubmitter {
    async fn submit(&self, submission: ClaimSubmission) -> Result<String> {
        simulated_delay().await;
        if !is_live(&submission.token, submission.expires_at) {
            return Err(FlowError::SessionExpired);
        }
        let sequence: u32 = rand::rng().random_range(0..1_000_000);
        Ok(format!("AT-2026-{sequence:06}"))
    }
}

//! Two-stage upload validation: a local structural check followed by a
//! remote semantic check.
//!
//! The pipeline always resolves to a [`Verdict`]; remote transport failures
//! and timeouts become an Invalid verdict with a fallback message rather
//! than an error. A file the local check rejects never reaches the remote
//! collaborator, so a slow remote "valid" can never overwrite a local
//! rejection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::services::DocumentValidator;
use crate::state::UploadCategory;

/// Accept/reject outcome for one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Verdict {
    pub fn accept() -> Self {
        Self {
            valid: true,
            message: None,
        }
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: Some(message.into()),
        }
    }
}

const ALLOWED_MIME_TYPES: [&str; 3] = ["application/pdf", "image/jpeg", "image/png"];
const ALLOWED_EXTENSIONS: [&str; 4] = [".pdf", ".jpg", ".jpeg", ".png"];

pub const LOCAL_FORMAT_MESSAGE: &str = "The file format is not valid for this upload.";
pub const REMOTE_FALLBACK_MESSAGE: &str =
    "We could not validate this file right now. Please try again later.";
pub const REMOTE_REJECTION_MESSAGE: &str = "The document did not pass automated validation.";

/// Upper bound on one remote validation call; elapsing it yields the
/// fallback Invalid verdict
pub const REMOTE_VALIDATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Structural check: the declared media type or the filename extension must
/// match the PDF/JPEG/PNG whitelist
pub fn local_check(filename: &str, mime_type: &str) -> Verdict {
    let mime_allowed = ALLOWED_MIME_TYPES.contains(&mime_type);
    let lowered = filename.to_lowercase();
    let extension_allowed = ALLOWED_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext));

    if !mime_allowed && !extension_allowed {
        return Verdict::reject(LOCAL_FORMAT_MESSAGE);
    }
    Verdict::accept()
}

/// Run the full pipeline for one file. Local rejection short-circuits and
/// skips the remote call entirely.
pub async fn validate_upload(
    remote: &dyn DocumentValidator,
    bytes: &[u8],
    filename: &str,
    mime_type: &str,
    category: UploadCategory,
) -> Verdict {
    let local = local_check(filename, mime_type);
    if !local.valid {
        return local;
    }

    let call = remote.validate(bytes, filename, category);
    match tokio::time::timeout(REMOTE_VALIDATION_TIMEOUT, call).await {
        Ok(Ok(verdict)) => {
            if verdict.valid {
                Verdict::accept()
            } else {
                Verdict::reject(
                    verdict
                        .message
                        .unwrap_or_else(|| REMOTE_REJECTION_MESSAGE.to_string()),
                )
            }
        }
        Ok(Err(err)) => {
            warn!(%filename, %category, error = %err, "remote validation failed");
            Verdict::reject(REMOTE_FALLBACK_MESSAGE)
        }
        Err(_) => {
            warn!(%filename, %category, "remote validation timed out");
            Verdict::reject(REMOTE_FALLBACK_MESSAGE)
        }
    }
}

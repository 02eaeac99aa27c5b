use serde::{Deserialize, Serialize};

/// Fixed document classes a file can belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadCategory {
    Invoices,
    Medical,
    Evidence,
}

impl UploadCategory {
    pub const ALL: [UploadCategory; 3] = [
        UploadCategory::Invoices,
        UploadCategory::Medical,
        UploadCategory::Evidence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadCategory::Invoices => "invoices",
            UploadCategory::Medical => "medical",
            UploadCategory::Evidence => "evidence",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "invoices" => Some(UploadCategory::Invoices),
            "medical" => Some(UploadCategory::Medical),
            "evidence" => Some(UploadCategory::Evidence),
            _ => None,
        }
    }
}

impl std::fmt::Display for UploadCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of one uploaded file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Validating,
    Valid,
    Invalid,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Validating => "validating",
            UploadStatus::Valid => "valid",
            UploadStatus::Invalid => "invalid",
        }
    }
}

/// One file tracked by the upload ledger.
///
/// Records are created in `Validating` status and transition exactly once to
/// `Valid` or `Invalid` when their validation resolves. Removal discards the
/// record entirely; a verdict arriving afterwards finds no record to update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub category: UploadCategory,
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Per-category ordered upload lists (order = upload order, stable)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Uploads {
    #[serde(default)]
    pub invoices: Vec<UploadRecord>,
    #[serde(default)]
    pub medical: Vec<UploadRecord>,
    #[serde(default)]
    pub evidence: Vec<UploadRecord>,
}

impl Uploads {
    pub fn get(&self, category: UploadCategory) -> &Vec<UploadRecord> {
        match category {
            UploadCategory::Invoices => &self.invoices,
            UploadCategory::Medical => &self.medical,
            UploadCategory::Evidence => &self.evidence,
        }
    }

    pub fn get_mut(&mut self, category: UploadCategory) -> &mut Vec<UploadRecord> {
        match category {
            UploadCategory::Invoices => &mut self.invoices,
            UploadCategory::Medical => &mut self.medical,
            UploadCategory::Evidence => &mut self.evidence,
        }
    }

    /// Iterate over every record in every category
    pub fn iter_all(&self) -> impl Iterator<Item = &UploadRecord> {
        self.invoices
            .iter()
            .chain(self.medical.iter())
            .chain(self.evidence.iter())
    }

    pub fn any_with_status(&self, status: UploadStatus) -> bool {
        self.iter_all().any(|r| r.status == status)
    }
}

/// A condition that currently prevents claim submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionBlocker {
    MissingValidInvoice,
    MissingValidMedical,
    InvalidUploadPresent,
    ValidationInProgress,
    MissingClaimType,
}

impl std::fmt::Display for SubmissionBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SubmissionBlocker::MissingValidInvoice => "at least one valid invoice is required",
            SubmissionBlocker::MissingValidMedical => {
                "at least one valid medical document is required"
            }
            SubmissionBlocker::InvalidUploadPresent => "invalid uploads must be removed",
            SubmissionBlocker::ValidationInProgress => "some uploads are still being validated",
            SubmissionBlocker::MissingClaimType => "a claim type must be selected",
        };
        f.write_str(text)
    }
}

pub const FIRST_STEP: u8 = 1;
pub const LAST_STEP: u8 = 4;

/// The single process-wide flow state.
///
/// Session fields (token, expiry, attempt counter, lockout deadline) are
/// embedded here so the whole flow serializes as one snapshot. The attempt
/// counter and lockout deadline have an independent lifecycle: they survive
/// session clears and flow resets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    pub current_step: u8,
    pub max_step_reached: u8,
    pub session_token: Option<String>,
    pub session_expires_at: Option<i64>,
    pub selected_insured_id: Option<String>,
    pub claim_type: String,
    pub uploads: Uploads,
    pub claim_number: Option<String>,
    pub attempt_count: u32,
    pub lock_until: Option<i64>,
}

impl Default for FlowState {
    fn default() -> Self {
        Self {
            current_step: FIRST_STEP,
            max_step_reached: FIRST_STEP,
            session_token: None,
            session_expires_at: None,
            selected_insured_id: None,
            claim_type: String::new(),
            uploads: Uploads::default(),
            claim_number: None,
            attempt_count: 0,
            lock_until: None,
        }
    }
}

impl FlowState {
    /// Collect every condition currently blocking Step3 -> Step4
    pub fn submission_blockers(&self) -> Vec<SubmissionBlocker> {
        let mut blockers = Vec::new();
        if !self
            .uploads
            .invoices
            .iter()
            .any(|r| r.status == UploadStatus::Valid)
        {
            blockers.push(SubmissionBlocker::MissingValidInvoice);
        }
        if !self
            .uploads
            .medical
            .iter()
            .any(|r| r.status == UploadStatus::Valid)
        {
            blockers.push(SubmissionBlocker::MissingValidMedical);
        }
        if self.uploads.any_with_status(UploadStatus::Invalid) {
            blockers.push(SubmissionBlocker::InvalidUploadPresent);
        }
        if self.uploads.any_with_status(UploadStatus::Validating) {
            blockers.push(SubmissionBlocker::ValidationInProgress);
        }
        if self.claim_type.trim().is_empty() {
            blockers.push(SubmissionBlocker::MissingClaimType);
        }
        blockers
    }

    pub fn is_submission_ready(&self) -> bool {
        self.submission_blockers().is_empty()
    }
}

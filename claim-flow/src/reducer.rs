//! Pure transition function for the flow state.
//!
//! Every mutation of [`FlowState`] goes through [`reduce`]: the flow machine
//! dispatches actions, concurrent validation completions included, and the
//! reducer produces the next state. It is total — any action applied to any
//! state yields a state, never a panic — so async completions can be applied
//! in whatever order they arrive.

use crate::state::{
    FlowState, UploadCategory, UploadRecord, UploadStatus, FIRST_STEP, LAST_STEP,
};

/// An intent against the flow state
#[derive(Debug, Clone)]
pub enum FlowAction {
    SetStep(u8),
    SetSession { token: String, expires_at: i64 },
    ClearSession,
    SetInsured(Option<String>),
    SetClaimType(String),
    AddUploads {
        category: UploadCategory,
        records: Vec<UploadRecord>,
    },
    /// Terminal verdict for one record; a no-op when the id was removed
    UpdateUpload {
        category: UploadCategory,
        id: String,
        status: UploadStatus,
        message: Option<String>,
    },
    RemoveUpload {
        category: UploadCategory,
        id: String,
    },
    SetClaimNumber(Option<String>),
    SetAttemptCount(u32),
    SetLockUntil(Option<i64>),
    /// Back to the initial step, preserving attempt_count/lock_until
    ResetFlow,
}

pub fn reduce(state: &FlowState, action: FlowAction) -> FlowState {
    let mut next = state.clone();
    match action {
        FlowAction::SetStep(step) => {
            let step = step.clamp(FIRST_STEP, LAST_STEP);
            next.current_step = step;
            next.max_step_reached = next.max_step_reached.max(step);
        }
        FlowAction::SetSession { token, expires_at } => {
            next.session_token = Some(token);
            next.session_expires_at = Some(expires_at);
        }
        FlowAction::ClearSession => {
            next.session_token = None;
            next.session_expires_at = None;
        }
        FlowAction::SetInsured(insured_id) => {
            next.selected_insured_id = insured_id;
        }
        FlowAction::SetClaimType(claim_type) => {
            next.claim_type = claim_type;
        }
        FlowAction::AddUploads { category, records } => {
            next.uploads.get_mut(category).extend(records);
        }
        FlowAction::UpdateUpload {
            category,
            id,
            status,
            message,
        } => {
            // Late verdicts for removed records find no match and fall through
            if let Some(record) = next
                .uploads
                .get_mut(category)
                .iter_mut()
                .find(|r| r.id == id)
            {
                record.status = status;
                record.message = message;
            }
        }
        FlowAction::RemoveUpload { category, id } => {
            next.uploads.get_mut(category).retain(|r| r.id != id);
        }
        FlowAction::SetClaimNumber(claim_number) => {
            next.claim_number = claim_number;
        }
        FlowAction::SetAttemptCount(count) => {
            next.attempt_count = count;
        }
        FlowAction::SetLockUntil(lock_until) => {
            next.lock_until = lock_until;
        }
        FlowAction::ResetFlow => {
            next = FlowState {
                attempt_count: state.attempt_count,
                lock_until: state.lock_until,
                ..FlowState::default()
            };
        }
    }
    next
}

//! The flow state machine.
//!
//! Owns the single [`FlowState`], funnels every write through the pure
//! reducer, and persists each transition. Collaborators are injected as
//! trait objects so the machine can be driven against stub backends in
//! tests and against real transports in the service.

use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::reducer::{reduce, FlowAction};
use crate::services::{
    AuthOutcome, Authenticator, ClaimSubmission, ClaimSubmitter, DocumentValidator,
    InsuredDirectory, InsuredPerson, UploadDigest,
};
use crate::session::{is_locked, is_session_valid, now_ms, LOCKOUT_MS, MAX_AUTH_ATTEMPTS};
use crate::state::{FlowState, UploadCategory, UploadRecord, UploadStatus, FIRST_STEP, LAST_STEP};
use crate::storage::{load_state, persist_state, SnapshotStore};
use crate::validator::validate_upload;

/// A file handed to the machine for upload, raw bytes included
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

struct MachineInner {
    state: RwLock<FlowState>,
    dispatch_gate: Mutex<()>,
    store: Arc<dyn SnapshotStore>,
    authenticator: Arc<dyn Authenticator>,
    directory: Arc<dyn InsuredDirectory>,
    validator: Arc<dyn DocumentValidator>,
    submitter: Arc<dyn ClaimSubmitter>,
}

/// Cheap-clone handle to the single owned flow state; clones share it
#[derive(Clone)]
pub struct FlowMachine {
    inner: Arc<MachineInner>,
}

impl FlowMachine {
    /// Restore the machine from the snapshot store. A stale stored session
    /// is discarded on load, so the machine always starts on a step the
    /// current session can actually hold.
    pub async fn restore(
        store: Arc<dyn SnapshotStore>,
        authenticator: Arc<dyn Authenticator>,
        directory: Arc<dyn InsuredDirectory>,
        validator: Arc<dyn DocumentValidator>,
        submitter: Arc<dyn ClaimSubmitter>,
    ) -> Result<Self> {
        let state = load_state(store.as_ref()).await?;
        info!(
            current_step = state.current_step,
            attempt_count = state.attempt_count,
            locked = is_locked(state.lock_until),
            "flow state restored"
        );
        Ok(Self {
            inner: Arc::new(MachineInner {
                state: RwLock::new(state),
                dispatch_gate: Mutex::new(()),
                store,
                authenticator,
                directory,
                validator,
                submitter,
            }),
        })
    }

    /// Snapshot of the current state
    pub fn state(&self) -> FlowState {
        self.inner.state.read().unwrap().clone()
    }

    /// Apply one action through the reducer and persist the result.
    ///
    /// The gate is held across reduce + persist: snapshots must reach the
    /// store in the same order their reductions were applied, or a slow
    /// write from one validation completion could overwrite a newer one.
    async fn dispatch(&self, action: FlowAction) -> Result<FlowState> {
        let _serialized = self.inner.dispatch_gate.lock().await;
        let next = {
            let mut guard = self.inner.state.write().unwrap();
            let next = reduce(&guard, action);
            *guard = next.clone();
            next
        };
        persist_state(self.inner.store.as_ref(), &next).await?;
        Ok(next)
    }

    /// Step 1: verify credentials and open a session.
    ///
    /// While locked, the collaborator is never contacted. An unaffirmed
    /// captcha fails before the collaborator too and does not consume an
    /// attempt. The third consecutive denial engages the 24h lockout.
    pub async fn authenticate(
        &self,
        policy_id: &str,
        date_of_birth: &str,
        captcha_affirmed: bool,
    ) -> Result<FlowState> {
        let (attempt_count, lock_until) = {
            let guard = self.inner.state.read().unwrap();
            (guard.attempt_count, guard.lock_until)
        };

        if is_locked(lock_until) {
            debug!(?lock_until, "authentication rejected while locked");
            return Err(FlowError::Locked {
                until: lock_until.unwrap_or_default(),
            });
        }
        if !captcha_affirmed {
            return Err(FlowError::CaptchaRequired);
        }

        match self
            .inner
            .authenticator
            .authenticate(policy_id, date_of_birth, captcha_affirmed)
            .await?
        {
            AuthOutcome::Granted { token, expires_at } => {
                info!("authentication granted");
                self.dispatch(FlowAction::SetSession { token, expires_at })
                    .await?;
                self.dispatch(FlowAction::SetAttemptCount(0)).await?;
                self.dispatch(FlowAction::SetLockUntil(None)).await?;
                self.dispatch(FlowAction::SetStep(2)).await
            }
            AuthOutcome::Denied => {
                let next_attempt = attempt_count + 1;
                info!(attempt = next_attempt, "authentication denied");
                self.dispatch(FlowAction::SetAttemptCount(next_attempt))
                    .await?;
                if next_attempt >= MAX_AUTH_ATTEMPTS {
                    self.dispatch(FlowAction::SetLockUntil(Some(now_ms() + LOCKOUT_MS)))
                        .await?;
                }
                Err(FlowError::AuthenticationFailed)
            }
        }
    }

    /// Fetch the insured list for the current session
    pub async fn insured_list(&self) -> Result<Vec<InsuredPerson>> {
        let (token, expires_at) = self.session_or_reset().await?;
        match self.inner.directory.insured_list(&token, expires_at).await {
            Ok(list) => Ok(list),
            Err(FlowError::SessionExpired) => {
                self.reset_after_expiry().await?;
                Err(FlowError::SessionExpired)
            }
            Err(other) => Err(other),
        }
    }

    /// Step 2 -> Step 3: record the selection and advance
    pub async fn select_insured(&self, insured_id: &str) -> Result<FlowState> {
        self.session_or_reset().await?;
        self.dispatch(FlowAction::SetInsured(Some(insured_id.to_string())))
            .await?;
        self.dispatch(FlowAction::SetStep(3)).await
    }

    pub async fn set_claim_type(&self, claim_type: &str) -> Result<FlowState> {
        self.dispatch(FlowAction::SetClaimType(claim_type.to_string()))
            .await
    }

    /// Add files to a category and start one validation task per file.
    ///
    /// Records are appended in `Validating` status and the call returns
    /// their ids immediately; each spawned task later applies exactly one
    /// terminal verdict, which the reducer drops if the record was removed
    /// in the meantime.
    pub async fn add_files(
        &self,
        category: UploadCategory,
        files: Vec<NewUpload>,
    ) -> Result<Vec<String>> {
        let mut records = Vec::with_capacity(files.len());
        let mut pending = Vec::with_capacity(files.len());
        for file in files {
            let id = Uuid::new_v4().to_string();
            records.push(UploadRecord {
                id: id.clone(),
                name: file.name.clone(),
                size_bytes: file.bytes.len() as u64,
                mime_type: file.mime_type.clone(),
                category,
                status: UploadStatus::Validating,
                message: None,
            });
            pending.push((id, file));
        }
        let ids: Vec<String> = pending.iter().map(|(id, _)| id.clone()).collect();

        self.dispatch(FlowAction::AddUploads { category, records })
            .await?;

        for (id, file) in pending {
            let machine = self.clone();
            tokio::spawn(async move {
                machine.run_validation(category, id, file).await;
            });
        }
        Ok(ids)
    }

    /// One validation task: produce the verdict and apply it to the ledger
    async fn run_validation(&self, category: UploadCategory, id: String, file: NewUpload) {
        let verdict = validate_upload(
            self.inner.validator.as_ref(),
            &file.bytes,
            &file.name,
            &file.mime_type,
            category,
        )
        .await;

        debug!(
            upload_id = %id,
            %category,
            valid = verdict.valid,
            "validation resolved"
        );

        let status = if verdict.valid {
            UploadStatus::Valid
        } else {
            UploadStatus::Invalid
        };
        if let Err(e) = self
            .dispatch(FlowAction::UpdateUpload {
                category,
                id,
                status,
                message: verdict.message,
            })
            .await
        {
            error!(error = %e, "failed to record validation verdict");
        }
    }

    pub async fn remove_upload(&self, category: UploadCategory, id: &str) -> Result<FlowState> {
        self.dispatch(FlowAction::RemoveUpload {
            category,
            id: id.to_string(),
        })
        .await
    }

    /// Step 3 -> Step 4: submit the claim when the readiness guard passes
    pub async fn submit(&self) -> Result<String> {
        let snapshot = self.state();
        let blockers = snapshot.submission_blockers();
        if !blockers.is_empty() {
            return Err(FlowError::SubmissionNotReady(blockers));
        }

        let (token, expires_at) = self.session_or_reset().await?;
        let uploads = snapshot
            .uploads
            .iter_all()
            .map(|record| UploadDigest {
                category: record.category,
                name: record.name.clone(),
                status: record.status,
            })
            .collect();
        let submission = ClaimSubmission {
            token,
            expires_at,
            insured_id: snapshot.selected_insured_id.unwrap_or_default(),
            claim_type: snapshot.claim_type,
            uploads,
        };

        match self.inner.submitter.submit(submission).await {
            Ok(claim_number) => {
                info!(%claim_number, "claim submitted");
                self.dispatch(FlowAction::SetClaimNumber(Some(claim_number.clone())))
                    .await?;
                self.dispatch(FlowAction::SetStep(4)).await?;
                Ok(claim_number)
            }
            Err(FlowError::SessionExpired) => {
                self.reset_after_expiry().await?;
                Err(FlowError::SessionExpired)
            }
            Err(other) => Err(other),
        }
    }

    /// Navigate to a step, returning the step actually landed on.
    ///
    /// Forward jumps beyond the highest step ever reached are redirected to
    /// that step; steps 3 and 4 revalidate session freshness on entry and
    /// fall back to step 1 when it is stale.
    pub async fn navigate_to(&self, requested: u8) -> Result<u8> {
        let (max_step, session_ok) = {
            let guard = self.inner.state.read().unwrap();
            (
                guard.max_step_reached,
                is_session_valid(guard.session_token.as_deref(), guard.session_expires_at),
            )
        };
        let target = requested.clamp(FIRST_STEP, LAST_STEP).min(max_step);

        if target >= 3 && !session_ok {
            self.reset_after_expiry().await?;
            return Ok(FIRST_STEP);
        }

        let state = self.dispatch(FlowAction::SetStep(target)).await?;
        Ok(state.current_step)
    }

    /// Explicit reset back to step 1; attempt counter and lockout survive
    pub async fn reset(&self) -> Result<FlowState> {
        self.dispatch(FlowAction::ResetFlow).await
    }

    /// Return the live session pair or force the expiry reset
    async fn session_or_reset(&self) -> Result<(String, i64)> {
        let (token, expires_at) = {
            let guard = self.inner.state.read().unwrap();
            (guard.session_token.clone(), guard.session_expires_at)
        };
        if is_session_valid(token.as_deref(), expires_at) {
            // Both unwraps guarded by the validity check above
            Ok((token.unwrap_or_default(), expires_at.unwrap_or_default()))
        } else {
            self.reset_after_expiry().await?;
            Err(FlowError::SessionExpired)
        }
    }

    /// Session-expiry handling: clear session, uploads and selections
    /// together so no stale progress survives, back to step 1
    async fn reset_after_expiry(&self) -> Result<()> {
        info!("session expired, resetting flow to step 1");
        self.dispatch(FlowAction::ResetFlow).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::InsuredPerson;
    use crate::session::SESSION_TTL_MS;
    use crate::storage::InMemorySnapshotStore;
    use crate::validator::{Verdict, LOCAL_FORMAT_MESSAGE};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    const GOOD_POLICY: &str = "POL-12345";
    const GOOD_DOB: &str = "1989-05-10";

    struct StubAuthenticator {
        calls: AtomicUsize,
    }

    impl StubAuthenticator {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Authenticator for StubAuthenticator {
        async fn authenticate(
            &self,
            policy_id: &str,
            date_of_birth: &str,
            _captcha_affirmed: bool,
        ) -> Result<AuthOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if policy_id == GOOD_POLICY && date_of_birth == GOOD_DOB {
                Ok(AuthOutcome::Granted {
                    token: "tok-test".to_string(),
                    expires_at: now_ms() + SESSION_TTL_MS,
                })
            } else {
                Ok(AuthOutcome::Denied)
            }
        }
    }

    struct StubDirectory;

    #[async_trait]
    impl InsuredDirectory for StubDirectory {
        async fn insured_list(&self, token: &str, expires_at: i64) -> Result<Vec<InsuredPerson>> {
            if !is_session_valid(Some(token), Some(expires_at)) {
                return Err(FlowError::SessionExpired);
            }
            Ok(vec![
                InsuredPerson {
                    id: "ins-1".to_string(),
                    masked_name: "Ma*** U***a".to_string(),
                    relationship: "holder".to_string(),
                    age_range: "30-39".to_string(),
                },
                InsuredPerson {
                    id: "ins-2".to_string(),
                    masked_name: "Lu*** U***a".to_string(),
                    relationship: "dependent".to_string(),
                    age_range: "10-19".to_string(),
                },
            ])
        }
    }

    /// Validator gated on a semaphore so tests control when verdicts land
    struct GatedValidator {
        gate: Semaphore,
        verdict: Verdict,
    }

    impl GatedValidator {
        fn open(verdict: Verdict) -> Self {
            Self {
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
                verdict,
            }
        }

        fn closed(verdict: Verdict) -> Self {
            Self {
                gate: Semaphore::new(0),
                verdict,
            }
        }
    }

    #[async_trait]
    impl DocumentValidator for GatedValidator {
        async fn validate(
            &self,
            _bytes: &[u8],
            _filename: &str,
            _category: UploadCategory,
        ) -> Result<Verdict> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| FlowError::Collaborator(e.to_string()))?;
            permit.forget();
            Ok(self.verdict.clone())
        }
    }

    /// Store whose first flow write stalls, so a second dispatch can race it
    struct SlowFirstStore {
        inner: InMemorySnapshotStore,
        flow_saves: AtomicUsize,
    }

    impl SlowFirstStore {
        fn new() -> Self {
            Self {
                inner: InMemorySnapshotStore::new(),
                flow_saves: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SnapshotStore for SlowFirstStore {
        async fn save_flow(&self, state: &FlowState) -> crate::error::Result<()> {
            if self.flow_saves.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.save_flow(state).await
        }

        async fn load_flow(&self) -> crate::error::Result<Option<FlowState>> {
            self.inner.load_flow().await
        }

        async fn save_attempt_count(&self, count: u32) -> crate::error::Result<()> {
            self.inner.save_attempt_count(count).await
        }

        async fn load_attempt_count(&self) -> crate::error::Result<Option<u32>> {
            self.inner.load_attempt_count().await
        }

        async fn save_lock_until(&self, lock_until: Option<i64>) -> crate::error::Result<()> {
            self.inner.save_lock_until(lock_until).await
        }

        async fn load_lock_until(&self) -> crate::error::Result<Option<i64>> {
            self.inner.load_lock_until().await
        }
    }

    struct StubSubmitter;

    #[async_trait]
    impl ClaimSubmitter for StubSubmitter {
        async fn submit(&self, submission: ClaimSubmission) -> Result<String> {
            if !is_session_valid(Some(&submission.token), Some(submission.expires_at)) {
                return Err(FlowError::SessionExpired);
            }
            Ok("AT-2026-000042".to_string())
        }
    }

    struct Harness {
        machine: FlowMachine,
        auth: Arc<StubAuthenticator>,
        validator: Arc<GatedValidator>,
    }

    async fn harness_with_validator(validator: GatedValidator) -> Harness {
        let auth = Arc::new(StubAuthenticator::new());
        let validator = Arc::new(validator);
        let machine = FlowMachine::restore(
            Arc::new(InMemorySnapshotStore::new()),
            auth.clone(),
            Arc::new(StubDirectory),
            validator.clone(),
            Arc::new(StubSubmitter),
        )
        .await
        .unwrap();
        Harness {
            machine,
            auth,
            validator,
        }
    }

    async fn harness() -> Harness {
        harness_with_validator(GatedValidator::open(Verdict::accept())).await
    }

    fn pdf(name: &str) -> NewUpload {
        NewUpload {
            name: name.to_string(),
            mime_type: "application/pdf".to_string(),
            bytes: b"%PDF-1.4 test".to_vec(),
        }
    }

    fn png(name: &str) -> NewUpload {
        NewUpload {
            name: name.to_string(),
            mime_type: "image/png".to_string(),
            bytes: vec![0x89, 0x50, 0x4e, 0x47],
        }
    }

    /// Poll until no upload is left in Validating status
    async fn wait_for_settled(machine: &FlowMachine) {
        for _ in 0..200 {
            if !machine
                .state()
                .uploads
                .any_with_status(UploadStatus::Validating)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("validations did not settle in time");
    }

    #[tokio::test]
    async fn successful_authentication_advances_to_step_2() {
        let h = harness().await;
        let state = h
            .machine
            .authenticate(GOOD_POLICY, GOOD_DOB, true)
            .await
            .unwrap();
        assert_eq!(state.current_step, 2);
        assert!(state.session_token.is_some());
        assert_eq!(state.attempt_count, 0);
        assert!(state.lock_until.is_none());
    }

    #[tokio::test]
    async fn unaffirmed_captcha_consumes_no_attempt_and_skips_collaborator() {
        let h = harness().await;
        let err = h
            .machine
            .authenticate(GOOD_POLICY, GOOD_DOB, false)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::CaptchaRequired));
        assert_eq!(h.machine.state().attempt_count, 0);
        assert_eq!(h.auth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn third_failure_locks_and_fourth_never_reaches_collaborator() {
        let h = harness().await;
        for _ in 0..3 {
            let err = h
                .machine
                .authenticate("POL-99999", GOOD_DOB, true)
                .await
                .unwrap_err();
            assert!(matches!(err, FlowError::AuthenticationFailed));
        }
        let state = h.machine.state();
        assert_eq!(state.attempt_count, 3);
        let lock_until = state.lock_until.expect("lockout should be set");
        let expected = now_ms() + LOCKOUT_MS;
        assert!((expected - lock_until).abs() < 5_000);

        let calls_before = h.auth.calls.load(Ordering::SeqCst);
        let err = h
            .machine
            .authenticate(GOOD_POLICY, GOOD_DOB, true)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Locked { .. }));
        assert_eq!(h.auth.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn successful_login_clears_attempts_and_lockout_fields() {
        let h = harness().await;
        let _ = h.machine.authenticate("POL-99999", GOOD_DOB, true).await;
        assert_eq!(h.machine.state().attempt_count, 1);

        h.machine
            .authenticate(GOOD_POLICY, GOOD_DOB, true)
            .await
            .unwrap();
        let state = h.machine.state();
        assert_eq!(state.attempt_count, 0);
        assert!(state.lock_until.is_none());
    }

    #[tokio::test]
    async fn forward_navigation_is_bounded_by_max_step_reached() {
        let h = harness().await;
        assert_eq!(h.machine.navigate_to(4).await.unwrap(), 1);

        h.machine
            .authenticate(GOOD_POLICY, GOOD_DOB, true)
            .await
            .unwrap();
        assert_eq!(h.machine.navigate_to(4).await.unwrap(), 2);

        h.machine.select_insured("ins-2").await.unwrap();
        assert_eq!(h.machine.navigate_to(4).await.unwrap(), 3);

        // Backward navigation stays open, and the ceiling is remembered
        assert_eq!(h.machine.navigate_to(1).await.unwrap(), 1);
        assert_eq!(h.machine.navigate_to(3).await.unwrap(), 3);
        assert_eq!(h.machine.state().max_step_reached, 3);
    }

    #[tokio::test]
    async fn selecting_insured_with_expired_session_resets_to_step_1() {
        let h = harness().await;
        h.machine
            .authenticate(GOOD_POLICY, GOOD_DOB, true)
            .await
            .unwrap();
        // Force the stored expiry into the past
        h.machine
            .dispatch(FlowAction::SetSession {
                token: "tok-test".to_string(),
                expires_at: now_ms() - 1,
            })
            .await
            .unwrap();

        let err = h.machine.select_insured("ins-1").await.unwrap_err();
        assert!(matches!(err, FlowError::SessionExpired));
        let state = h.machine.state();
        assert_eq!(state.current_step, 1);
        assert!(state.session_token.is_none());
        assert!(state.selected_insured_id.is_none());
    }

    #[tokio::test]
    async fn expiry_reset_clears_uploads_too() {
        let h = harness().await;
        h.machine
            .authenticate(GOOD_POLICY, GOOD_DOB, true)
            .await
            .unwrap();
        h.machine.select_insured("ins-2").await.unwrap();
        h.machine
            .add_files(UploadCategory::Invoices, vec![pdf("invoice.pdf")])
            .await
            .unwrap();
        wait_for_settled(&h.machine).await;

        h.machine
            .dispatch(FlowAction::SetSession {
                token: "tok-test".to_string(),
                expires_at: now_ms() - 1,
            })
            .await
            .unwrap();
        assert_eq!(h.machine.navigate_to(3).await.unwrap(), 1);

        let state = h.machine.state();
        assert!(state.uploads.iter_all().next().is_none());
        assert_eq!(state.attempt_count, 0);
    }

    #[tokio::test]
    async fn batch_uploads_settle_to_terminal_states() {
        let h = harness().await;
        let ids = h
            .machine
            .add_files(
                UploadCategory::Invoices,
                vec![pdf("a.pdf"), png("b.png"), pdf("c.pdf")],
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);
        wait_for_settled(&h.machine).await;

        let state = h.machine.state();
        assert_eq!(state.uploads.invoices.len(), 3);
        for record in &state.uploads.invoices {
            assert_eq!(record.status, UploadStatus::Valid);
        }
    }

    #[tokio::test]
    async fn structurally_invalid_file_is_rejected_locally() {
        let h = harness_with_validator(GatedValidator::closed(Verdict::accept())).await;
        h.machine
            .add_files(
                UploadCategory::Evidence,
                vec![NewUpload {
                    name: "notes.docx".to_string(),
                    mime_type: "application/msword".to_string(),
                    bytes: b"word".to_vec(),
                }],
            )
            .await
            .unwrap();
        // The remote gate is closed: only the local short-circuit can settle this
        wait_for_settled(&h.machine).await;

        let state = h.machine.state();
        let record = &state.uploads.evidence[0];
        assert_eq!(record.status, UploadStatus::Invalid);
        assert_eq!(record.message.as_deref(), Some(LOCAL_FORMAT_MESSAGE));
    }

    #[tokio::test]
    async fn removing_a_record_discards_its_late_verdict() {
        let h = harness_with_validator(GatedValidator::closed(Verdict::accept())).await;
        let ids = h
            .machine
            .add_files(UploadCategory::Medical, vec![pdf("report.pdf")])
            .await
            .unwrap();
        let id = ids[0].clone();
        assert_eq!(
            h.machine.state().uploads.medical[0].status,
            UploadStatus::Validating
        );

        h.machine
            .remove_upload(UploadCategory::Medical, &id)
            .await
            .unwrap();
        assert!(h.machine.state().uploads.medical.is_empty());

        // Release the in-flight validation; its verdict must be a no-op
        h.validator.gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.machine.state().uploads.medical.is_empty());
    }

    #[tokio::test]
    async fn submit_is_guarded_by_readiness() {
        let h = harness().await;
        h.machine
            .authenticate(GOOD_POLICY, GOOD_DOB, true)
            .await
            .unwrap();
        let err = h.machine.submit().await.unwrap_err();
        assert!(matches!(err, FlowError::SubmissionNotReady(_)));
    }

    #[tokio::test]
    async fn full_flow_ends_with_a_claim_number() {
        let h = harness().await;
        h.machine
            .authenticate(GOOD_POLICY, GOOD_DOB, true)
            .await
            .unwrap();
        assert_eq!(h.machine.state().current_step, 2);

        h.machine.select_insured("ins-2").await.unwrap();
        assert_eq!(h.machine.state().current_step, 3);

        h.machine
            .add_files(UploadCategory::Invoices, vec![pdf("invoice.pdf")])
            .await
            .unwrap();
        h.machine
            .add_files(UploadCategory::Medical, vec![png("scan.png")])
            .await
            .unwrap();
        wait_for_settled(&h.machine).await;

        h.machine.set_claim_type("Consulta").await.unwrap();
        assert!(h.machine.state().is_submission_ready());

        let claim_number = h.machine.submit().await.unwrap();
        assert!(!claim_number.is_empty());
        let state = h.machine.state();
        assert_eq!(state.current_step, 4);
        assert_eq!(state.claim_number.as_deref(), Some(claim_number.as_str()));
    }

    #[tokio::test]
    async fn insured_list_requires_live_session() {
        let h = harness().await;
        let err = h.machine.insured_list().await.unwrap_err();
        assert!(matches!(err, FlowError::SessionExpired));

        h.machine
            .authenticate(GOOD_POLICY, GOOD_DOB, true)
            .await
            .unwrap();
        let list = h.machine.insured_list().await.unwrap();
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_dispatches_persist_in_reduction_order() {
        let slow = Arc::new(SlowFirstStore::new());
        let machine = FlowMachine::restore(
            slow.clone(),
            Arc::new(StubAuthenticator::new()),
            Arc::new(StubDirectory),
            Arc::new(GatedValidator::open(Verdict::accept())),
            Arc::new(StubSubmitter),
        )
        .await
        .unwrap();

        // First dispatch stalls inside its store write; the second must not
        // land its snapshot underneath it
        let first = {
            let machine = machine.clone();
            tokio::spawn(async move {
                machine
                    .dispatch(FlowAction::SetAttemptCount(1))
                    .await
                    .unwrap();
            })
        };
        tokio::task::yield_now().await;
        machine
            .dispatch(FlowAction::SetAttemptCount(2))
            .await
            .unwrap();
        first.await.unwrap();

        let persisted = slow.load_attempt_count().await.unwrap();
        assert_eq!(persisted, Some(machine.state().attempt_count));
        assert_eq!(machine.state().attempt_count, 2);
    }

    #[tokio::test]
    async fn explicit_reset_keeps_rate_limit_state() {
        let h = harness().await;
        for _ in 0..3 {
            let _ = h.machine.authenticate("POL-99999", GOOD_DOB, true).await;
        }
        let locked_until = h.machine.state().lock_until;
        h.machine.reset().await.unwrap();
        let state = h.machine.state();
        assert_eq!(state.current_step, 1);
        assert_eq!(state.attempt_count, 3);
        assert_eq!(state.lock_until, locked_until);
    }
}

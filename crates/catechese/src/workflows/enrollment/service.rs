use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    CatecheticalYear, Channel, ChildInfo, ClassLevel, Document, DocumentFormat, DocumentId,
    DocumentKind, DocumentStatus, EnrollmentId, EnrollmentType, ParentInfo, PaymentValidation,
    PendingEnrollment, ReviewerId, UserId, ValidationId, ValidationStatus, WorkflowId,
};
use super::eligibility::EligibilityResolver;
use super::extraction::{parse_loose_date, DocumentExtractor, ExtractionResult};
use super::intent::{Intent, IntentClassifier, KeywordClassifier};
use super::machine::{happy_path_successor, transition, Step, StepEvent, TransitionError};
use super::payment::treasurer::TreasurerAction;
use super::payment::{DecisionOutcome, EnrollmentDraft, GatewayError, PaymentGateway, PaymentProof};
use super::prompts::{self, Prompt};
use super::repository::{
    notify_quietly, EnrollmentRepository, Notification, Notifier, Recipient, RepositoryError,
};
use super::session::{SessionLocks, SessionStore, SessionStoreError, WorkflowSession};
use crate::config::EnrollmentConfig;
use crate::telemetry::AUDIT_TARGET;
use crate::workflows::legacy::{normalize_phone, LegacyDirectory, LegacyLookupError, LegacyParent};

/// Source of the current time, swapped for a fixed clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// External collaborators the workflow engine is built from.
#[derive(Clone)]
pub struct WorkflowCollaborators {
    pub sessions: Arc<dyn SessionStore>,
    pub repository: Arc<dyn EnrollmentRepository>,
    pub legacy: Arc<dyn LegacyDirectory>,
    /// Shared with the gateway so receipts go through the same OCR pipeline.
    pub extractor: Arc<DocumentExtractor>,
    pub gateway: Arc<PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowSettings {
    /// Invalid answers tolerated at one step before escalation; zero disables the cap.
    pub max_step_retries: u8,
    pub session_idle_ttl: Duration,
}

impl WorkflowSettings {
    pub fn from_config(config: &EnrollmentConfig) -> Self {
        Self {
            max_step_retries: config.max_step_retries,
            session_idle_ttl: config.session_idle_ttl(),
        }
    }
}

/// What the messaging layer sends back to the user after each message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowReply {
    pub workflow_id: WorkflowId,
    pub step: Step,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    pub next_step: Option<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub bytes: Vec<u8>,
    pub format: DocumentFormat,
}

/// One inbound message: free text, a file, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInput {
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
}

impl UserInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachment: None,
        }
    }

    pub fn attachment(bytes: Vec<u8>, format: DocumentFormat) -> Self {
        Self {
            text: None,
            attachment: Some(Attachment { bytes, format }),
        }
    }

    fn is_empty(&self) -> bool {
        let no_text = self
            .text
            .as_deref()
            .map(|text| text.trim().is_empty())
            .unwrap_or(true);
        let no_file = self
            .attachment
            .as_ref()
            .map(|attachment| attachment.bytes.is_empty())
            .unwrap_or(true);
        no_text && no_file
    }
}

/// Failure taxonomy of a step handler. Converted to a reply in `settle`, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Malformed answer; the step is asked again with the hint.
    #[error("invalid input: {0}")]
    Validation(String),
    /// The document pipeline failed outright.
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("business rule violated: {0}")]
    BusinessRule(String),
    /// Automation must stop here; `notice` is shown to the user above the hand-off message.
    #[error("escalation required: {reason}")]
    Escalation {
        reason: String,
        notice: Option<String>,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RepositoryError> for StepError {
    fn from(err: RepositoryError) -> Self {
        StepError::Internal(err.to_string())
    }
}

impl From<LegacyLookupError> for StepError {
    fn from(err: LegacyLookupError) -> Self {
        StepError::Internal(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Advance {
        event: StepEvent,
        notice: Option<String>,
    },
    /// Remain at the current step and answer with `Prompt`.
    Stay(Prompt),
}

impl StepOutcome {
    fn advance(event: StepEvent) -> Self {
        StepOutcome::Advance {
            event,
            notice: None,
        }
    }
}

type StepResult = Result<StepOutcome, StepError>;

/// Error raised by the workflow service to its callers.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("no workflow session for {0}")]
    SessionNotFound(UserId),
    #[error("session of {0} is waiting for an operator")]
    AwaitingOperator(UserId),
    #[error("document {0} not found")]
    DocumentNotFound(DocumentId),
    #[error("enrollment {0} not found")]
    EnrollmentNotFound(EnrollmentId),
    #[error("documents of kind {} cannot be attached to an enrollment", .0.label())]
    UnsupportedDocumentKind(DocumentKind),
    #[error("message carries neither text nor a file")]
    EmptyInput,
    #[error(transparent)]
    Store(#[from] SessionStoreError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired_payments: usize,
    pub purged_sessions: usize,
}

/// Conversation engine driving a parent from the first message to a validated enrollment.
pub struct EnrollmentWorkflowService {
    sessions: Arc<dyn SessionStore>,
    locks: SessionLocks,
    classifier: Arc<dyn IntentClassifier>,
    eligibility: EligibilityResolver,
    extractor: Arc<DocumentExtractor>,
    gateway: Arc<PaymentGateway>,
    repository: Arc<dyn EnrollmentRepository>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: WorkflowSettings,
}

impl EnrollmentWorkflowService {
    pub fn new(collaborators: WorkflowCollaborators, config: &EnrollmentConfig) -> Self {
        Self {
            sessions: collaborators.sessions,
            locks: SessionLocks::default(),
            classifier: Arc::new(KeywordClassifier),
            eligibility: EligibilityResolver::new(collaborators.legacy),
            extractor: collaborators.extractor,
            gateway: collaborators.gateway,
            repository: collaborators.repository,
            notifier: collaborators.notifier,
            clock: Arc::new(SystemClock),
            settings: WorkflowSettings::from_config(config),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn gateway(&self) -> &PaymentGateway {
        &self.gateway
    }

    /// Open a conversation, replacing any abandoned one of the same user.
    pub async fn start_workflow(
        &self,
        user_id: &UserId,
        phone: &str,
        channel: Channel,
    ) -> Result<WorkflowReply, WorkflowError> {
        let _guard = self.locks.acquire(user_id).await;
        let now = self.clock.now();

        let existing = self.sessions.load(user_id)?;
        if let Some(session) = &existing {
            if session.current_step == Step::PendingHuman {
                return Err(WorkflowError::AwaitingOperator(user_id.clone()));
            }
        }

        let mut session = WorkflowSession::new(user_id.clone(), phone, channel, now);
        session.version = existing.map(|stored| stored.version).unwrap_or(0);
        let session = self.sessions.save(session)?;

        tracing::info!(
            user_id = %session.user_id,
            workflow_id = %session.workflow_id,
            channel = session.channel.label(),
            "workflow started"
        );
        Ok(reply(&session, prompts::initial_choice()))
    }

    /// Handle one inbound message. Messages of one user are processed one at a time.
    pub async fn process_input(
        &self,
        user_id: &UserId,
        input: UserInput,
    ) -> Result<WorkflowReply, WorkflowError> {
        if input.is_empty() {
            return Err(WorkflowError::EmptyInput);
        }

        let _guard = self.locks.acquire(user_id).await;
        let mut session = self
            .sessions
            .load(user_id)?
            .ok_or_else(|| WorkflowError::SessionNotFound(user_id.clone()))?;
        let now = self.clock.now();

        let result = self.handle_step(&mut session, &input, now).await;
        let prompt = self.settle(&mut session, result).await;

        session.updated_at = now;
        let session = self.sessions.save(session)?;
        Ok(reply(&session, prompt))
    }

    pub fn get_status(&self, user_id: &UserId) -> Result<WorkflowSession, WorkflowError> {
        self.sessions
            .load(user_id)?
            .ok_or_else(|| WorkflowError::SessionNotFound(user_id.clone()))
    }

    /// Operator recovery: clear the conversation and start over from the first question.
    pub async fn reset(&self, user_id: &UserId) -> Result<WorkflowReply, WorkflowError> {
        let _guard = self.locks.acquire(user_id).await;
        let existing = self
            .sessions
            .load(user_id)?
            .ok_or_else(|| WorkflowError::SessionNotFound(user_id.clone()))?;
        let step = transition(existing.current_step, StepEvent::OperatorReset)?;

        let mut fresh = WorkflowSession::new(
            existing.user_id.clone(),
            &existing.phone,
            existing.channel,
            self.clock.now(),
        );
        fresh.current_step = step;
        fresh.version = existing.version;
        let fresh = self.sessions.save(fresh)?;

        tracing::info!(
            target: AUDIT_TARGET,
            user_id = %user_id,
            from = existing.current_step.label(),
            reason = existing.escalation_reason.as_deref().unwrap_or(""),
            "workflow reset by operator"
        );
        Ok(reply(&fresh, prompts::initial_choice()))
    }

    /// Apply a treasurer decision; an approval completes the submitter's conversation.
    pub async fn decide_payment(
        &self,
        validation_id: &ValidationId,
        reviewer: &ReviewerId,
        action: TreasurerAction,
        notes: Option<String>,
    ) -> Result<DecisionOutcome, WorkflowError> {
        let outcome = self
            .gateway
            .decide(validation_id, reviewer, action, notes, self.clock.now())
            .await?;
        if outcome.action == TreasurerAction::Approve {
            self.complete_session(&outcome.enrollment).await?;
        }
        Ok(outcome)
    }

    async fn complete_session(&self, enrollment: &PendingEnrollment) -> Result<(), WorkflowError> {
        let user_id = &enrollment.submitted_by;
        let _guard = self.locks.acquire(user_id).await;
        let Some(mut session) = self.sessions.load(user_id)? else {
            return Ok(());
        };
        if session.current_step != Step::TreasurerValidation
            || session.collected.enrollment_id.as_ref() != Some(&enrollment.id)
        {
            return Ok(());
        }

        self.advance(&mut session, StepEvent::PaymentApproved)?;
        session.updated_at = self.clock.now();
        self.sessions.save(session)?;
        Ok(())
    }

    pub fn claim_validation(
        &self,
        validation_id: &ValidationId,
        reviewer: &ReviewerId,
    ) -> Result<PaymentValidation, WorkflowError> {
        Ok(self
            .gateway
            .claim(validation_id, reviewer, self.clock.now())?)
    }

    pub fn treasurer_queue(&self, limit: usize) -> Result<Vec<PaymentValidation>, WorkflowError> {
        Ok(self.gateway.pending_queue(limit)?)
    }

    pub async fn cancel_enrollment(
        &self,
        enrollment_id: &EnrollmentId,
        reason: &str,
    ) -> Result<PendingEnrollment, WorkflowError> {
        Ok(self
            .gateway
            .cancel_enrollment(enrollment_id, reason, self.clock.now())
            .await?)
    }

    /// Add a baptism certificate or transfer attestation to an existing enrollment.
    ///
    /// Fields read with enough confidence are copied onto the enrollment.
    pub async fn attach_document(
        &self,
        enrollment_id: &EnrollmentId,
        kind: DocumentKind,
        bytes: &[u8],
        format: DocumentFormat,
    ) -> Result<Document, WorkflowError> {
        if !matches!(
            kind,
            DocumentKind::BaptismCertificate | DocumentKind::TransferAttestation
        ) {
            return Err(WorkflowError::UnsupportedDocumentKind(kind));
        }
        if bytes.is_empty() {
            return Err(WorkflowError::EmptyInput);
        }
        let mut enrollment = self
            .repository
            .fetch_enrollment(enrollment_id)?
            .ok_or_else(|| WorkflowError::EnrollmentNotFound(enrollment_id.clone()))?;

        let mut document = Document::new(enrollment.submitted_by.clone(), kind, bytes, format);
        document.enrollment_id = Some(enrollment_id.clone());
        let result = self
            .extractor
            .process_document(&mut document, bytes, false)
            .await;
        self.repository.save_document(document.clone())?;

        if result.status == DocumentStatus::Success && apply_document_fields(&mut enrollment, &result)
        {
            enrollment.updated_at = self.clock.now();
            self.repository.update_enrollment(enrollment)?;
        }

        tracing::info!(
            enrollment = %enrollment_id,
            document = %document.id,
            kind = kind.label(),
            status = document.status.label(),
            "document attached"
        );
        Ok(document)
    }

    /// Run extraction again for a stored document. Without `force` a successful result is kept.
    pub async fn reprocess_document(
        &self,
        document_id: &DocumentId,
        bytes: &[u8],
        force: bool,
    ) -> Result<Document, WorkflowError> {
        if bytes.is_empty() {
            return Err(WorkflowError::EmptyInput);
        }
        let mut document = self
            .repository
            .fetch_document(document_id)?
            .ok_or_else(|| WorkflowError::DocumentNotFound(document_id.clone()))?;
        self.extractor
            .process_document(&mut document, bytes, force)
            .await;
        self.repository.save_document(document.clone())?;
        Ok(document)
    }

    /// Expire overdue payments and drop abandoned conversations.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, WorkflowError> {
        let now = self.clock.now();
        let expired = self.gateway.sweep_expired(now).await?;
        let purged = self
            .sessions
            .purge_idle(now - self.settings.session_idle_ttl)?;
        self.locks.prune();

        Ok(MaintenanceReport {
            expired_payments: expired.len(),
            purged_sessions: purged,
        })
    }

    async fn handle_step(
        &self,
        session: &mut WorkflowSession,
        input: &UserInput,
        now: DateTime<Utc>,
    ) -> StepResult {
        let today = now.date_naive();
        match session.current_step {
            Step::InitialChoice => self.on_initial_choice(session, input),
            Step::ReenrollmentSelect => self.on_reenrollment_select(session, input, today),
            Step::ReenrollmentConfirm => self.on_reenrollment_confirm(session, input, today),
            Step::AgeVerification => self.on_age_verification(session, input, today).await,
            Step::ClassSelection => self.on_class_selection(session, input),
            Step::ParentInfo => self.on_parent_info(session, input),
            Step::ChildInfo => self.on_child_info(session, input, today),
            Step::ConfirmData => self.on_confirm_data(session, input),
            Step::YearSelection => self.on_year_selection(session, input, today),
            Step::PaymentProof => self.on_payment_proof(session, input, now).await,
            Step::TreasurerValidation => self.on_treasurer_validation(session, input, now).await,
            Step::Completed | Step::PendingHuman => {
                Ok(StepOutcome::Stay(self.prompt_for(session, today)))
            }
        }
    }

    /// Turn a handler result into the reply, moving the session as needed.
    async fn settle(&self, session: &mut WorkflowSession, result: StepResult) -> Prompt {
        let today = self.clock.now().date_naive();
        match result {
            Ok(StepOutcome::Stay(prompt)) => prompt,
            Ok(StepOutcome::Advance { event, notice }) => {
                let from = session.current_step;
                if let Err(err) = self.advance(session, event) {
                    return self
                        .escalate(session, err.to_string(), Some(prompts::apology().to_string()))
                        .await;
                }
                let prompt = self.entry_prompt(session, from, today);
                self.announce(session, from, &prompt).await;
                match notice {
                    Some(notice) => prompt.preceded_by(&notice),
                    None => prompt,
                }
            }
            Err(StepError::Validation(hint)) | Err(StepError::BusinessRule(hint)) => {
                session.retries = session.retries.saturating_add(1);
                let cap = self.settings.max_step_retries;
                if cap > 0 && session.retries >= cap {
                    let reason = format!(
                        "{} invalid answers at {}",
                        session.retries, session.current_step
                    );
                    return self
                        .escalate(session, reason, Some(prompts::too_many_attempts().to_string()))
                        .await;
                }
                tracing::debug!(
                    user_id = %session.user_id,
                    step = session.current_step.label(),
                    retries = session.retries,
                    "answer refused"
                );
                self.prompt_for(session, today).preceded_by(&hint)
            }
            Err(StepError::Extraction(reason)) => {
                self.escalate(
                    session,
                    reason,
                    Some(prompts::document_unreadable().to_string()),
                )
                .await
            }
            Err(StepError::Escalation { reason, notice }) => {
                self.escalate(session, reason, notice).await
            }
            Err(StepError::Internal(reason)) => {
                self.escalate(session, reason, Some(prompts::apology().to_string()))
                    .await
            }
        }
    }

    fn advance(&self, session: &mut WorkflowSession, event: StepEvent) -> Result<(), TransitionError> {
        let from = session.current_step;
        let to = transition(from, event)?;
        if to != from {
            session.retries = 0;
        }
        session.current_step = to;
        tracing::info!(
            user_id = %session.user_id,
            from = from.label(),
            to = to.label(),
            "workflow step changed"
        );
        Ok(())
    }

    async fn escalate(
        &self,
        session: &mut WorkflowSession,
        reason: String,
        notice: Option<String>,
    ) -> Prompt {
        let from = session.current_step;
        match transition(from, StepEvent::Escalate) {
            Ok(to) => {
                session.current_step = to;
                session.retries = 0;
            }
            Err(err) => tracing::error!(user_id = %session.user_id, error = %err, "escalation refused"),
        }
        session.escalation_reason = Some(reason.clone());
        tracing::warn!(
            user_id = %session.user_id,
            from = from.label(),
            reason = %reason,
            "workflow escalated to an operator"
        );

        let alert = Notification::new(
            Recipient::Operators,
            "workflow_escalated",
            prompts::operators_escalation(session.user_id.as_str(), from.label(), &reason),
        )
        .with_detail("workflow_id", &session.workflow_id)
        .with_detail("phone", &session.phone);
        notify_quietly(self.notifier.as_ref(), alert).await;

        let prompt = prompts::pending_human();
        self.announce(session, from, &prompt).await;
        match notice {
            Some(notice) => prompt.preceded_by(&notice),
            None => prompt,
        }
    }

    /// Tell the submitter through their channel when the conversation parks or ends.
    async fn announce(&self, session: &WorkflowSession, from: Step, prompt: &Prompt) {
        let step = session.current_step;
        if step == from || !(step.is_parked() || step.is_final()) {
            return;
        }
        let template = match step {
            Step::TreasurerValidation => "payment_submitted",
            Step::Completed => "enrollment_completed",
            _ => "workflow_pending_human",
        };
        let mut notification = Notification::new(
            Recipient::Submitter {
                user_id: session.user_id.clone(),
                channel: session.channel,
            },
            template,
            prompt.message.clone(),
        )
        .with_detail("workflow_id", &session.workflow_id);
        if let Some(number) = &session.collected.enrollment_number {
            notification = notification.with_detail("enrollment_number", number);
        }
        notify_quietly(self.notifier.as_ref(), notification).await;
    }

    fn entry_prompt(&self, session: &WorkflowSession, from: Step, today: NaiveDate) -> Prompt {
        match session.current_step {
            Step::TreasurerValidation if from != Step::TreasurerValidation => {
                prompts::treasurer_waiting(enrollment_number(session))
            }
            _ => self.prompt_for(session, today),
        }
    }

    /// The question asked at the session's current step.
    fn prompt_for(&self, session: &WorkflowSession, today: NaiveDate) -> Prompt {
        let collected = &session.collected;
        match session.current_step {
            Step::InitialChoice => prompts::initial_choice(),
            Step::ReenrollmentSelect => match &session.legacy_parent {
                Some(parent) => prompts::reenrollment_select(parent, &collected.legacy_children),
                None => prompts::initial_choice(),
            },
            Step::ReenrollmentConfirm => match (&collected.legacy_child, &collected.suggestion) {
                (Some(child), Some(suggestion)) => prompts::reenrollment_confirm(
                    child,
                    suggestion,
                    collected
                        .catechetical_year
                        .unwrap_or_else(|| CatecheticalYear::upcoming(today)),
                ),
                _ => prompts::class_selection(&ClassLevel::ALL, collected.age),
            },
            Step::AgeVerification => prompts::age_verification(),
            Step::ClassSelection => {
                prompts::class_selection(&offered_levels(session), collected.age)
            }
            Step::ParentInfo => prompts::parent_info(session.legacy_parent.as_ref()),
            Step::ChildInfo => prompts::child_info(
                collected
                    .child_prefill
                    .as_ref()
                    .filter(|child| is_complete(child)),
            ),
            Step::ConfirmData => match (&collected.parent, &collected.child, collected.level) {
                (Some(parent), Some(child), Some(level)) => {
                    prompts::confirm_data(parent, child, level)
                }
                _ => Prompt::text(prompts::apology()),
            },
            Step::YearSelection => prompts::year_selection(&offered_years(today)),
            Step::PaymentProof => self.payment_prompt(),
            Step::TreasurerValidation => {
                let rejected = collected
                    .validation_id
                    .as_ref()
                    .and_then(|id| self.repository.fetch_validation(id).ok().flatten())
                    .map(|validation| validation.status == ValidationStatus::Rejected)
                    .unwrap_or(false);
                if rejected {
                    self.payment_prompt()
                } else {
                    prompts::still_waiting(enrollment_number(session))
                }
            }
            Step::Completed => prompts::completed(enrollment_number(session)),
            Step::PendingHuman => prompts::pending_human(),
        }
    }

    fn payment_prompt(&self) -> Prompt {
        let settings = self.gateway.settings();
        prompts::payment_proof(settings.fee, &settings.currency, &settings.providers)
    }

    fn on_initial_choice(&self, session: &mut WorkflowSession, input: &UserInput) -> StepResult {
        let text = required_text(input)?;
        let intent = match text {
            "1" => Intent::NewEnrollment,
            "2" => Intent::Reenrollment,
            _ => self.classifier.classify(text),
        };

        match intent {
            Intent::NewEnrollment => {
                session.enrollment_type = EnrollmentType::New;
                Ok(StepOutcome::advance(StepEvent::ChoseNewEnrollment))
            }
            Intent::Reenrollment => {
                let parent = self.eligibility.lookup_legacy_parent(&session.phone)?;
                let children = match &parent {
                    Some(parent) => self.eligibility.legacy_catechumens(&parent.code)?,
                    None => Vec::new(),
                };
                session.legacy_parent = parent;

                if children.is_empty() {
                    // Nothing to re-enroll: continue as a new enrollment.
                    session.enrollment_type = EnrollmentType::New;
                    return Ok(StepOutcome::Advance {
                        event: StepEvent::ChoseNewEnrollment,
                        notice: Some(prompts::unknown_parent().to_string()),
                    });
                }
                session.enrollment_type = EnrollmentType::Reenrollment;
                session.collected.legacy_children = children;
                Ok(StepOutcome::advance(StepEvent::ChoseReenrollment))
            }
            _ => Err(StepError::Validation(prompts::invalid_choice().to_string())),
        }
    }

    fn on_reenrollment_select(
        &self,
        session: &mut WorkflowSession,
        input: &UserInput,
        today: NaiveDate,
    ) -> StepResult {
        let text = required_text(input)?;
        let children = &session.collected.legacy_children;
        let child = parse_index(text, children.len())
            .map(|index| children[index].clone())
            .ok_or_else(|| StepError::Validation(prompts::invalid_choice().to_string()))?;

        let year = CatecheticalYear::upcoming(today);
        let suggestion = self.eligibility.suggest_class(&child, year);
        let collected = &mut session.collected;
        collected.child_prefill = child.birth_date.map(|birth_date| ChildInfo {
            last_name: child.last_name.clone(),
            first_names: child.first_names.clone(),
            birth_date,
            birth_place: String::new(),
        });
        collected.age = suggestion.age;
        collected.catechetical_year = Some(year);
        collected.suggestion = Some(suggestion);
        collected.legacy_child = Some(child);
        Ok(StepOutcome::advance(StepEvent::ChildSelected))
    }

    fn on_reenrollment_confirm(
        &self,
        session: &mut WorkflowSession,
        input: &UserInput,
        today: NaiveDate,
    ) -> StepResult {
        let text = required_text(input)?;
        let intent = match text {
            "1" => Intent::Confirm,
            "2" => Intent::Modify,
            _ => self.classifier.classify(text),
        };
        let suggestion = session.collected.suggestion.clone().unwrap_or_default();

        match intent {
            Intent::Confirm | Intent::Keep => {
                let child = session.collected.legacy_child.clone();
                let parent = session.legacy_parent.clone();
                let (Some(child), Some(parent), Some(level)) = (child, parent, suggestion.suggested)
                else {
                    session.collected.admissible_levels = suggestion.admissible;
                    return Ok(StepOutcome::advance(StepEvent::SuggestionChanged));
                };
                let Some(birth_date) = child.birth_date else {
                    session.collected.admissible_levels = suggestion.admissible;
                    return Ok(StepOutcome::advance(StepEvent::SuggestionChanged));
                };

                let year = session
                    .collected
                    .catechetical_year
                    .unwrap_or_else(|| CatecheticalYear::upcoming(today));
                let info = ChildInfo {
                    last_name: child.last_name.clone(),
                    first_names: child.first_names.clone(),
                    birth_date,
                    birth_place: String::new(),
                };
                if let Some(number) = self.enrolled_as(&info, year)? {
                    return Err(StepError::Escalation {
                        reason: format!("child already enrolled as {number}"),
                        notice: Some(prompts::duplicate_enrollment(&number)),
                    });
                }

                let collected = &mut session.collected;
                collected.parent = Some(parent_from_legacy(&parent));
                collected.child = Some(info);
                collected.birth_date = Some(birth_date);
                collected.level = Some(level);
                collected.catechetical_year = Some(year);
                Ok(StepOutcome::advance(StepEvent::SuggestionAccepted))
            }
            Intent::Modify | Intent::Deny => {
                session.collected.admissible_levels = suggestion.admissible;
                Ok(StepOutcome::advance(StepEvent::SuggestionChanged))
            }
            _ => Err(StepError::Validation(prompts::invalid_choice().to_string())),
        }
    }

    async fn on_age_verification(
        &self,
        session: &mut WorkflowSession,
        input: &UserInput,
        today: NaiveDate,
    ) -> StepResult {
        let Some(attachment) = input.attachment.as_ref().filter(|file| !file.bytes.is_empty())
        else {
            return Err(StepError::Validation(prompts::expected_document().to_string()));
        };

        let mut document = Document::new(
            session.user_id.clone(),
            DocumentKind::BirthCertificate,
            &attachment.bytes,
            attachment.format,
        );
        let result = self
            .extractor
            .process_document(&mut document, &attachment.bytes, false)
            .await;
        self.repository.save_document(document.clone())?;
        session.collected.birth_document = Some(document.id.clone());

        let needs_review = |reason: String| StepError::Escalation {
            reason,
            notice: Some(prompts::document_needs_review().to_string()),
        };
        match result.status {
            DocumentStatus::Success => {}
            DocumentStatus::Failed => {
                return Err(StepError::Extraction(
                    result
                        .error
                        .unwrap_or_else(|| "birth certificate extraction failed".to_string()),
                ))
            }
            _ => {
                return Err(needs_review(format!(
                    "birth certificate confidence {:.2} below {:.2}",
                    result.overall_confidence,
                    self.extractor.threshold()
                )))
            }
        }

        let birth_date = result
            .value("birth_date")
            .and_then(parse_loose_date)
            .ok_or_else(|| needs_review("birth date not found on certificate".to_string()))?;
        let age = self
            .eligibility
            .age_from_birthdate(birth_date, today)
            .map_err(|err| needs_review(err.to_string()))?;
        let levels = self.eligibility.classes_for_age(age);
        if levels.is_empty() {
            return Err(StepError::Escalation {
                reason: format!("no class admits age {age}"),
                notice: Some(prompts::no_class_for_age(age)),
            });
        }

        let collected = &mut session.collected;
        collected.child_prefill = match (result.value("surname"), result.value("given_names")) {
            (Some(last_name), Some(first_names)) => Some(ChildInfo {
                last_name: last_name.to_string(),
                first_names: first_names.to_string(),
                birth_date,
                birth_place: result.value("birth_place").unwrap_or_default().to_string(),
            }),
            _ => None,
        };
        collected.extraction = Some(result.extraction());
        collected.birth_date = Some(birth_date);
        collected.age = Some(age);
        collected.admissible_levels = levels;
        Ok(StepOutcome::advance(StepEvent::AgeVerified))
    }

    fn on_class_selection(&self, session: &mut WorkflowSession, input: &UserInput) -> StepResult {
        let text = required_text(input)?;
        let offered = offered_levels(session);
        let level = parse_index(text, offered.len())
            .map(|index| offered[index])
            .or_else(|| ClassLevel::parse(text).filter(|level| offered.contains(level)))
            .ok_or_else(|| StepError::Validation(prompts::invalid_choice().to_string()))?;

        session.collected.level = Some(level);
        Ok(StepOutcome::advance(StepEvent::ClassChosen))
    }

    fn on_parent_info(&self, session: &mut WorkflowSession, input: &UserInput) -> StepResult {
        let text = required_text(input)?;
        if let Some(legacy) = &session.legacy_parent {
            if text == "1" || matches!(self.classifier.classify(text), Intent::Keep | Intent::Confirm) {
                session.collected.parent = Some(parent_from_legacy(legacy));
                return Ok(StepOutcome::advance(StepEvent::ParentCaptured));
            }
        }

        let parent = parse_parent(text)
            .ok_or_else(|| StepError::Validation(prompts::invalid_parent_info().to_string()))?;
        session.collected.parent = Some(parent);
        Ok(StepOutcome::advance(StepEvent::ParentCaptured))
    }

    fn on_child_info(
        &self,
        session: &mut WorkflowSession,
        input: &UserInput,
        today: NaiveDate,
    ) -> StepResult {
        let text = required_text(input)?;
        let prefill = session
            .collected
            .child_prefill
            .clone()
            .filter(is_complete);
        let accepts_prefill = text == "1"
            || matches!(self.classifier.classify(text), Intent::Confirm | Intent::Keep);
        let child = match prefill {
            Some(prefill) if accepts_prefill => prefill,
            _ => parse_child(text)
                .ok_or_else(|| StepError::Validation(prompts::invalid_child_info().to_string()))?,
        };

        match session.collected.birth_date {
            Some(verified) if verified != child.birth_date => {
                return Err(StepError::Validation(prompts::birth_date_mismatch(verified)));
            }
            Some(_) => {}
            None => {
                let age = self
                    .eligibility
                    .age_from_birthdate(child.birth_date, today)
                    .map_err(|_| StepError::Validation(prompts::invalid_birth_date().to_string()))?;
                if let Some(level) = session.collected.level {
                    if !self.eligibility.classes_for_age(age).contains(&level) {
                        return Err(StepError::Validation(prompts::age_outside_level(age, level)));
                    }
                }
                session.collected.age = Some(age);
            }
        }

        session.collected.child = Some(child);
        Ok(StepOutcome::advance(StepEvent::ChildCaptured))
    }

    fn on_confirm_data(&self, session: &mut WorkflowSession, input: &UserInput) -> StepResult {
        let text = required_text(input)?;
        let intent = match text {
            "1" => Intent::Confirm,
            "2" => Intent::Deny,
            _ => self.classifier.classify(text),
        };

        match intent {
            Intent::Confirm => {
                let child = session
                    .collected
                    .child
                    .clone()
                    .ok_or_else(|| StepError::Internal("child data missing at confirmation".to_string()))?;
                if let Some(document_id) = &session.collected.birth_document {
                    self.confirm_birth_document(document_id, &child)?;
                }
                Ok(StepOutcome::advance(StepEvent::DataConfirmed))
            }
            Intent::Deny | Intent::Modify => Err(StepError::Escalation {
                reason: "submitter rejected the summary".to_string(),
                notice: Some(prompts::summary_rejected().to_string()),
            }),
            _ => Err(StepError::Validation(prompts::invalid_choice().to_string())),
        }
    }

    /// Record that the parent vouched for the data read from the birth certificate.
    fn confirm_birth_document(
        &self,
        document_id: &DocumentId,
        child: &ChildInfo,
    ) -> Result<(), StepError> {
        let Some(mut document) = self.repository.fetch_document(document_id)? else {
            return Ok(());
        };
        let mut confirmed = BTreeMap::new();
        confirmed.insert("surname".to_string(), child.last_name.clone());
        confirmed.insert("given_names".to_string(), child.first_names.clone());
        confirmed.insert(
            "birth_date".to_string(),
            child.birth_date.format("%d/%m/%Y").to_string(),
        );
        confirmed.insert("birth_place".to_string(), child.birth_place.clone());
        document.validated_extraction = Some(confirmed);
        document.validated_by_submitter = true;
        self.repository.save_document(document)?;
        Ok(())
    }

    fn on_year_selection(
        &self,
        session: &mut WorkflowSession,
        input: &UserInput,
        today: NaiveDate,
    ) -> StepResult {
        let text = required_text(input)?;
        let years = offered_years(today);
        let year = parse_index(text, years.len())
            .map(|index| years[index])
            .or_else(|| CatecheticalYear::parse(text).filter(|year| years.contains(year)))
            .ok_or_else(|| StepError::Validation(prompts::invalid_choice().to_string()))?;

        let child = session
            .collected
            .child
            .as_ref()
            .ok_or_else(|| StepError::Internal("child data missing at year selection".to_string()))?;
        // The other offered year may still be free.
        if let Some(number) = self.enrolled_as(child, year)? {
            return Err(StepError::BusinessRule(prompts::duplicate_enrollment(&number)));
        }

        session.collected.catechetical_year = Some(year);
        Ok(StepOutcome::advance(StepEvent::YearChosen))
    }

    async fn on_payment_proof(
        &self,
        session: &mut WorkflowSession,
        input: &UserInput,
        now: DateTime<Utc>,
    ) -> StepResult {
        let proof = self.read_payment_proof(session, input, now).await?;
        let draft = draft_from(session)?;
        let submission = self
            .gateway
            .open_enrollment(draft, proof, now)
            .await
            .map_err(|err| self.payment_step_error(err))?;

        let collected = &mut session.collected;
        collected.payment_reference = Some(submission.payment.reference.clone());
        collected.receipt_document = submission.payment.receipt_document.clone();
        collected.enrollment_number = Some(submission.enrollment.number.clone());
        collected.enrollment_id = Some(submission.enrollment.id);
        collected.payment_id = Some(submission.payment.id);
        collected.validation_id = Some(submission.validation.id);
        Ok(StepOutcome::advance(StepEvent::PaymentSubmitted))
    }

    async fn on_treasurer_validation(
        &self,
        session: &mut WorkflowSession,
        input: &UserInput,
        now: DateTime<Utc>,
    ) -> StepResult {
        let validation_id = session
            .collected
            .validation_id
            .clone()
            .ok_or_else(|| StepError::Internal("no validation linked to the session".to_string()))?;
        let validation = self
            .gateway
            .validation(&validation_id)
            .map_err(|err| StepError::Internal(err.to_string()))?;
        let number = enrollment_number(session).to_string();

        match validation.status {
            ValidationStatus::NeedsInfo => {
                let text = required_text(input)?;
                self.gateway
                    .supplement(&validation_id, &session.user_id, text, now)
                    .await
                    .map_err(|err| StepError::Internal(err.to_string()))?;
                Ok(StepOutcome::Stay(prompts::supplement_received()))
            }
            ValidationStatus::Rejected => {
                let enrollment_id = session.collected.enrollment_id.clone().ok_or_else(|| {
                    StepError::Internal("no enrollment linked to the session".to_string())
                })?;
                let proof = self.read_payment_proof(session, input, now).await?;
                let submission = self
                    .gateway
                    .resubmit(&enrollment_id, proof, now)
                    .await
                    .map_err(|err| self.payment_step_error(err))?;

                let collected = &mut session.collected;
                collected.payment_reference = Some(submission.payment.reference.clone());
                collected.receipt_document = submission.payment.receipt_document.clone();
                collected.payment_id = Some(submission.payment.id);
                collected.validation_id = Some(submission.validation.id);
                session.retries = 0;
                Ok(StepOutcome::Stay(prompts::treasurer_waiting(&number)))
            }
            ValidationStatus::Approved => Ok(StepOutcome::advance(StepEvent::PaymentApproved)),
            _ => Ok(StepOutcome::Stay(prompts::still_waiting(&number))),
        }
    }

    async fn read_payment_proof(
        &self,
        session: &WorkflowSession,
        input: &UserInput,
        now: DateTime<Utc>,
    ) -> Result<PaymentProof, StepError> {
        let attachment = input
            .attachment
            .as_ref()
            .filter(|file| !file.bytes.is_empty());
        let proof = match (attachment, input.text.as_deref().map(str::trim)) {
            (Some(file), _) => {
                self.gateway
                    .verify_receipt(&session.user_id, &file.bytes, file.format, now.date_naive())
                    .await
            }
            (None, Some(text)) if !text.is_empty() => self.gateway.check_reference(text),
            _ => return Err(StepError::Validation(prompts::invalid_reference().to_string())),
        };
        proof.map_err(|err| self.payment_step_error(err))
    }

    fn payment_step_error(&self, err: GatewayError) -> StepError {
        match err {
            GatewayError::InvalidReference => {
                StepError::Validation(prompts::invalid_reference().to_string())
            }
            GatewayError::ProviderNotAccepted(provider) => {
                StepError::Validation(prompts::provider_not_accepted(provider.display_name()))
            }
            GatewayError::ReceiptUnreadable {
                document_id,
                status: DocumentStatus::Failed,
            } => StepError::Extraction(format!("receipt {document_id} could not be processed")),
            GatewayError::ReceiptUnreadable { .. } => {
                StepError::Validation(prompts::receipt_unreadable().to_string())
            }
            GatewayError::FeeMismatch { expected, found } => StepError::BusinessRule(
                prompts::fee_mismatch(expected, found, &self.gateway.settings().currency),
            ),
            GatewayError::ReceiptFromFuture(_) => {
                StepError::BusinessRule(prompts::receipt_from_future().to_string())
            }
            GatewayError::DuplicateReference(reference) => {
                StepError::BusinessRule(prompts::reference_already_used(&reference))
            }
            GatewayError::DuplicateEnrollment { number } => StepError::Escalation {
                reason: format!("child already enrolled as {number}"),
                notice: Some(prompts::duplicate_enrollment(&number)),
            },
            other => StepError::Internal(other.to_string()),
        }
    }

    /// Number of the enrollment this child already holds for `year`, if any.
    fn enrolled_as(
        &self,
        child: &ChildInfo,
        year: CatecheticalYear,
    ) -> Result<Option<String>, StepError> {
        Ok(self
            .repository
            .find_duplicate(&child.identity_key(), year)?
            .map(|existing| existing.number))
    }
}

fn reply(session: &WorkflowSession, prompt: Prompt) -> WorkflowReply {
    WorkflowReply {
        workflow_id: session.workflow_id.clone(),
        step: session.current_step,
        message: prompt.message,
        options: prompt.options,
        next_step: happy_path_successor(session.current_step),
    }
}

fn required_text(input: &UserInput) -> Result<&str, StepError> {
    input
        .text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| StepError::Validation(prompts::expected_text().to_string()))
}

/// One-based option number to index.
fn parse_index(text: &str, len: usize) -> Option<usize> {
    text.trim()
        .trim_end_matches('.')
        .parse::<usize>()
        .ok()
        .filter(|number| (1..=len).contains(number))
        .map(|number| number - 1)
}

fn enrollment_number(session: &WorkflowSession) -> &str {
    session
        .collected
        .enrollment_number
        .as_deref()
        .unwrap_or_default()
}

fn offered_levels(session: &WorkflowSession) -> Vec<ClassLevel> {
    if session.collected.admissible_levels.is_empty() {
        ClassLevel::ALL.to_vec()
    } else {
        session.collected.admissible_levels.clone()
    }
}

fn offered_years(today: NaiveDate) -> Vec<CatecheticalYear> {
    let current = CatecheticalYear::containing(today);
    vec![current, current.next()]
}

fn is_complete(child: &ChildInfo) -> bool {
    !child.last_name.trim().is_empty()
        && !child.first_names.trim().is_empty()
        && !child.birth_place.trim().is_empty()
}

fn parent_from_legacy(parent: &LegacyParent) -> ParentInfo {
    ParentInfo {
        last_name: parent.last_name.clone(),
        first_name: parent.first_name.clone(),
        phone: parent.phone.clone(),
        email: None,
    }
}

/// `Nom; Prénom; Téléphone; Email?`
fn parse_parent(text: &str) -> Option<ParentInfo> {
    let parts: Vec<&str> = text.split(';').map(str::trim).collect();
    if !(3..=4).contains(&parts.len()) {
        return None;
    }
    let (last_name, first_name, phone) = (parts[0], parts[1], parts[2]);
    if last_name.is_empty() || first_name.is_empty() || normalize_phone(phone).len() < 8 {
        return None;
    }
    let email = match parts.get(3).copied().filter(|email| !email.is_empty()) {
        Some(email) if email.contains('@') => Some(email.to_string()),
        Some(_) => return None,
        None => None,
    };
    Some(ParentInfo {
        last_name: last_name.to_string(),
        first_name: first_name.to_string(),
        phone: phone.to_string(),
        email,
    })
}

/// `Nom; Prénoms; JJ/MM/AAAA; Lieu`
fn parse_child(text: &str) -> Option<ChildInfo> {
    let parts: Vec<&str> = text.split(';').map(str::trim).collect();
    let [last_name, first_names, birth_date, birth_place] = parts.as_slice() else {
        return None;
    };
    if last_name.is_empty() || first_names.is_empty() || birth_place.is_empty() {
        return None;
    }
    let birth_date = NaiveDate::parse_from_str(birth_date, "%d/%m/%Y").ok()?;
    Some(ChildInfo {
        last_name: last_name.to_string(),
        first_names: first_names.to_string(),
        birth_date,
        birth_place: birth_place.to_string(),
    })
}

fn draft_from(session: &WorkflowSession) -> Result<EnrollmentDraft, StepError> {
    let collected = &session.collected;
    let missing = |what: &str| StepError::Internal(format!("{what} missing at payment"));
    let parent = collected.parent.clone().ok_or_else(|| missing("parent"))?;
    let child = collected.child.clone().ok_or_else(|| missing("child"))?;
    let level = collected.level.ok_or_else(|| missing("class level"))?;
    let catechetical_year = collected
        .catechetical_year
        .ok_or_else(|| missing("catechetical year"))?;

    let parent_id = match &session.legacy_parent {
        Some(legacy) => legacy.code.clone(),
        None => normalize_phone(&parent.phone),
    };
    Ok(EnrollmentDraft {
        parent_id,
        parent,
        child,
        baptism_date: None,
        baptism_parish: None,
        origin_parish: None,
        catechetical_year,
        level,
        submitted_by: session.user_id.clone(),
        channel: session.channel,
        documents: collected.birth_document.iter().cloned().collect(),
    })
}

/// Copy fields of a supplementary document onto the enrollment. Returns whether anything changed.
fn apply_document_fields(enrollment: &mut PendingEnrollment, result: &ExtractionResult) -> bool {
    let mut changed = false;
    match result.kind {
        DocumentKind::BaptismCertificate => {
            if let Some(date) = result.value("baptism_date").and_then(parse_loose_date) {
                enrollment.baptism_date = Some(date);
                changed = true;
            }
            if let Some(parish) = result.value("baptism_parish") {
                enrollment.baptism_parish = Some(parish.to_string());
                changed = true;
            }
        }
        DocumentKind::TransferAttestation => {
            if let Some(parish) = result.value("origin_parish") {
                enrollment.origin_parish = Some(parish.to_string());
                changed = true;
            }
        }
        DocumentKind::BirthCertificate | DocumentKind::PaymentReceipt => {}
    }
    changed
}

//! Payment proof intake and the treasurer hand-off.

pub mod provider;
pub mod treasurer;

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use self::provider::{detect_provider, normalize_reference, Provider};
use self::treasurer::{
    plan_decision, DecisionError, QueueError, TreasurerAction, TreasurerQueue,
};
use super::domain::{
    CatecheticalYear, Channel, ChildInfo, ClassLevel, Document, DocumentFormat, DocumentId,
    DocumentKind, DocumentStatus, EnrollmentId, EnrollmentStatus, ParentInfo, Payment, PaymentId,
    PaymentStatus, PaymentValidation, PendingEnrollment, ReviewerId, UserId, ValidationId,
    ValidationNote, ValidationStatus,
};
use super::extraction::{parse_loose_date, DocumentExtractor};
use super::prompts;
use super::repository::{
    notify_quietly, EnrollmentRepository, Notification, Notifier, Recipient, RepositoryError,
};
use crate::config::EnrollmentConfig;
use crate::telemetry::AUDIT_TARGET;

/// Fee and acceptance rules applied to every payment proof.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSettings {
    pub fee: u32,
    pub currency: String,
    pub providers: Vec<Provider>,
    pub expiry: Duration,
    pub stale_after: Duration,
}

impl PaymentSettings {
    pub fn from_config(config: &EnrollmentConfig) -> Self {
        let providers: Vec<Provider> = config
            .accepted_providers
            .iter()
            .filter_map(|code| Provider::from_code(code))
            .collect();
        Self {
            fee: config.fee,
            currency: config.currency.clone(),
            providers: if providers.is_empty() {
                Provider::ALL.to_vec()
            } else {
                providers
            },
            expiry: config.payment_expiry(),
            stale_after: Duration::days(i64::from(config.receipt_stale_days)),
        }
    }
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self::from_config(&EnrollmentConfig::default())
    }
}

/// Everything the conversation collected before payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentDraft {
    pub parent_id: String,
    pub parent: ParentInfo,
    pub child: ChildInfo,
    pub baptism_date: Option<NaiveDate>,
    pub baptism_parish: Option<String>,
    pub origin_parish: Option<String>,
    pub catechetical_year: CatecheticalYear,
    pub level: ClassLevel,
    pub submitted_by: UserId,
    pub channel: Channel,
    pub documents: Vec<DocumentId>,
}

/// A payment proof that passed format and fee checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentProof {
    pub provider: Provider,
    pub reference: String,
    pub amount: u32,
    pub receipt_document: Option<DocumentId>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub enrollment: PendingEnrollment,
    pub payment: Payment,
    pub validation: PaymentValidation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionOutcome {
    pub action: TreasurerAction,
    pub validation: PaymentValidation,
    pub payment: Payment,
    pub enrollment: PendingEnrollment,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("reference does not match any accepted provider format")]
    InvalidReference,
    #[error("provider {} is not accepted", .0.display_name())]
    ProviderNotAccepted(Provider),
    #[error("receipt {document_id} could not be read ({})", .status.label())]
    ReceiptUnreadable {
        document_id: DocumentId,
        status: DocumentStatus,
    },
    #[error("receipt amount {found} does not match the enrollment fee {expected}")]
    FeeMismatch { expected: u32, found: u32 },
    #[error("receipt is dated in the future ({0})")]
    ReceiptFromFuture(NaiveDate),
    #[error("reference {0} was already submitted")]
    DuplicateReference(String),
    #[error("child already enrolled for this year ({number})")]
    DuplicateEnrollment { number: String },
    #[error("enrollment {0} no longer accepts payments")]
    EnrollmentClosed(EnrollmentId),
    #[error("active enrollments cannot be cancelled")]
    CannotCancelActive,
    #[error("validation is not waiting for information")]
    NotAwaitingInformation,
    #[error("validation {0} not found")]
    ValidationNotFound(ValidationId),
    #[error("payment {0} not found")]
    PaymentNotFound(PaymentId),
    #[error("enrollment {0} not found")]
    EnrollmentNotFound(EnrollmentId),
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Validates payment proofs, opens enrollments and applies treasurer decisions.
pub struct PaymentGateway {
    repository: Arc<dyn EnrollmentRepository>,
    extractor: Arc<DocumentExtractor>,
    queue: Arc<dyn TreasurerQueue>,
    notifier: Arc<dyn Notifier>,
    settings: PaymentSettings,
}

impl PaymentGateway {
    pub fn new(
        repository: Arc<dyn EnrollmentRepository>,
        extractor: Arc<DocumentExtractor>,
        queue: Arc<dyn TreasurerQueue>,
        notifier: Arc<dyn Notifier>,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            repository,
            extractor,
            queue,
            notifier,
            settings,
        }
    }

    pub fn settings(&self) -> &PaymentSettings {
        &self.settings
    }

    /// Validate a typed transaction reference against the accepted provider formats.
    pub fn check_reference(&self, text: &str) -> Result<PaymentProof, GatewayError> {
        let (provider, reference) = self.accepted_reference(text)?;
        Ok(PaymentProof {
            provider,
            reference,
            amount: self.settings.fee,
            receipt_document: None,
            warnings: Vec::new(),
        })
    }

    fn accepted_reference(&self, text: &str) -> Result<(Provider, String), GatewayError> {
        let reference = normalize_reference(text);
        let provider = detect_provider(&reference).ok_or(GatewayError::InvalidReference)?;
        if !self.settings.providers.contains(&provider) {
            return Err(GatewayError::ProviderNotAccepted(provider));
        }
        Ok((provider, reference))
    }

    /// Extract a receipt image and cross-check reference, amount and date.
    ///
    /// The receipt document is persisted whatever the outcome so staff can look at it.
    pub async fn verify_receipt(
        &self,
        owner: &UserId,
        image: &[u8],
        format: DocumentFormat,
        today: NaiveDate,
    ) -> Result<PaymentProof, GatewayError> {
        let mut document = Document::new(owner.clone(), DocumentKind::PaymentReceipt, image, format);
        let result = self
            .extractor
            .process_document(&mut document, image, false)
            .await;
        self.repository.save_document(document.clone())?;

        let unreadable = || GatewayError::ReceiptUnreadable {
            document_id: document.id.clone(),
            status: result.status,
        };
        if result.status != DocumentStatus::Success {
            return Err(unreadable());
        }

        let (provider, reference) = match result.value("reference") {
            Some(raw) => self.accepted_reference(raw)?,
            None => return Err(unreadable()),
        };

        let amount: u32 = result
            .value("amount")
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(unreadable)?;
        if amount != self.settings.fee {
            return Err(GatewayError::FeeMismatch {
                expected: self.settings.fee,
                found: amount,
            });
        }

        let mut warnings = Vec::new();
        match result.value("date").and_then(parse_loose_date) {
            Some(date) if date > today => return Err(GatewayError::ReceiptFromFuture(date)),
            Some(date) if today - date > self.settings.stale_after => warnings.push(format!(
                "receipt dated {} is older than {} days",
                date.format("%d/%m/%Y"),
                self.settings.stale_after.num_days()
            )),
            Some(_) => {}
            None => warnings.push("receipt date unreadable".to_string()),
        }

        if let Some(printed) = result.value("provider").and_then(Provider::from_code) {
            if printed != provider {
                warnings.push(format!(
                    "receipt issued by {} but reference belongs to {}",
                    printed.display_name(),
                    provider.display_name()
                ));
            }
        }

        Ok(PaymentProof {
            provider,
            reference,
            amount,
            receipt_document: Some(document.id),
            warnings,
        })
    }

    /// Persist the enrollment, its payment and the validation request, then hand it to a treasurer.
    pub async fn open_enrollment(
        &self,
        draft: EnrollmentDraft,
        proof: PaymentProof,
        now: DateTime<Utc>,
    ) -> Result<Submission, GatewayError> {
        if let Some(existing) = self
            .repository
            .find_duplicate(&draft.child.identity_key(), draft.catechetical_year)?
        {
            return Err(GatewayError::DuplicateEnrollment {
                number: existing.number,
            });
        }
        self.ensure_unused(&proof.reference)?;

        let enrollment = PendingEnrollment {
            id: EnrollmentId::generate(),
            number: self
                .repository
                .next_enrollment_number(draft.catechetical_year)?,
            parent_id: draft.parent_id,
            parent: draft.parent,
            child: draft.child,
            baptism_date: draft.baptism_date,
            baptism_parish: draft.baptism_parish,
            origin_parish: draft.origin_parish,
            catechetical_year: draft.catechetical_year,
            level: draft.level,
            class_id: None,
            status: EnrollmentStatus::AwaitingPayment,
            amount_due: self.settings.fee,
            amount_paid: 0,
            validated_by: None,
            validated_at: None,
            notes: Vec::new(),
            submitted_by: draft.submitted_by,
            channel: draft.channel,
            created_at: now,
            updated_at: now,
        };
        let enrollment = self.repository.insert_enrollment(enrollment)?;

        for document_id in &draft.documents {
            self.link_document(document_id, &enrollment.id)?;
        }

        let (payment, validation) = self.queue_payment(&enrollment, proof, now).await?;
        tracing::info!(
            enrollment = %enrollment.number,
            payment = %payment.id,
            validation = %validation.id,
            "enrollment opened"
        );

        Ok(Submission {
            enrollment,
            payment,
            validation,
        })
    }

    /// New payment for an enrollment whose previous proof was rejected or expired.
    pub async fn resubmit(
        &self,
        enrollment_id: &EnrollmentId,
        proof: PaymentProof,
        now: DateTime<Utc>,
    ) -> Result<Submission, GatewayError> {
        let mut enrollment = self
            .repository
            .fetch_enrollment(enrollment_id)?
            .ok_or_else(|| GatewayError::EnrollmentNotFound(enrollment_id.clone()))?;
        if !matches!(
            enrollment.status,
            EnrollmentStatus::AwaitingPayment | EnrollmentStatus::PartiallyPaid
        ) {
            return Err(GatewayError::EnrollmentClosed(enrollment_id.clone()));
        }
        let open = self.repository.payments_for_enrollment(enrollment_id)?;
        if open.iter().any(|payment| payment.status.is_unresolved()) {
            return Err(GatewayError::EnrollmentClosed(enrollment_id.clone()));
        }
        self.ensure_unused(&proof.reference)?;

        enrollment.status = EnrollmentStatus::AwaitingPayment;
        enrollment.updated_at = now;
        self.repository.update_enrollment(enrollment.clone())?;

        let (payment, validation) = self.queue_payment(&enrollment, proof, now).await?;
        Ok(Submission {
            enrollment,
            payment,
            validation,
        })
    }

    fn ensure_unused(&self, reference: &str) -> Result<(), GatewayError> {
        let reused = self
            .repository
            .payments_by_reference(reference)?
            .into_iter()
            .find(|existing| existing.status != PaymentStatus::Expired);
        match reused {
            Some(existing) => Err(GatewayError::DuplicateReference(existing.reference)),
            None => Ok(()),
        }
    }

    fn link_document(
        &self,
        document_id: &DocumentId,
        enrollment_id: &EnrollmentId,
    ) -> Result<(), GatewayError> {
        if let Some(mut document) = self.repository.fetch_document(document_id)? {
            document.enrollment_id = Some(enrollment_id.clone());
            self.repository.save_document(document)?;
        }
        Ok(())
    }

    async fn queue_payment(
        &self,
        enrollment: &PendingEnrollment,
        proof: PaymentProof,
        now: DateTime<Utc>,
    ) -> Result<(Payment, PaymentValidation), GatewayError> {
        if let Some(document_id) = &proof.receipt_document {
            self.link_document(document_id, &enrollment.id)?;
        }

        let payment = self.repository.insert_payment(Payment {
            id: PaymentId::generate(),
            enrollment_id: enrollment.id.clone(),
            provider: proof.provider,
            reference: proof.reference,
            amount: proof.amount,
            status: PaymentStatus::Pending,
            submitted_by: enrollment.submitted_by.clone(),
            channel: enrollment.channel,
            receipt_document: proof.receipt_document,
            warnings: proof.warnings,
            created_at: now,
            updated_at: now,
        })?;

        let mut validation = PaymentValidation {
            id: ValidationId::generate(),
            payment_id: payment.id.clone(),
            enrollment_id: enrollment.id.clone(),
            assigned_to: None,
            status: ValidationStatus::PendingReview,
            notes: Vec::new(),
            escalation_level: 0,
            decided_by: None,
            created_at: now,
            updated_at: now,
        };
        let reviewer = self.queue.assign(&validation)?;
        validation.assigned_to = Some(reviewer.clone());
        let validation = self.repository.insert_validation(validation)?;

        let mut notification = Notification::new(
            Recipient::Reviewer {
                reviewer_id: reviewer,
            },
            "payment_review_requested",
            prompts::reviewer_new_validation(
                &enrollment.number,
                &payment.reference,
                payment.amount,
                &self.settings.currency,
            ),
        )
        .with_detail("validation_id", &validation.id)
        .with_detail("enrollment_number", &enrollment.number);
        if !payment.warnings.is_empty() {
            notification = notification.with_detail("warnings", payment.warnings.join("; "));
        }
        notify_quietly(self.notifier.as_ref(), notification).await;

        Ok((payment, validation))
    }

    /// Unresolved validations in arrival order.
    pub fn pending_queue(&self, limit: usize) -> Result<Vec<PaymentValidation>, GatewayError> {
        Ok(self.repository.pending_validations(limit)?)
    }

    pub fn validation(&self, id: &ValidationId) -> Result<PaymentValidation, GatewayError> {
        self.repository
            .fetch_validation(id)?
            .ok_or_else(|| GatewayError::ValidationNotFound(id.clone()))
    }

    /// A treasurer takes a validation off the queue.
    pub fn claim(
        &self,
        id: &ValidationId,
        reviewer: &ReviewerId,
        now: DateTime<Utc>,
    ) -> Result<PaymentValidation, GatewayError> {
        let mut validation = self.validation(id)?;
        let seen = validation.status;
        if seen.is_resolved() {
            return Err(DecisionError::AlreadyResolved(seen).into());
        }
        validation.status = ValidationStatus::UnderReview;
        validation.assigned_to = Some(reviewer.clone());
        validation.updated_at = now;
        self.commit_validation(validation.clone(), seen)?;
        tracing::info!(validation = %id, %reviewer, "validation claimed");
        Ok(validation)
    }

    /// Apply a treasurer decision to the validation, its payment and its enrollment.
    pub async fn decide(
        &self,
        id: &ValidationId,
        reviewer: &ReviewerId,
        action: TreasurerAction,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DecisionOutcome, GatewayError> {
        let mut validation = self.validation(id)?;
        let seen = validation.status;
        let plan = plan_decision(seen, action)?;
        let mut payment = self
            .repository
            .fetch_payment(&validation.payment_id)?
            .ok_or_else(|| GatewayError::PaymentNotFound(validation.payment_id.clone()))?;
        let mut enrollment = self
            .repository
            .fetch_enrollment(&validation.enrollment_id)?
            .ok_or_else(|| GatewayError::EnrollmentNotFound(validation.enrollment_id.clone()))?;

        let payment_seen = payment.status;
        let notes = notes
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());

        validation.status = plan.validation;
        validation.updated_at = now;
        if let Some(text) = &notes {
            validation.notes.push(ValidationNote {
                author: reviewer.to_string(),
                text: text.clone(),
                at: now,
            });
        }
        if plan.escalate {
            validation.escalation_level += 1;
            if let Some(next) = self
                .queue
                .reassign(&validation, validation.assigned_to.as_ref())?
            {
                validation.assigned_to = Some(next);
            }
        } else if matches!(action, TreasurerAction::Approve | TreasurerAction::Reject) {
            validation.decided_by = Some(reviewer.clone());
        }

        if let Some(status) = plan.payment {
            payment.status = status;
            payment.updated_at = now;
        }
        if let Some(status) = plan.enrollment {
            enrollment.status = status;
            enrollment.updated_at = now;
            if status == EnrollmentStatus::Active {
                enrollment.amount_paid = payment.amount;
                enrollment.validated_by = Some(reviewer.clone());
                enrollment.validated_at = Some(now);
            }
        }

        // Only the first writer past the validation guard may touch the payment and enrollment.
        self.commit_validation(validation.clone(), seen)?;
        if plan.payment.is_some() {
            self.repository.update_payment_if(payment.clone(), payment_seen)?;
        }
        if plan.enrollment.is_some() {
            self.repository.update_enrollment(enrollment.clone())?;
        }

        tracing::info!(
            target: AUDIT_TARGET,
            validation = %validation.id,
            reviewer = %reviewer,
            action = action.label(),
            validation_status = validation.status.label(),
            payment_status = payment.status.label(),
            enrollment_status = enrollment.status.label(),
            escalation_level = validation.escalation_level,
            "treasurer decision"
        );

        let submitter = Recipient::Submitter {
            user_id: payment.submitted_by.clone(),
            channel: payment.channel,
        };
        let (template, message) = match action {
            TreasurerAction::Approve => (
                "payment_approved",
                prompts::payment_approved(&enrollment.number),
            ),
            TreasurerAction::Reject => (
                "payment_rejected",
                prompts::payment_rejected(&enrollment.number, notes.as_deref()),
            ),
            TreasurerAction::RequestInfo => (
                "payment_needs_info",
                prompts::payment_needs_info(&enrollment.number, notes.as_deref()),
            ),
            TreasurerAction::Escalate => (
                "payment_escalated",
                prompts::payment_escalated(&enrollment.number),
            ),
        };
        let mut notification = Notification::new(submitter, template, message)
            .with_detail("validation_id", &validation.id)
            .with_detail("action", action.label());
        if let Some(text) = &notes {
            notification = notification.with_detail("notes", text);
        }
        notify_quietly(self.notifier.as_ref(), notification).await;

        if plan.escalate {
            if let Some(assignee) = validation.assigned_to.clone() {
                let notification = Notification::new(
                    Recipient::Reviewer {
                        reviewer_id: assignee,
                    },
                    "payment_review_escalated",
                    prompts::reviewer_new_validation(
                        &enrollment.number,
                        &payment.reference,
                        payment.amount,
                        &self.settings.currency,
                    ),
                )
                .with_detail("validation_id", &validation.id)
                .with_detail("escalation_level", validation.escalation_level);
                notify_quietly(self.notifier.as_ref(), notification).await;
            }
        }

        Ok(DecisionOutcome {
            action,
            validation,
            payment,
            enrollment,
        })
    }

    /// Follow-up text from the parent on a `needs_info` validation; sends it back to review.
    pub async fn supplement(
        &self,
        id: &ValidationId,
        author: &UserId,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentValidation, GatewayError> {
        let mut validation = self.validation(id)?;
        if validation.status != ValidationStatus::NeedsInfo {
            return Err(GatewayError::NotAwaitingInformation);
        }
        validation.notes.push(ValidationNote {
            author: author.to_string(),
            text: text.trim().to_string(),
            at: now,
        });
        validation.status = ValidationStatus::PendingReview;
        validation.updated_at = now;
        self.commit_validation(validation.clone(), ValidationStatus::NeedsInfo)?;

        if let Some(reviewer) = validation.assigned_to.clone() {
            let number = self
                .repository
                .fetch_enrollment(&validation.enrollment_id)?
                .map(|enrollment| enrollment.number)
                .unwrap_or_else(|| validation.enrollment_id.to_string());
            let notification = Notification::new(
                Recipient::Reviewer {
                    reviewer_id: reviewer,
                },
                "payment_supplement_received",
                prompts::reviewer_supplement(&number, text.trim()),
            )
            .with_detail("validation_id", &validation.id);
            notify_quietly(self.notifier.as_ref(), notification).await;
        }
        Ok(validation)
    }

    /// Explicit cancellation. Open payments of the enrollment are rejected with it.
    pub async fn cancel_enrollment(
        &self,
        id: &EnrollmentId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingEnrollment, GatewayError> {
        let mut enrollment = self
            .repository
            .fetch_enrollment(id)?
            .ok_or_else(|| GatewayError::EnrollmentNotFound(id.clone()))?;
        match enrollment.status {
            EnrollmentStatus::Active => return Err(GatewayError::CannotCancelActive),
            EnrollmentStatus::Cancelled => return Ok(enrollment),
            _ => {}
        }

        for payment in self.repository.payments_for_enrollment(id)? {
            if !payment.status.is_unresolved() {
                continue;
            }
            let payment_id = payment.id.clone();
            let closed =
                self.close_payment(payment, PaymentStatus::Rejected, "enrollment cancelled", now)?;
            if closed.is_none() && self.approved(&payment_id)? {
                return Err(GatewayError::CannotCancelActive);
            }
        }

        enrollment.status = EnrollmentStatus::Cancelled;
        enrollment.notes.push(format!("cancelled: {}", reason.trim()));
        enrollment.updated_at = now;
        self.repository.update_enrollment(enrollment.clone())?;

        tracing::info!(target: AUDIT_TARGET, enrollment = %enrollment.number, reason, "enrollment cancelled");
        let notification = Notification::new(
            Recipient::Submitter {
                user_id: enrollment.submitted_by.clone(),
                channel: enrollment.channel,
            },
            "enrollment_cancelled",
            prompts::enrollment_cancelled(&enrollment.number),
        )
        .with_detail("reason", reason.trim());
        notify_quietly(self.notifier.as_ref(), notification).await;

        Ok(enrollment)
    }

    /// Expire payments left unresolved longer than the configured window.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<Payment>, GatewayError> {
        let mut expired = Vec::new();
        for payment in self.repository.unresolved_payments()? {
            if now - payment.created_at <= self.settings.expiry {
                continue;
            }
            let Some(payment) =
                self.close_payment(payment, PaymentStatus::Expired, "payment expired", now)?
            else {
                continue;
            };

            tracing::info!(
                target: AUDIT_TARGET,
                payment = %payment.id,
                reference = %payment.reference,
                "payment expired"
            );
            let notification = Notification::new(
                Recipient::Submitter {
                    user_id: payment.submitted_by.clone(),
                    channel: payment.channel,
                },
                "payment_expired",
                prompts::payment_expired(&payment.reference),
            )
            .with_detail("payment_id", &payment.id);
            notify_quietly(self.notifier.as_ref(), notification).await;
            expired.push(payment);
        }
        Ok(expired)
    }

    /// Move a payment to a final status and take its validation off the queue.
    ///
    /// Returns `None` when a treasurer decided the validation first; the payment is left alone.
    fn close_payment(
        &self,
        mut payment: Payment,
        status: PaymentStatus,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Payment>, GatewayError> {
        if let Some(mut validation) = self.repository.validation_for_payment(&payment.id)? {
            let seen = validation.status;
            if seen.is_resolved() {
                return Ok(None);
            }
            validation.status = ValidationStatus::Rejected;
            validation.notes.push(ValidationNote {
                author: "system".to_string(),
                text: note.to_string(),
                at: now,
            });
            validation.updated_at = now;
            match self.repository.update_validation_if(validation, seen) {
                Ok(()) => {}
                Err(RepositoryError::StatusChanged { .. }) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }

        let seen = payment.status;
        payment.status = status;
        payment.updated_at = now;
        match self.repository.update_payment_if(payment.clone(), seen) {
            Ok(()) => Ok(Some(payment)),
            Err(RepositoryError::StatusChanged { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Store `validation` unless its status moved away from `seen` since it was read.
    fn commit_validation(
        &self,
        validation: PaymentValidation,
        seen: ValidationStatus,
    ) -> Result<(), GatewayError> {
        let id = validation.id.clone();
        match self.repository.update_validation_if(validation, seen) {
            Ok(()) => Ok(()),
            Err(RepositoryError::StatusChanged { .. }) => {
                let current = self.validation(&id)?.status;
                let err = if current.is_resolved() {
                    DecisionError::AlreadyResolved(current)
                } else {
                    DecisionError::Changed(current)
                };
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn approved(&self, payment_id: &PaymentId) -> Result<bool, GatewayError> {
        Ok(self
            .repository
            .validation_for_payment(payment_id)?
            .map(|validation| validation.status == ValidationStatus::Approved)
            .unwrap_or(false))
    }
}

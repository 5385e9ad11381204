use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::domain::{
    CatecheticalYear, Channel, Document, DocumentId, EnrollmentId, EnrollmentStatus, Payment,
    PaymentId, PaymentStatus, PaymentValidation, PendingEnrollment, ReviewerId, UserId,
    ValidationId, ValidationStatus,
};
use super::payment::provider::normalize_reference;

/// Storage collaborator for every persisted record of the workflow.
///
/// Each record is mutated on its own; no method needs to lock more than one row. Status changes
/// that race with other writers go through the `_if` updates, which compare the stored status.
pub trait EnrollmentRepository: Send + Sync {
    /// Allocate the next `CAT-<year>-<seq>` number for `year`. Never hands out the same one twice.
    fn next_enrollment_number(&self, year: CatecheticalYear) -> Result<String, RepositoryError>;
    fn insert_enrollment(
        &self,
        enrollment: PendingEnrollment,
    ) -> Result<PendingEnrollment, RepositoryError>;
    fn update_enrollment(&self, enrollment: PendingEnrollment) -> Result<(), RepositoryError>;
    fn fetch_enrollment(
        &self,
        id: &EnrollmentId,
    ) -> Result<Option<PendingEnrollment>, RepositoryError>;
    /// Non-cancelled enrollment of the same child for `year`.
    fn find_duplicate(
        &self,
        identity_key: &str,
        year: CatecheticalYear,
    ) -> Result<Option<PendingEnrollment>, RepositoryError>;

    /// Insert or replace.
    fn save_document(&self, document: Document) -> Result<(), RepositoryError>;
    fn fetch_document(&self, id: &DocumentId) -> Result<Option<Document>, RepositoryError>;

    fn insert_payment(&self, payment: Payment) -> Result<Payment, RepositoryError>;
    /// Replace the payment only while its stored status is still `expected`.
    fn update_payment_if(
        &self,
        payment: Payment,
        expected: PaymentStatus,
    ) -> Result<(), RepositoryError>;
    fn fetch_payment(&self, id: &PaymentId) -> Result<Option<Payment>, RepositoryError>;
    fn payments_by_reference(&self, reference: &str) -> Result<Vec<Payment>, RepositoryError>;
    fn payments_for_enrollment(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<Vec<Payment>, RepositoryError>;
    /// Payments still `pending` or `processing`.
    fn unresolved_payments(&self) -> Result<Vec<Payment>, RepositoryError>;

    fn insert_validation(
        &self,
        validation: PaymentValidation,
    ) -> Result<PaymentValidation, RepositoryError>;
    /// Replace the validation only while its stored status is still `expected`.
    fn update_validation_if(
        &self,
        validation: PaymentValidation,
        expected: ValidationStatus,
    ) -> Result<(), RepositoryError>;
    fn fetch_validation(
        &self,
        id: &ValidationId,
    ) -> Result<Option<PaymentValidation>, RepositoryError>;
    fn validation_for_payment(
        &self,
        payment_id: &PaymentId,
    ) -> Result<Option<PaymentValidation>, RepositoryError>;
    /// Unresolved validations, oldest first.
    fn pending_validations(&self, limit: usize) -> Result<Vec<PaymentValidation>, RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("record is {found}, expected {expected}")]
    StatusChanged {
        expected: &'static str,
        found: &'static str,
    },
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Default)]
struct Tables {
    enrollments: HashMap<EnrollmentId, PendingEnrollment>,
    documents: HashMap<DocumentId, Document>,
    payments: HashMap<PaymentId, Payment>,
    validations: HashMap<ValidationId, PaymentValidation>,
    sequences: HashMap<i32, u64>,
}

/// Process-local repository backing the service binary, the demo and tests.
#[derive(Debug, Default)]
pub struct InMemoryEnrollmentRepository {
    tables: Mutex<Tables>,
}

impl InMemoryEnrollmentRepository {
    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, RepositoryError> {
        self.tables
            .lock()
            .map_err(|_| RepositoryError::Unavailable("repository mutex poisoned".to_string()))
    }

    pub fn enrollments(&self) -> Vec<PendingEnrollment> {
        self.tables()
            .map(|tables| tables.enrollments.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn payments(&self) -> Vec<Payment> {
        self.tables()
            .map(|tables| tables.payments.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn documents(&self) -> Vec<Document> {
        self.tables()
            .map(|tables| tables.documents.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl EnrollmentRepository for InMemoryEnrollmentRepository {
    fn next_enrollment_number(&self, year: CatecheticalYear) -> Result<String, RepositoryError> {
        let mut tables = self.tables()?;
        let sequence = tables.sequences.entry(year.start_year).or_insert(0);
        *sequence += 1;
        Ok(format!("CAT-{}-{:06}", year.start_year, sequence))
    }

    fn insert_enrollment(
        &self,
        enrollment: PendingEnrollment,
    ) -> Result<PendingEnrollment, RepositoryError> {
        let mut tables = self.tables()?;
        if tables.enrollments.contains_key(&enrollment.id) {
            return Err(RepositoryError::Conflict);
        }
        tables
            .enrollments
            .insert(enrollment.id.clone(), enrollment.clone());
        Ok(enrollment)
    }

    fn update_enrollment(&self, enrollment: PendingEnrollment) -> Result<(), RepositoryError> {
        let mut tables = self.tables()?;
        match tables.enrollments.get_mut(&enrollment.id) {
            Some(existing) => {
                *existing = enrollment;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    fn fetch_enrollment(
        &self,
        id: &EnrollmentId,
    ) -> Result<Option<PendingEnrollment>, RepositoryError> {
        Ok(self.tables()?.enrollments.get(id).cloned())
    }

    fn find_duplicate(
        &self,
        identity_key: &str,
        year: CatecheticalYear,
    ) -> Result<Option<PendingEnrollment>, RepositoryError> {
        let tables = self.tables()?;
        Ok(tables
            .enrollments
            .values()
            .find(|enrollment| {
                enrollment.catechetical_year == year
                    && enrollment.status != EnrollmentStatus::Cancelled
                    && enrollment.child.identity_key() == identity_key
            })
            .cloned())
    }

    fn save_document(&self, document: Document) -> Result<(), RepositoryError> {
        self.tables()?
            .documents
            .insert(document.id.clone(), document);
        Ok(())
    }

    fn fetch_document(&self, id: &DocumentId) -> Result<Option<Document>, RepositoryError> {
        Ok(self.tables()?.documents.get(id).cloned())
    }

    fn insert_payment(&self, payment: Payment) -> Result<Payment, RepositoryError> {
        let mut tables = self.tables()?;
        if tables.payments.contains_key(&payment.id) {
            return Err(RepositoryError::Conflict);
        }
        tables.payments.insert(payment.id.clone(), payment.clone());
        Ok(payment)
    }

    fn update_payment_if(
        &self,
        payment: Payment,
        expected: PaymentStatus,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables()?;
        let existing = tables
            .payments
            .get_mut(&payment.id)
            .ok_or(RepositoryError::NotFound)?;
        if existing.status != expected {
            return Err(RepositoryError::StatusChanged {
                expected: expected.label(),
                found: existing.status.label(),
            });
        }
        *existing = payment;
        Ok(())
    }

    fn fetch_payment(&self, id: &PaymentId) -> Result<Option<Payment>, RepositoryError> {
        Ok(self.tables()?.payments.get(id).cloned())
    }

    fn payments_by_reference(&self, reference: &str) -> Result<Vec<Payment>, RepositoryError> {
        let reference = normalize_reference(reference);
        let tables = self.tables()?;
        Ok(tables
            .payments
            .values()
            .filter(|payment| payment.reference == reference)
            .cloned()
            .collect())
    }

    fn payments_for_enrollment(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<Vec<Payment>, RepositoryError> {
        let tables = self.tables()?;
        let mut payments: Vec<Payment> = tables
            .payments
            .values()
            .filter(|payment| &payment.enrollment_id == enrollment_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(payments)
    }

    fn unresolved_payments(&self) -> Result<Vec<Payment>, RepositoryError> {
        let tables = self.tables()?;
        Ok(tables
            .payments
            .values()
            .filter(|payment| payment.status.is_unresolved())
            .cloned()
            .collect())
    }

    fn insert_validation(
        &self,
        validation: PaymentValidation,
    ) -> Result<PaymentValidation, RepositoryError> {
        let mut tables = self.tables()?;
        if tables.validations.contains_key(&validation.id) {
            return Err(RepositoryError::Conflict);
        }
        tables
            .validations
            .insert(validation.id.clone(), validation.clone());
        Ok(validation)
    }

    fn update_validation_if(
        &self,
        validation: PaymentValidation,
        expected: ValidationStatus,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables()?;
        let existing = tables
            .validations
            .get_mut(&validation.id)
            .ok_or(RepositoryError::NotFound)?;
        if existing.status != expected {
            return Err(RepositoryError::StatusChanged {
                expected: expected.label(),
                found: existing.status.label(),
            });
        }
        *existing = validation;
        Ok(())
    }

    fn fetch_validation(
        &self,
        id: &ValidationId,
    ) -> Result<Option<PaymentValidation>, RepositoryError> {
        Ok(self.tables()?.validations.get(id).cloned())
    }

    fn validation_for_payment(
        &self,
        payment_id: &PaymentId,
    ) -> Result<Option<PaymentValidation>, RepositoryError> {
        let tables = self.tables()?;
        Ok(tables
            .validations
            .values()
            .find(|validation| &validation.payment_id == payment_id)
            .cloned())
    }

    fn pending_validations(&self, limit: usize) -> Result<Vec<PaymentValidation>, RepositoryError> {
        let tables = self.tables()?;
        let mut pending: Vec<PaymentValidation> = tables
            .validations
            .values()
            .filter(|validation| !validation.status.is_resolved())
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }
}

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recipient {
    /// The parent, reached back on the channel the conversation started on.
    Submitter { user_id: UserId, channel: Channel },
    Reviewer { reviewer_id: ReviewerId },
    /// Parish staff watching escalated conversations.
    Operators,
}

/// Outbound message payload so routes and tests can assert integration boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub template: String,
    pub message: String,
    pub details: BTreeMap<String, String>,
}

impl Notification {
    pub fn new(recipient: Recipient, template: &str, message: impl Into<String>) -> Self {
        Self {
            recipient,
            template: template.to_string(),
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

/// Messaging collaborator (WhatsApp/Telegram adapters, staff alerts).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
}

/// Deliver `notification`, logging instead of failing the caller.
pub(crate) async fn notify_quietly(notifier: &dyn Notifier, notification: Notification) {
    let template = notification.template.clone();
    if let Err(err) = notifier.notify(notification).await {
        tracing::warn!(%template, error = %err, "notification not delivered");
    }
}

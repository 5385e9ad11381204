//! Conversational catechism enrollment: eligibility checks, document extraction, payment proof
//! intake and the treasurer validation desk, driven by a per-user step machine.

pub mod domain;
pub mod eligibility;
pub mod extraction;
pub mod intent;
pub mod machine;
pub mod payment;
pub mod prompts;
pub mod repository;
pub mod router;
pub mod service;
pub mod session;
pub mod sweeper;

#[cfg(test)]
mod tests;

pub use domain::{
    CatecheticalYear, Channel, ChildInfo, ClassLevel, Document, DocumentFormat, DocumentId,
    DocumentKind, DocumentStatus, EnrollmentId, EnrollmentStatus, ParentInfo, Payment, PaymentId,
    PaymentStatus, PaymentValidation, PendingEnrollment, ReviewerId, UserId, ValidationId,
    ValidationStatus, WorkflowId,
};
pub use eligibility::{ClassSuggestion, EligibilityResolver};
pub use extraction::{DocumentExtractor, ExtractionResult, OcrEngine, OcrError, OcrToken};
pub use intent::{Intent, IntentClassifier, KeywordClassifier};
pub use machine::{Step, StepEvent};
pub use payment::provider::Provider;
pub use payment::treasurer::{RoundRobinTreasurerQueue, TreasurerAction, TreasurerQueue};
pub use payment::{GatewayError, PaymentGateway, PaymentSettings};
pub use repository::{
    EnrollmentRepository, InMemoryEnrollmentRepository, Notification, Notifier, NotifyError,
    Recipient, RepositoryError,
};
pub use router::enrollment_router;
pub use service::{
    Clock, EnrollmentWorkflowService, MaintenanceReport, SystemClock, UserInput,
    WorkflowCollaborators, WorkflowError, WorkflowReply,
};
pub use session::{InMemorySessionStore, SessionStore, WorkflowSession};
pub use sweeper::spawn_sweeper;

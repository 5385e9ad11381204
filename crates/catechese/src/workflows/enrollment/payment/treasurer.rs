use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::workflows::enrollment::domain::{
    EnrollmentStatus, PaymentStatus, PaymentValidation, ReviewerId, ValidationStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreasurerAction {
    Approve,
    Reject,
    RequestInfo,
    Escalate,
}

impl TreasurerAction {
    pub const ALL: [TreasurerAction; 4] = [
        TreasurerAction::Approve,
        TreasurerAction::Reject,
        TreasurerAction::RequestInfo,
        TreasurerAction::Escalate,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            TreasurerAction::Approve => "approve",
            TreasurerAction::Reject => "reject",
            TreasurerAction::RequestInfo => "request_info",
            TreasurerAction::Escalate => "escalate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|action| action.label().eq_ignore_ascii_case(value.trim()))
    }
}

/// Status changes a decision applies. `None` leaves the record as it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionPlan {
    pub validation: ValidationStatus,
    pub payment: Option<PaymentStatus>,
    pub enrollment: Option<EnrollmentStatus>,
    pub escalate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecisionError {
    #[error("validation already {}", .0.label())]
    AlreadyResolved(ValidationStatus),
    #[error("validation moved to {} while the decision was made", .0.label())]
    Changed(ValidationStatus),
}

/// Target statuses for `action` applied to a validation currently in `current`.
///
/// Approved and rejected validations are final; every other state accepts all four actions.
pub fn plan_decision(
    current: ValidationStatus,
    action: TreasurerAction,
) -> Result<DecisionPlan, DecisionError> {
    if current.is_resolved() {
        return Err(DecisionError::AlreadyResolved(current));
    }

    let plan = match action {
        TreasurerAction::Approve => DecisionPlan {
            validation: ValidationStatus::Approved,
            payment: Some(PaymentStatus::Validated),
            enrollment: Some(EnrollmentStatus::Active),
            escalate: false,
        },
        TreasurerAction::Reject => DecisionPlan {
            validation: ValidationStatus::Rejected,
            payment: Some(PaymentStatus::Rejected),
            enrollment: None,
            escalate: false,
        },
        TreasurerAction::RequestInfo => DecisionPlan {
            validation: ValidationStatus::NeedsInfo,
            payment: Some(PaymentStatus::Processing),
            enrollment: None,
            escalate: false,
        },
        TreasurerAction::Escalate => DecisionPlan {
            validation: ValidationStatus::Escalated,
            payment: None,
            enrollment: None,
            escalate: true,
        },
    };
    Ok(plan)
}

/// Staffing collaborator choosing who reviews a payment proof.
pub trait TreasurerQueue: Send + Sync {
    fn assign(&self, validation: &PaymentValidation) -> Result<ReviewerId, QueueError>;
    /// A reviewer other than `current`, if the desk has one.
    fn reassign(
        &self,
        validation: &PaymentValidation,
        current: Option<&ReviewerId>,
    ) -> Result<Option<ReviewerId>, QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("no treasurer is configured")]
    NoReviewers,
    #[error("treasurer queue unavailable: {0}")]
    Unavailable(String),
}

/// Hands validations to the configured treasurers in turn.
#[derive(Debug, Default)]
pub struct RoundRobinTreasurerQueue {
    reviewers: Vec<ReviewerId>,
    cursor: AtomicUsize,
}

impl RoundRobinTreasurerQueue {
    pub fn new(reviewers: Vec<ReviewerId>) -> Self {
        Self {
            reviewers,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn from_ids<S: AsRef<str>>(ids: &[S]) -> Self {
        Self::new(ids.iter().map(|id| ReviewerId::from(id.as_ref())).collect())
    }

    pub fn reviewers(&self) -> &[ReviewerId] {
        &self.reviewers
    }
}

impl TreasurerQueue for RoundRobinTreasurerQueue {
    fn assign(&self, _validation: &PaymentValidation) -> Result<ReviewerId, QueueError> {
        if self.reviewers.is_empty() {
            return Err(QueueError::NoReviewers);
        }
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.reviewers.len();
        Ok(self.reviewers[slot].clone())
    }

    fn reassign(
        &self,
        _validation: &PaymentValidation,
        current: Option<&ReviewerId>,
    ) -> Result<Option<ReviewerId>, QueueError> {
        if self.reviewers.is_empty() {
            return Err(QueueError::NoReviewers);
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let len = self.reviewers.len();
        Ok((0..len)
            .map(|offset| &self.reviewers[(start + offset) % len])
            .find(|candidate| Some(*candidate) != current)
            .cloned())
    }
}

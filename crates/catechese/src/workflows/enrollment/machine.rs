//! Conversation steps and the pure transition table between them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    InitialChoice,
    ReenrollmentSelect,
    ReenrollmentConfirm,
    AgeVerification,
    ClassSelection,
    ParentInfo,
    ChildInfo,
    ConfirmData,
    YearSelection,
    PaymentProof,
    TreasurerValidation,
    Completed,
    PendingHuman,
}

impl Step {
    pub const ALL: [Step; 13] = [
        Step::InitialChoice,
        Step::ReenrollmentSelect,
        Step::ReenrollmentConfirm,
        Step::AgeVerification,
        Step::ClassSelection,
        Step::ParentInfo,
        Step::ChildInfo,
        Step::ConfirmData,
        Step::YearSelection,
        Step::PaymentProof,
        Step::TreasurerValidation,
        Step::Completed,
        Step::PendingHuman,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            Step::InitialChoice => "INITIAL_CHOICE",
            Step::ReenrollmentSelect => "REENROLLMENT_SELECT",
            Step::ReenrollmentConfirm => "REENROLLMENT_CONFIRM",
            Step::AgeVerification => "AGE_VERIFICATION",
            Step::ClassSelection => "CLASS_SELECTION",
            Step::ParentInfo => "PARENT_INFO",
            Step::ChildInfo => "CHILD_INFO",
            Step::ConfirmData => "CONFIRM_DATA",
            Step::YearSelection => "YEAR_SELECTION",
            Step::PaymentProof => "PAYMENT_PROOF",
            Step::TreasurerValidation => "TREASURER_VALIDATION",
            Step::Completed => "COMPLETED",
            Step::PendingHuman => "PENDING_HUMAN",
        }
    }

    /// Steps that wait on people outside the conversation. Idle purging skips them.
    pub const fn is_parked(self) -> bool {
        matches!(self, Step::TreasurerValidation | Step::PendingHuman)
    }

    /// No automatic transition leaves these steps.
    pub const fn is_final(self) -> bool {
        matches!(self, Step::Completed | Step::PendingHuman)
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// What happened at a step, as decided by the step handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEvent {
    ChoseNewEnrollment,
    ChoseReenrollment,
    ChildSelected,
    SuggestionAccepted,
    SuggestionChanged,
    AgeVerified,
    ClassChosen,
    ParentCaptured,
    ChildCaptured,
    DataConfirmed,
    YearChosen,
    PaymentSubmitted,
    PaymentApproved,
    /// Same step again: invalid input, or a message while waiting.
    Reprompt,
    /// Hand the conversation to a human.
    Escalate,
    /// Operator clears the conversation.
    OperatorReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no transition from {from} on {event:?}")]
pub struct TransitionError {
    pub from: Step,
    pub event: StepEvent,
}

/// Next step for `event` at `from`. Pairs outside the table are errors, never a guess.
pub fn transition(from: Step, event: StepEvent) -> Result<Step, TransitionError> {
    use Step::*;
    use StepEvent::*;

    let to = match (from, event) {
        (step, Reprompt) => step,
        (_, OperatorReset) => InitialChoice,
        (step, Escalate) if !step.is_final() => PendingHuman,

        (InitialChoice, ChoseReenrollment) => ReenrollmentSelect,
        (InitialChoice, ChoseNewEnrollment) => AgeVerification,
        (ReenrollmentSelect, ChildSelected) => ReenrollmentConfirm,
        (ReenrollmentConfirm, SuggestionAccepted) => PaymentProof,
        (ReenrollmentConfirm, SuggestionChanged) => ClassSelection,
        (AgeVerification, AgeVerified) => ClassSelection,
        (ClassSelection, ClassChosen) => ParentInfo,
        (ParentInfo, ParentCaptured) => ChildInfo,
        (ChildInfo, ChildCaptured) => ConfirmData,
        (ConfirmData, DataConfirmed) => YearSelection,
        (YearSelection, YearChosen) => PaymentProof,
        (PaymentProof, PaymentSubmitted) => TreasurerValidation,
        (TreasurerValidation, PaymentApproved) => Completed,

        _ => return Err(TransitionError { from, event }),
    };
    Ok(to)
}

/// The successor on the happy path, when the step has exactly one.
pub fn happy_path_successor(step: Step) -> Option<Step> {
    match step {
        Step::InitialChoice => None,
        Step::ReenrollmentSelect => Some(Step::ReenrollmentConfirm),
        Step::ReenrollmentConfirm => Some(Step::PaymentProof),
        Step::AgeVerification => Some(Step::ClassSelection),
        Step::ClassSelection => Some(Step::ParentInfo),
        Step::ParentInfo => Some(Step::ChildInfo),
        Step::ChildInfo => Some(Step::ConfirmData),
        Step::ConfirmData => Some(Step::YearSelection),
        Step::YearSelection => Some(Step::PaymentProof),
        Step::PaymentProof => Some(Step::TreasurerValidation),
        Step::TreasurerValidation => Some(Step::Completed),
        Step::Completed | Step::PendingHuman => None,
    }
}

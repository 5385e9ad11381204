use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::response::Response;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use crate::config::EnrollmentConfig;
use crate::workflows::enrollment::domain::{Channel, ClassLevel, DocumentFormat, UserId};
use crate::workflows::enrollment::extraction::{
    DocumentExtractor, ImagePreprocessor, OcrEngine, OcrError, OcrToken, PreprocessingPreset,
};
use crate::workflows::enrollment::payment::treasurer::RoundRobinTreasurerQueue;
use crate::workflows::enrollment::payment::{PaymentGateway, PaymentSettings};
use crate::workflows::enrollment::repository::{
    InMemoryEnrollmentRepository, Notification, Notifier, NotifyError, Recipient,
};
use crate::workflows::enrollment::service::{
    Clock, EnrollmentWorkflowService, UserInput, WorkflowCollaborators, WorkflowReply,
};
use crate::workflows::enrollment::session::InMemorySessionStore;
use crate::workflows::legacy::{InMemoryLegacyDirectory, LegacyCatechumen, LegacyParent};

pub(super) const LEGACY_PHONE: &str = "+226 70 11 22 33";
pub(super) const PAUL_CERTIFICATE: &str =
    "ACTE DE NAISSANCE N° 1234\nNom : OUEDRAOGO\nPrénoms : Paul Joseph\nNé le 12/03/2016 à Ouagadougou";
pub(super) const ORANGE_RECEIPT: &str = "Orange Money\nTransfert effectué\nMontant : 10 000 FCFA\nRéf : OM 123456789\nTél : +226 70 11 22 33\nLe 02.09.2025 à 10:14";

/// OCR double answering from a script, one entry per call.
#[derive(Default)]
pub(super) struct ScriptedOcr {
    script: Mutex<VecDeque<Result<Vec<OcrToken>, OcrError>>>,
    calls: Mutex<usize>,
}

impl ScriptedOcr {
    pub(super) fn push_text(&self, text: &str, confidence: f32) {
        let tokens = text
            .lines()
            .map(|line| OcrToken::new(line, confidence))
            .collect();
        self.script
            .lock()
            .expect("ocr script mutex poisoned")
            .push_back(Ok(tokens));
    }

    pub(super) fn push_error(&self, error: OcrError) {
        self.script
            .lock()
            .expect("ocr script mutex poisoned")
            .push_back(Err(error));
    }

    pub(super) fn calls(&self) -> usize {
        *self.calls.lock().expect("ocr calls mutex poisoned")
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcr {
    async fn recognize(&self, _image: &[u8]) -> Result<Vec<OcrToken>, OcrError> {
        *self.calls.lock().expect("ocr calls mutex poisoned") += 1;
        self.script
            .lock()
            .expect("ocr script mutex poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(OcrError::Unavailable("script exhausted".to_string())))
    }
}

/// Passes images through untouched and remembers which preset each call asked for.
#[derive(Default)]
pub(super) struct RecordingPreprocessor {
    presets: Mutex<Vec<PreprocessingPreset>>,
}

impl RecordingPreprocessor {
    pub(super) fn presets(&self) -> Vec<PreprocessingPreset> {
        self.presets.lock().expect("preset mutex poisoned").clone()
    }
}

impl ImagePreprocessor for RecordingPreprocessor {
    fn prepare(&self, image: &[u8], preset: PreprocessingPreset) -> Result<Vec<u8>, OcrError> {
        self.presets
            .lock()
            .expect("preset mutex poisoned")
            .push(preset);
        Ok(image.to_vec())
    }
}

#[derive(Default)]
pub(super) struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub(super) fn sent(&self) -> Vec<Notification> {
        self.sent.lock().expect("notifier mutex poisoned").clone()
    }

    pub(super) fn templates(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|notification| notification.template)
            .collect()
    }

    pub(super) fn to_operators(&self) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|notification| notification.recipient == Recipient::Operators)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .expect("notifier mutex poisoned")
            .push(notification);
        Ok(())
    }
}

pub(super) struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _notification: Notification) -> Result<(), NotifyError> {
        Err(NotifyError::Transport("gateway down".to_string()))
    }
}

pub(super) struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub(super) fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub(super) fn advance(&self, by: Duration) {
        *self.now.lock().expect("clock mutex poisoned") += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

pub(super) fn start_of_school_year() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 15, 9, 0, 0)
        .single()
        .expect("valid instant")
}

pub(super) fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub(super) fn legacy_directory() -> InMemoryLegacyDirectory {
    let directory = InMemoryLegacyDirectory::default();
    directory.insert_parent(LegacyParent {
        code: "P001".to_string(),
        last_name: "KABORE".to_string(),
        first_name: "Jean".to_string(),
        phone: "22670112233".to_string(),
    });
    directory.insert_catechumen(LegacyCatechumen {
        code: "C001".to_string(),
        parent_code: "P001".to_string(),
        last_name: "KABORE".to_string(),
        first_names: "Paul".to_string(),
        birth_date: Some(date(2016, 3, 12)),
        birth_year: Some(2016),
        last_level: Some(ClassLevel::Ce1),
    });
    directory.insert_catechumen(LegacyCatechumen {
        code: "C002".to_string(),
        parent_code: "P001".to_string(),
        last_name: "KABORE".to_string(),
        first_names: "Awa".to_string(),
        birth_date: None,
        birth_year: Some(2012),
        last_level: Some(ClassLevel::Cm2),
    });
    directory
}

pub(super) struct Harness {
    pub(super) service: Arc<EnrollmentWorkflowService>,
    pub(super) repository: Arc<InMemoryEnrollmentRepository>,
    pub(super) sessions: Arc<InMemorySessionStore>,
    pub(super) ocr: Arc<ScriptedOcr>,
    pub(super) preprocessor: Arc<RecordingPreprocessor>,
    pub(super) notifier: Arc<RecordingNotifier>,
    pub(super) clock: Arc<FixedClock>,
}

pub(super) fn harness() -> Harness {
    harness_with(EnrollmentConfig::default())
}

pub(super) fn harness_with(config: EnrollmentConfig) -> Harness {
    harness_customized(config, |service| service)
}

pub(super) fn harness_customized(
    config: EnrollmentConfig,
    customize: impl FnOnce(EnrollmentWorkflowService) -> EnrollmentWorkflowService,
) -> Harness {
    let repository = Arc::new(InMemoryEnrollmentRepository::default());
    let sessions = Arc::new(InMemorySessionStore::default());
    let ocr = Arc::new(ScriptedOcr::default());
    let preprocessor = Arc::new(RecordingPreprocessor::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let clock = Arc::new(FixedClock::at(start_of_school_year()));

    let extractor = Arc::new(
        DocumentExtractor::new(ocr.clone(), config.ocr_acceptance_threshold)
            .with_preprocessor(preprocessor.clone())
            .with_concurrency(config.ocr_max_concurrency),
    );
    let gateway = Arc::new(PaymentGateway::new(
        repository.clone(),
        extractor.clone(),
        Arc::new(RoundRobinTreasurerQueue::from_ids(&config.treasurers)),
        notifier.clone(),
        PaymentSettings::from_config(&config),
    ));
    let collaborators = WorkflowCollaborators {
        sessions: sessions.clone(),
        repository: repository.clone(),
        legacy: Arc::new(legacy_directory()),
        extractor,
        gateway,
        notifier: notifier.clone(),
    };
    let service =
        customize(EnrollmentWorkflowService::new(collaborators, &config).with_clock(clock.clone()));

    Harness {
        service: Arc::new(service),
        repository,
        sessions,
        ocr,
        preprocessor,
        notifier,
        clock,
    }
}

pub(super) fn user(id: &str) -> UserId {
    UserId::from(id)
}

pub(super) fn image() -> Vec<u8> {
    vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10]
}

impl Harness {
    pub(super) async fn start(&self, user_id: &UserId, phone: &str) -> WorkflowReply {
        self.service
            .start_workflow(user_id, phone, Channel::Whatsapp)
            .await
            .expect("workflow starts")
    }

    pub(super) async fn say(&self, user_id: &UserId, text: &str) -> WorkflowReply {
        self.service
            .process_input(user_id, UserInput::text(text))
            .await
            .expect("message processed")
    }

    pub(super) async fn upload(&self, user_id: &UserId) -> WorkflowReply {
        self.service
            .process_input(user_id, UserInput::attachment(image(), DocumentFormat::Jpeg))
            .await
            .expect("attachment processed")
    }

    /// Drive a new enrollment of Paul OUEDRAOGO up to the year choice.
    pub(super) async fn new_enrollment_until_year(&self, user_id: &UserId) -> WorkflowReply {
        self.start(user_id, "+226 76 00 00 01").await;
        self.say(user_id, "1").await;
        self.ocr.push_text(PAUL_CERTIFICATE, 0.95);
        self.upload(user_id).await;
        self.say(user_id, "1").await;
        self.say(user_id, "OUEDRAOGO; Mariam; 76 00 00 01").await;
        self.say(user_id, "OK").await;
        self.say(user_id, "oui").await
    }

    /// Same as [`Self::new_enrollment_until_year`], then picks the current year.
    pub(super) async fn new_enrollment_until_payment(&self, user_id: &UserId) -> WorkflowReply {
        self.new_enrollment_until_year(user_id).await;
        self.say(user_id, "1").await
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}

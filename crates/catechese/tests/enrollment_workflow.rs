//! End-to-end conversations driven through the public service facade and the HTTP router, with
//! the historical register loaded from its CSV export.

mod common {
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use axum::Router;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::Value;
    use tower::ServiceExt;

    use catechese::config::EnrollmentConfig;
    use catechese::workflows::enrollment::{
        enrollment_router, Clock, DocumentExtractor, EnrollmentWorkflowService,
        InMemoryEnrollmentRepository, InMemorySessionStore, Notification, Notifier, NotifyError,
        OcrEngine, OcrError, OcrToken, PaymentGateway, PaymentSettings, RoundRobinTreasurerQueue,
        WorkflowCollaborators,
    };
    use catechese::workflows::legacy::LegacyImporter;

    pub(super) const REGISTER: &str = "Code Parent,Nom Parent,Prenom Parent,Telephone,Code Enfant,Nom,Prenoms,Date Naissance,Annee Naissance,Niveau\n\
P014,ZONGO,Rasmata,+226 70 45 67 89,E031,ZONGO,Ines,12/03/2016,,2eme annee\n\
P014,ZONGO,Rasmata,70456789,E032,ZONGO,Marc,,2019,Eveil a la foi\n";

    pub(super) const CERTIFICATE: &str =
        "ACTE DE NAISSANCE\nNom : TRAORE\nPrénoms : Alice\nNé le 05/06/2017 à Koudougou";

    #[derive(Default)]
    pub(super) struct QueuedOcr {
        pages: Mutex<VecDeque<Vec<OcrToken>>>,
    }

    impl QueuedOcr {
        pub(super) fn push(&self, text: &str, confidence: f32) {
            let tokens = text
                .lines()
                .map(|line| OcrToken::new(line, confidence))
                .collect();
            self.pages
                .lock()
                .expect("ocr mutex poisoned")
                .push_back(tokens);
        }
    }

    #[async_trait]
    impl OcrEngine for QueuedOcr {
        async fn recognize(&self, _image: &[u8]) -> Result<Vec<OcrToken>, OcrError> {
            self.pages
                .lock()
                .expect("ocr mutex poisoned")
                .pop_front()
                .ok_or_else(|| OcrError::Unavailable("no page queued".to_string()))
        }
    }

    #[derive(Default)]
    pub(super) struct Outbox {
        sent: Mutex<Vec<Notification>>,
    }

    impl Outbox {
        pub(super) fn templates(&self) -> Vec<String> {
            self.sent
                .lock()
                .expect("outbox mutex poisoned")
                .iter()
                .map(|notification| notification.template.clone())
                .collect()
        }

        pub(super) fn all(&self) -> Vec<Notification> {
            self.sent.lock().expect("outbox mutex poisoned").clone()
        }
    }

    #[async_trait]
    impl Notifier for Outbox {
        async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .expect("outbox mutex poisoned")
                .push(notification);
            Ok(())
        }
    }

    pub(super) struct SteppedClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl SteppedClock {
        pub(super) fn advance(&self, by: Duration) {
            *self.now.lock().expect("clock mutex poisoned") += by;
        }
    }

    impl Clock for SteppedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().expect("clock mutex poisoned")
        }
    }

    pub(super) struct Parish {
        pub(super) service: Arc<EnrollmentWorkflowService>,
        pub(super) repository: Arc<InMemoryEnrollmentRepository>,
        pub(super) ocr: Arc<QueuedOcr>,
        pub(super) outbox: Arc<Outbox>,
        pub(super) clock: Arc<SteppedClock>,
    }

    impl Parish {
        pub(super) fn router(&self) -> Router {
            enrollment_router(self.service.clone())
        }
    }

    pub(super) fn parish() -> Parish {
        let config = EnrollmentConfig {
            treasurers: vec!["tresorier-1".to_string(), "tresorier-2".to_string()],
            ..EnrollmentConfig::default()
        };
        let legacy = LegacyImporter::from_reader(Cursor::new(REGISTER)).expect("register loads");
        let repository = Arc::new(InMemoryEnrollmentRepository::default());
        let ocr = Arc::new(QueuedOcr::default());
        let outbox = Arc::new(Outbox::default());
        let clock = Arc::new(SteppedClock {
            now: Mutex::new(
                Utc.with_ymd_and_hms(2025, 9, 20, 8, 30, 0)
                    .single()
                    .expect("valid instant"),
            ),
        });

        let extractor = Arc::new(
            DocumentExtractor::new(ocr.clone(), config.ocr_acceptance_threshold)
                .with_concurrency(config.ocr_max_concurrency),
        );
        let gateway = Arc::new(PaymentGateway::new(
            repository.clone(),
            extractor.clone(),
            Arc::new(RoundRobinTreasurerQueue::from_ids(&config.treasurers)),
            outbox.clone(),
            PaymentSettings::from_config(&config),
        ));
        let collaborators = WorkflowCollaborators {
            sessions: Arc::new(InMemorySessionStore::default()),
            repository: repository.clone(),
            legacy: Arc::new(legacy),
            extractor,
            gateway,
            notifier: outbox.clone(),
        };
        let service =
            EnrollmentWorkflowService::new(collaborators, &config).with_clock(clock.clone());

        Parish {
            service: Arc::new(service),
            repository,
            ocr,
            outbox,
            clock,
        }
    }

    pub(super) async fn send_json(
        router: &Router,
        method: Method,
        uri: &str,
        body: Value,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request builds");
        dispatch(router, request).await
    }

    pub(super) async fn send_file(router: &Router, uri: &str, bytes: Vec<u8>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "image/jpeg")
            .body(Body::from(bytes))
            .expect("request builds");
        dispatch(router, request).await
    }

    pub(super) async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request builds");
        dispatch(router, request).await
    }

    async fn dispatch(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router
            .clone()
            .oneshot(request)
            .await
            .expect("router responds");
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 256 * 1024)
            .await
            .expect("read body");
        let payload = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).expect("json payload")
        };
        (status, payload)
    }

    pub(super) fn scan() -> Vec<u8> {
        vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46]
    }
}

use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::http::{Method, StatusCode};
use chrono::Duration;
use serde_json::json;

use catechese::workflows::enrollment::{spawn_sweeper, PaymentStatus, Recipient, UserId};
use common::*;

async fn say(router: &axum::Router, user: &str, text: &str) -> serde_json::Value {
    let (status, reply) = send_json(
        router,
        Method::POST,
        &format!("/api/v1/workflows/{user}/messages"),
        json!({ "text": text }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "message {text:?} failed: {reply}");
    reply
}

#[tokio::test]
async fn returning_family_reenrolls_and_is_approved_by_the_treasurer() {
    let parish = parish();
    let router = parish.router();

    let (status, reply) = send_json(
        &router,
        Method::POST,
        "/api/v1/workflows",
        json!({ "user_id": "wa-zongo", "phone": "0022670456789", "channel": "whatsapp" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(reply["step"], "INITIAL_CHOICE");

    let reply = say(&router, "wa-zongo", "2").await;
    assert_eq!(reply["step"], "REENROLLMENT_SELECT");
    assert_eq!(reply["options"].as_array().map(Vec::len), Some(2));

    let reply = say(&router, "wa-zongo", "1").await;
    assert_eq!(reply["step"], "REENROLLMENT_CONFIRM");
    assert!(reply["message"].as_str().unwrap_or_default().contains("CM1"));

    let reply = say(&router, "wa-zongo", "oui").await;
    assert_eq!(reply["step"], "PAYMENT_PROOF");

    let reply = say(&router, "wa-zongo", "WV 5566 7788").await;
    assert_eq!(reply["step"], "TREASURER_VALIDATION");

    let (status, queue) = get(&router, "/api/v1/treasurer/validations").await;
    assert_eq!(status, StatusCode::OK);
    let queue = queue.as_array().cloned().expect("queue is a list");
    assert_eq!(queue.len(), 1);
    let validation_id = queue[0]["id"].as_str().expect("validation id").to_string();
    let reviewer = queue[0]["assigned_to"].as_str().expect("assigned").to_string();

    let (status, outcome) = send_json(
        &router,
        Method::POST,
        &format!("/api/v1/treasurer/validations/{validation_id}/decision"),
        json!({ "reviewer_id": reviewer, "action": "approve" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["enrollment"]["status"], "active");
    assert_eq!(outcome["enrollment"]["parent_id"], "P014");
    assert_eq!(outcome["payment"]["status"], "validated");

    let (status, session) = get(&router, "/api/v1/workflows/wa-zongo").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["current_step"], "COMPLETED");

    let approved = parish
        .outbox
        .all()
        .into_iter()
        .find(|notification| notification.template == "payment_approved")
        .expect("parent informed");
    assert!(matches!(
        approved.recipient,
        Recipient::Submitter { ref user_id, .. } if *user_id == UserId::from("wa-zongo")
    ));
}

#[tokio::test]
async fn new_family_enrolls_with_a_scanned_certificate() {
    let parish = parish();
    let router = parish.router();

    let (status, _) = send_json(
        &router,
        Method::POST,
        "/api/v1/workflows",
        json!({ "user_id": "tg-traore", "phone": "+226 66 12 34 56", "channel": "telegram" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let reply = say(&router, "tg-traore", "nouvelle inscription").await;
    assert_eq!(reply["step"], "AGE_VERIFICATION");

    parish.ocr.push(CERTIFICATE, 0.92);
    let (status, reply) = send_file(&router, "/api/v1/workflows/tg-traore/attachments", scan()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["step"], "CLASS_SELECTION");
    let options: Vec<String> = reply["options"]
        .as_array()
        .expect("levels offered")
        .iter()
        .filter_map(|option| option.as_str().map(str::to_string))
        .collect();
    assert!(options.contains(&"CE2".to_string()));

    say(&router, "tg-traore", "CE2").await;
    let reply = say(&router, "tg-traore", "TRAORE; Fatou; 66 12 34 56").await;
    assert_eq!(reply["step"], "CHILD_INFO");
    let reply = say(&router, "tg-traore", "OK").await;
    assert_eq!(reply["step"], "CONFIRM_DATA");
    let reply = say(&router, "tg-traore", "oui").await;
    assert_eq!(reply["step"], "YEAR_SELECTION");
    let reply = say(&router, "tg-traore", "2025-2026").await;
    assert_eq!(reply["step"], "PAYMENT_PROOF");
    let reply = say(&router, "tg-traore", "MV 9988 7766").await;
    assert_eq!(reply["step"], "TREASURER_VALIDATION");

    let enrollment = parish
        .repository
        .enrollments()
        .pop()
        .expect("enrollment opened");
    assert_eq!(enrollment.child.last_name, "TRAORE");
    assert_eq!(enrollment.child.birth_place, "Koudougou");
    assert_eq!(enrollment.amount_due, 10_000);
    assert!(parish
        .outbox
        .templates()
        .contains(&"payment_review_requested".to_string()));
}

#[tokio::test]
async fn stranger_choosing_reenrollment_is_treated_as_new() {
    let parish = parish();
    let router = parish.router();
    send_json(
        &router,
        Method::POST,
        "/api/v1/workflows",
        json!({ "user_id": "wa-new", "phone": "+226 71 00 00 00", "channel": "whatsapp" }),
    )
    .await;

    let reply = say(&router, "wa-new", "réinscription").await;
    assert_eq!(reply["step"], "AGE_VERIFICATION");
}

#[tokio::test]
async fn treasurer_rejection_then_new_proof_reaches_a_reviewer_again() {
    let parish = parish();
    let router = parish.router();
    send_json(
        &router,
        Method::POST,
        "/api/v1/workflows",
        json!({ "user_id": "wa-zongo-2", "phone": "70 45 67 89", "channel": "whatsapp" }),
    )
    .await;
    say(&router, "wa-zongo-2", "2").await;
    say(&router, "wa-zongo-2", "1").await;
    say(&router, "wa-zongo-2", "oui").await;
    say(&router, "wa-zongo-2", "OM 1111 2222").await;

    let (_, queue) = get(&router, "/api/v1/treasurer/validations").await;
    let validation_id = queue[0]["id"].as_str().expect("validation id").to_string();
    let (status, outcome) = send_json(
        &router,
        Method::POST,
        &format!("/api/v1/treasurer/validations/{validation_id}/decision"),
        json!({
            "reviewer_id": "tresorier-1",
            "action": "reject",
            "notes": "référence introuvable"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["validation"]["status"], "rejected");

    let (_, session) = get(&router, "/api/v1/workflows/wa-zongo-2").await;
    assert_eq!(session["current_step"], "TREASURER_VALIDATION");

    let reply = say(&router, "wa-zongo-2", "OM 3333 4444").await;
    assert_eq!(reply["step"], "TREASURER_VALIDATION");
    let (_, queue) = get(&router, "/api/v1/treasurer/validations").await;
    assert_eq!(queue.as_array().map(Vec::len), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sweeper_expires_payments_nobody_reviewed() {
    let parish = parish();
    let router = parish.router();
    send_json(
        &router,
        Method::POST,
        "/api/v1/workflows",
        json!({ "user_id": "wa-zongo-3", "phone": "+22670456789", "channel": "whatsapp" }),
    )
    .await;
    say(&router, "wa-zongo-3", "2").await;
    say(&router, "wa-zongo-3", "1").await;
    say(&router, "wa-zongo-3", "oui").await;
    say(&router, "wa-zongo-3", "OM 5555 6666").await;

    parish.clock.advance(Duration::hours(30));
    let sweeper = spawn_sweeper(Arc::clone(&parish.service), StdDuration::from_secs(1));

    let mut expired = false;
    for _ in 0..40 {
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        if parish
            .repository
            .payments()
            .iter()
            .any(|payment| payment.status == PaymentStatus::Expired)
        {
            expired = true;
            break;
        }
    }
    sweeper.abort();

    assert!(expired, "sweeper should expire the overdue payment");
    assert!(parish
        .outbox
        .templates()
        .contains(&"payment_expired".to_string()));
}

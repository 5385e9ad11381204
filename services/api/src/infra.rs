use async_trait::async_trait;
use catechese::config::EnrollmentConfig;
use catechese::error::AppError;
use catechese::workflows::enrollment::{
    DocumentExtractor, EnrollmentRepository, EnrollmentWorkflowService,
    InMemoryEnrollmentRepository, InMemorySessionStore, Notification, Notifier, NotifyError,
    OcrEngine, OcrError, OcrToken, PaymentGateway, PaymentSettings, Recipient,
    RoundRobinTreasurerQueue, WorkflowCollaborators,
};
use catechese::workflows::legacy::{InMemoryLegacyDirectory, LegacyDirectory, LegacyImporter};
use chrono::NaiveDate;
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Writes outbound messages to the log until a chat gateway is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let recipient = match &notification.recipient {
            Recipient::Submitter { user_id, channel } => format!("{}:{}", channel.label(), user_id),
            Recipient::Reviewer { reviewer_id } => format!("treasurer:{reviewer_id}"),
            Recipient::Operators => "operators".to_string(),
        };
        tracing::info!(
            %recipient,
            template = %notification.template,
            message = %notification.message,
            "outbound notification"
        );
        Ok(())
    }
}

/// Stand-in used when no recognition backend is configured: every document goes to an operator.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct UnconfiguredOcrEngine;

#[async_trait]
impl OcrEngine for UnconfiguredOcrEngine {
    async fn recognize(&self, _image: &[u8]) -> Result<Vec<OcrToken>, OcrError> {
        Err(OcrError::Unavailable("no OCR backend configured".to_string()))
    }
}

pub(crate) fn load_legacy_directory(
    path: Option<&Path>,
) -> Result<InMemoryLegacyDirectory, AppError> {
    match path {
        Some(path) => Ok(LegacyImporter::from_path(path)?),
        None => {
            tracing::warn!("LEGACY_CSV_PATH not set; re-enrollments will start as new enrollments");
            Ok(InMemoryLegacyDirectory::default())
        }
    }
}

pub(crate) fn build_service(
    config: &EnrollmentConfig,
    legacy: Arc<dyn LegacyDirectory>,
    ocr: Arc<dyn OcrEngine>,
    notifier: Arc<dyn Notifier>,
) -> EnrollmentWorkflowService {
    let repository: Arc<dyn EnrollmentRepository> =
        Arc::new(InMemoryEnrollmentRepository::default());
    let extractor = Arc::new(
        DocumentExtractor::new(ocr, config.ocr_acceptance_threshold)
            .with_concurrency(config.ocr_max_concurrency),
    );
    let gateway = Arc::new(PaymentGateway::new(
        repository.clone(),
        extractor.clone(),
        Arc::new(RoundRobinTreasurerQueue::from_ids(&config.treasurers)),
        notifier.clone(),
        PaymentSettings::from_config(config),
    ));
    let collaborators = WorkflowCollaborators {
        sessions: Arc::new(InMemorySessionStore::default()),
        repository,
        legacy,
        extractor,
        gateway,
        notifier,
    };
    EnrollmentWorkflowService::new(collaborators, config)
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_date_reports_the_offending_value() {
        assert_eq!(
            parse_date(" 2025-09-15 "),
            Ok(NaiveDate::from_ymd_opt(2025, 9, 15).expect("valid date"))
        );
        let err = parse_date("15/09/2025").expect_err("not ISO");
        assert!(err.contains("15/09/2025"));
    }

    #[test]
    fn missing_register_path_yields_an_empty_directory() {
        let directory = load_legacy_directory(None).expect("empty directory");
        assert_eq!(directory.parent_count(), 0);
    }

    #[test]
    fn unreadable_register_is_an_error() {
        let result = load_legacy_directory(Some(Path::new("./no-such-register.csv")));
        assert!(matches!(result, Err(AppError::LegacyImport(_))));
    }

    #[tokio::test]
    async fn unconfigured_ocr_is_unavailable() {
        let result = UnconfiguredOcrEngine.recognize(&[0xFF, 0xD8]).await;
        assert!(matches!(result, Err(OcrError::Unavailable(_))));
    }
}

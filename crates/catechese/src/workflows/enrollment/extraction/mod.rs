//! Document extraction: preprocessing preset, OCR, kind-specific field patterns and the
//! confidence gate consumed by the conversation steps.

mod patterns;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::domain::{Document, DocumentKind, DocumentStatus, Extraction};

pub(crate) use patterns::parse_loose_date;

pub const DEFAULT_ACCEPTANCE_THRESHOLD: f32 = 0.70;
/// Tokens below this confidence do not count as valid.
pub const TOKEN_CONFIDENCE_FLOOR: f32 = 0.5;
const DEFAULT_CONCURRENCY: usize = 4;

/// One recognized text fragment. Engines emit one token per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrToken {
    pub text: String,
    pub confidence: f32,
}

impl OcrToken {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Text recognition capability. Implementations may call out to a remote service.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> Result<Vec<OcrToken>, OcrError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OcrError {
    #[error("ocr engine unavailable: {0}")]
    Unavailable(String),
    #[error("image could not be read: {0}")]
    UnreadableImage(String),
}

/// Image clean-up applied before recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessingPreset {
    pub grayscale: bool,
    pub deskew: bool,
    pub denoise: bool,
    pub adaptive_threshold: bool,
    pub sharpen: bool,
}

impl PreprocessingPreset {
    /// Certificates are scanned paper and favor thresholding; receipts are phone screenshots or
    /// photos and favor denoising.
    pub const fn for_kind(kind: DocumentKind) -> Self {
        match kind {
            DocumentKind::PaymentReceipt => Self {
                grayscale: true,
                deskew: false,
                denoise: true,
                adaptive_threshold: false,
                sharpen: true,
            },
            _ => Self {
                grayscale: true,
                deskew: true,
                denoise: false,
                adaptive_threshold: true,
                sharpen: false,
            },
        }
    }
}

/// CPU-bound image preparation, run on the blocking pool.
pub trait ImagePreprocessor: Send + Sync {
    fn prepare(&self, image: &[u8], preset: PreprocessingPreset) -> Result<Vec<u8>, OcrError>;
}

/// Hands the image to the engine untouched. Used when the engine preprocesses on its side.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughPreprocessor;

impl ImagePreprocessor for PassthroughPreprocessor {
    fn prepare(&self, image: &[u8], _preset: PreprocessingPreset) -> Result<Vec<u8>, OcrError> {
        if image.is_empty() {
            return Err(OcrError::UnreadableImage("empty upload".to_string()));
        }
        Ok(image.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub kind: DocumentKind,
    pub fields: BTreeMap<String, String>,
    pub field_confidence: BTreeMap<String, f32>,
    pub overall_confidence: f32,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractionResult {
    fn failed(kind: DocumentKind, error: String) -> Self {
        let empty = patterns::extract_fields(kind, "");
        Self {
            kind,
            fields: empty.fields,
            field_confidence: empty.field_confidence,
            overall_confidence: 0.0,
            status: DocumentStatus::Failed,
            error: Some(error),
        }
    }

    /// Result view of a document that was already processed.
    pub fn from_document(document: &Document) -> Self {
        let extraction = document.extraction.clone().unwrap_or_default();
        Self {
            kind: document.kind,
            fields: extraction.fields,
            field_confidence: extraction.field_confidence,
            overall_confidence: document.overall_confidence,
            status: document.status,
            error: document.error_message.clone(),
        }
    }

    pub fn extraction(&self) -> Extraction {
        Extraction {
            fields: self.fields.clone(),
            field_confidence: self.field_confidence.clone(),
        }
    }

    pub fn value(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

/// `mean(confidence) * valid / total`, clamped to `[0, 1]`; zero for no tokens.
pub fn compute_overall_confidence(tokens: &[OcrToken]) -> f32 {
    if tokens.is_empty() {
        return 0.0;
    }

    let confidences: Vec<f32> = tokens
        .iter()
        .map(|token| {
            if token.confidence.is_finite() {
                token.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            }
        })
        .collect();

    let total = confidences.len() as f32;
    let mean = confidences.iter().sum::<f32>() / total;
    let valid = confidences
        .iter()
        .filter(|confidence| **confidence >= TOKEN_CONFIDENCE_FLOOR)
        .count() as f32;

    (mean * (valid / total)).clamp(0.0, 1.0)
}

/// Runs the extraction pipeline with a bounded number of concurrent OCR calls.
pub struct DocumentExtractor {
    engine: Arc<dyn OcrEngine>,
    preprocessor: Arc<dyn ImagePreprocessor>,
    threshold: f32,
    permits: Arc<Semaphore>,
}

impl DocumentExtractor {
    pub fn new(engine: Arc<dyn OcrEngine>, threshold: f32) -> Self {
        Self {
            engine,
            preprocessor: Arc::new(PassthroughPreprocessor),
            threshold,
            permits: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
        }
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn ImagePreprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn with_concurrency(mut self, permits: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(permits.max(1)));
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Extract `kind` fields from `image`. Never fails: engine errors become a `failed` result.
    pub async fn extract(&self, image: &[u8], kind: DocumentKind) -> ExtractionResult {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return ExtractionResult::failed(kind, "extractor shut down".to_string()),
        };

        let preset = PreprocessingPreset::for_kind(kind);
        let preprocessor = self.preprocessor.clone();
        let owned = image.to_vec();
        let prepared =
            match tokio::task::spawn_blocking(move || preprocessor.prepare(&owned, preset)).await {
                Ok(Ok(prepared)) => prepared,
                Ok(Err(err)) => return ExtractionResult::failed(kind, err.to_string()),
                Err(err) => {
                    return ExtractionResult::failed(kind, format!("preprocessing aborted: {err}"))
                }
            };

        let tokens = match self.engine.recognize(&prepared).await {
            Ok(tokens) => tokens,
            Err(err) => {
                tracing::warn!(kind = kind.label(), error = %err, "ocr engine failed");
                return ExtractionResult::failed(kind, err.to_string());
            }
        };

        let text = tokens
            .iter()
            .map(|token| token.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() {
            return ExtractionResult::failed(kind, "no text recognized".to_string());
        }

        let overall_confidence = compute_overall_confidence(&tokens);
        let extraction = patterns::extract_fields(kind, &text);
        let status = if overall_confidence >= self.threshold {
            DocumentStatus::Success
        } else {
            DocumentStatus::Manual
        };

        tracing::debug!(
            kind = kind.label(),
            tokens = tokens.len(),
            overall_confidence,
            status = status.label(),
            "document extracted"
        );

        ExtractionResult {
            kind,
            fields: extraction.fields,
            field_confidence: extraction.field_confidence,
            overall_confidence,
            status,
            error: None,
        }
    }

    /// Run the pipeline for `document` and record the outcome on it.
    ///
    /// A document already in `success` keeps its cached extraction unless `force` is set.
    pub async fn process_document(
        &self,
        document: &mut Document,
        image: &[u8],
        force: bool,
    ) -> ExtractionResult {
        if document.status == DocumentStatus::Success && document.extraction.is_some() && !force {
            return ExtractionResult::from_document(document);
        }

        document.status = DocumentStatus::Processing;
        let result = self.extract(image, document.kind).await;

        document.status = result.status;
        document.extraction = Some(result.extraction());
        document.overall_confidence = result.overall_confidence;
        document.error_message = result.error.clone();
        document.validated_by_submitter = false;
        document.validated_extraction = None;
        document.processed_at = Some(Utc::now());

        result
    }
}

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use super::domain::{
    Channel, DocumentFormat, DocumentId, DocumentKind, EnrollmentId, ReviewerId, UserId,
    ValidationId,
};
use super::payment::treasurer::{QueueError, TreasurerAction};
use super::payment::GatewayError;
use super::repository::RepositoryError;
use super::service::{EnrollmentWorkflowService, UserInput, WorkflowError};
use super::session::SessionStoreError;

const DEFAULT_QUEUE_LIMIT: usize = 50;

/// HTTP endpoints for the messaging layer and the treasurer desk.
pub fn enrollment_router(service: Arc<EnrollmentWorkflowService>) -> Router {
    Router::new()
        .route("/api/v1/workflows", post(start_handler))
        .route(
            "/api/v1/workflows/:user_id",
            get(status_handler).delete(reset_handler),
        )
        .route("/api/v1/workflows/:user_id/messages", post(message_handler))
        .route(
            "/api/v1/workflows/:user_id/attachments",
            post(attachment_handler),
        )
        .route("/api/v1/treasurer/validations", get(queue_handler))
        .route(
            "/api/v1/treasurer/validations/:validation_id/claim",
            post(claim_handler),
        )
        .route(
            "/api/v1/treasurer/validations/:validation_id/decision",
            post(decision_handler),
        )
        .route(
            "/api/v1/documents/:document_id/reprocess",
            post(reprocess_handler),
        )
        .route(
            "/api/v1/enrollments/:enrollment_id/documents",
            post(attach_handler),
        )
        .route(
            "/api/v1/enrollments/:enrollment_id/cancel",
            post(cancel_handler),
        )
        .with_state(service)
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub user_id: String,
    pub phone: String,
    pub channel: Channel,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct QueueParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub reviewer_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub reviewer_id: String,
    pub action: String,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReprocessParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct AttachParams {
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

pub(crate) async fn start_handler(
    State(service): State<Arc<EnrollmentWorkflowService>>,
    Json(request): Json<StartRequest>,
) -> Response {
    if request.user_id.trim().is_empty() || request.phone.trim().is_empty() {
        let payload = json!({ "error": "user_id and phone are required" });
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(payload)).into_response();
    }

    let user_id = UserId::from(request.user_id.trim());
    match service
        .start_workflow(&user_id, &request.phone, request.channel)
        .await
    {
        Ok(reply) => (StatusCode::CREATED, Json(reply)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn message_handler(
    State(service): State<Arc<EnrollmentWorkflowService>>,
    Path(user_id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Response {
    let user_id = UserId(user_id);
    match service
        .process_input(&user_id, UserInput::text(request.text))
        .await
    {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn attachment_handler(
    State(service): State<Arc<EnrollmentWorkflowService>>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let format = attachment_format(&headers, &body);
    let user_id = UserId(user_id);
    match service
        .process_input(&user_id, UserInput::attachment(body.to_vec(), format))
        .await
    {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn status_handler(
    State(service): State<Arc<EnrollmentWorkflowService>>,
    Path(user_id): Path<String>,
) -> Response {
    match service.get_status(&UserId(user_id)) {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn reset_handler(
    State(service): State<Arc<EnrollmentWorkflowService>>,
    Path(user_id): Path<String>,
) -> Response {
    match service.reset(&UserId(user_id)).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn queue_handler(
    State(service): State<Arc<EnrollmentWorkflowService>>,
    Query(params): Query<QueueParams>,
) -> Response {
    let limit = params.limit.unwrap_or(DEFAULT_QUEUE_LIMIT);
    match service.treasurer_queue(limit) {
        Ok(validations) => (StatusCode::OK, Json(validations)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn claim_handler(
    State(service): State<Arc<EnrollmentWorkflowService>>,
    Path(validation_id): Path<String>,
    Json(request): Json<ClaimRequest>,
) -> Response {
    let reviewer = ReviewerId::from(request.reviewer_id.trim());
    match service.claim_validation(&ValidationId(validation_id), &reviewer) {
        Ok(validation) => (StatusCode::OK, Json(validation)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn decision_handler(
    State(service): State<Arc<EnrollmentWorkflowService>>,
    Path(validation_id): Path<String>,
    Json(request): Json<DecisionRequest>,
) -> Response {
    let Some(action) = TreasurerAction::parse(&request.action) else {
        let payload = json!({
            "error": format!("unknown action {}", request.action),
            "accepted": TreasurerAction::ALL.map(TreasurerAction::label),
        });
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(payload)).into_response();
    };

    let reviewer = ReviewerId::from(request.reviewer_id.trim());
    match service
        .decide_payment(&ValidationId(validation_id), &reviewer, action, request.notes)
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn reprocess_handler(
    State(service): State<Arc<EnrollmentWorkflowService>>,
    Path(document_id): Path<String>,
    Query(params): Query<ReprocessParams>,
    body: Bytes,
) -> Response {
    match service
        .reprocess_document(&DocumentId(document_id), &body, params.force)
        .await
    {
        Ok(document) => (StatusCode::OK, Json(document)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn attach_handler(
    State(service): State<Arc<EnrollmentWorkflowService>>,
    Path(enrollment_id): Path<String>,
    Query(params): Query<AttachParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(kind) = DocumentKind::parse(&params.kind) else {
        let payload = json!({ "error": format!("unknown document kind {}", params.kind) });
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(payload)).into_response();
    };

    let format = attachment_format(&headers, &body);
    match service
        .attach_document(&EnrollmentId(enrollment_id), kind, &body, format)
        .await
    {
        Ok(document) => (StatusCode::CREATED, Json(document)).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn cancel_handler(
    State(service): State<Arc<EnrollmentWorkflowService>>,
    Path(enrollment_id): Path<String>,
    Json(request): Json<CancelRequest>,
) -> Response {
    match service
        .cancel_enrollment(&EnrollmentId(enrollment_id), &request.reason)
        .await
    {
        Ok(enrollment) => (StatusCode::OK, Json(enrollment)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Declared content type first, magic bytes when it is missing or unhelpful.
fn attachment_format(headers: &HeaderMap, body: &[u8]) -> DocumentFormat {
    let declared = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<mime::Mime>().ok())
        .map(|mime| DocumentFormat::from_mime(&mime))
        .unwrap_or(DocumentFormat::Unknown);
    match declared {
        DocumentFormat::Unknown => DocumentFormat::sniff(body),
        known => known,
    }
}

pub(crate) fn error_status(err: &WorkflowError) -> StatusCode {
    match err {
        WorkflowError::SessionNotFound(_)
        | WorkflowError::DocumentNotFound(_)
        | WorkflowError::EnrollmentNotFound(_)
        | WorkflowError::Repository(RepositoryError::NotFound)
        | WorkflowError::Gateway(
            GatewayError::ValidationNotFound(_)
            | GatewayError::PaymentNotFound(_)
            | GatewayError::EnrollmentNotFound(_),
        ) => StatusCode::NOT_FOUND,
        WorkflowError::AwaitingOperator(_)
        | WorkflowError::Store(SessionStoreError::VersionConflict { .. })
        | WorkflowError::Repository(RepositoryError::Conflict | RepositoryError::StatusChanged { .. })
        | WorkflowError::Gateway(
            GatewayError::Decision(_)
            | GatewayError::Repository(RepositoryError::StatusChanged { .. })
            | GatewayError::CannotCancelActive
            | GatewayError::EnrollmentClosed(_)
            | GatewayError::NotAwaitingInformation,
        ) => StatusCode::CONFLICT,
        WorkflowError::UnsupportedDocumentKind(_) | WorkflowError::EmptyInput => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        WorkflowError::Gateway(GatewayError::Queue(QueueError::NoReviewers)) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_response(err: WorkflowError) -> Response {
    let status = error_status(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, "enrollment request failed");
    }
    let payload = json!({ "error": err.to_string() });
    (status, Json(payload)).into_response()
}

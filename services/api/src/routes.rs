use crate::infra::AppState;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Extension;
use axum::Json;
use catechese::workflows::enrollment::{enrollment_router, EnrollmentWorkflowService};
use serde_json::json;
use std::sync::Arc;

pub(crate) fn with_enrollment_routes(service: Arc<EnrollmentWorkflowService>) -> axum::Router {
    enrollment_router(service)
        .route("/health", axum::routing::get(healthcheck))
        .route("/ready", axum::routing::get(readiness_endpoint))
        .route("/metrics", axum::routing::get(metrics_endpoint))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::{build_service, LogNotifier, UnconfiguredOcrEngine};
    use axum::body::Body;
    use axum::http::Request;
    use catechese::config::EnrollmentConfig;
    use catechese::workflows::legacy::InMemoryLegacyDirectory;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    fn state(ready: bool) -> AppState {
        let recorder = PrometheusBuilder::new().build_recorder();
        AppState {
            readiness: Arc::new(AtomicBool::new(ready)),
            metrics: Arc::new(recorder.handle()),
        }
    }

    fn app(state: AppState) -> axum::Router {
        let service = build_service(
            &EnrollmentConfig::default(),
            Arc::new(InMemoryLegacyDirectory::default()),
            Arc::new(UnconfiguredOcrEngine),
            Arc::new(LogNotifier),
        );
        with_enrollment_routes(Arc::new(service)).layer(Extension(state))
    }

    #[tokio::test]
    async fn health_is_always_ok() {
        let Json(body) = healthcheck().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn readiness_follows_the_flag() {
        let state = state(false);
        let router = app(state.clone());

        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .expect("request builds");
        let response = router.clone().oneshot(request).await.expect("responds");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.readiness.store(true, Ordering::Release);
        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .expect("request builds");
        let response = router.oneshot(request).await.expect("responds");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn enrollment_routes_are_mounted() {
        let router = app(state(true));
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/workflows")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "user_id": "wa-1", "phone": "70112233", "channel": "whatsapp" })
                    .to_string(),
            ))
            .expect("request builds");
        let response = router.oneshot(request).await.expect("responds");
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn metrics_are_rendered_as_text() {
        let router = app(state(true));
        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .expect("request builds");
        let response = router.oneshot(request).await.expect("responds");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }
}

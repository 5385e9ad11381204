use crate::cli::ServeArgs;
use crate::infra::{
    build_service, load_legacy_directory, AppState, LogNotifier, UnconfiguredOcrEngine,
};
use crate::routes::with_enrollment_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use catechese::config::AppConfig;
use catechese::error::AppError;
use catechese::telemetry;
use catechese::workflows::enrollment::spawn_sweeper;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let enrollment = &config.enrollment;
    let legacy = load_legacy_directory(enrollment.legacy_csv_path.as_deref())?;
    let service = Arc::new(build_service(
        enrollment,
        Arc::new(legacy),
        Arc::new(UnconfiguredOcrEngine),
        Arc::new(LogNotifier),
    ));
    let sweeper = spawn_sweeper(
        service.clone(),
        Duration::from_secs(enrollment.sweep_interval_secs),
    );

    let app = with_enrollment_routes(service)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        treasurers = enrollment.treasurers.len(),
        "catechism enrollment service ready"
    );

    let served = axum::serve(listener, app).await;
    sweeper.abort();
    served?;
    Ok(())
}

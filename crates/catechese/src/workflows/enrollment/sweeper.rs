use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::service::EnrollmentWorkflowService;

/// Periodically expire overdue payments and purge idle sessions.
///
/// The first run happens one `every` after spawning. Abort the handle to stop the task.
pub fn spawn_sweeper(service: Arc<EnrollmentWorkflowService>, every: Duration) -> JoinHandle<()> {
    let every = every.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;

        loop {
            interval.tick().await;
            match service.run_maintenance().await {
                Ok(report) if report.expired_payments > 0 || report.purged_sessions > 0 => {
                    tracing::info!(
                        expired_payments = report.expired_payments,
                        purged_sessions = report.purged_sessions,
                        "maintenance sweep"
                    );
                }
                Ok(_) => tracing::debug!("maintenance sweep found nothing to do"),
                Err(err) => tracing::warn!(error = %err, "maintenance sweep failed"),
            }
        }
    })
}

//! Closes the SSH session after a period without remote activity.
//!
//! Remote jobs are unaffected beyond losing observation; they are
//! re-attached when the user connects again.

use std::sync::Arc;
use std::time::Duration;

use neuroinsight_execution::{AuditEvent, AuditLog};
use neuroinsight_remote::ConnectionManager;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(50);
const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Check interval for a given idle timeout: a quarter of it, at most a minute.
pub fn check_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 4).clamp(MIN_CHECK_INTERVAL, MAX_CHECK_INTERVAL)
}

/// Run the idle check loop until cancelled.
pub async fn run(
    connections: Arc<ConnectionManager>,
    audit: Arc<AuditLog>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(check_interval(idle_timeout));
    // The first tick completes immediately; skip it.
    interval.tick().await;

    tracing::info!(idle_timeout_secs = idle_timeout.as_secs(), "Idle disconnect task started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Idle disconnect task stopping");
                break;
            }
            _ = interval.tick() => {
                let target = connections.target().await;
                if connections.disconnect_if_idle(idle_timeout).await {
                    tracing::info!(target = ?target.as_ref().map(|t| t.to_string()), "Idle SSH session closed");
                    audit
                        .record(
                            AuditEvent::SshDisconnected,
                            None,
                            json!({
                                "target": target.map(|t| t.to_string()),
                                "reason": "idle",
                                "idle_timeout_secs": idle_timeout.as_secs(),
                            }),
                        )
                        .await;
                }
            }
        }
    }
}

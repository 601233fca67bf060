//! Forwards sync events into the log.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stacksync::gitops::{SyncEvent, SyncEventPhase};

/// Logs every event received on `events` until the channel closes.
pub fn spawn_event_logger(mut events: broadcast::Receiver<SyncEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Sync event logger fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &SyncEvent) {
    let key = event.key.as_ref().map(ToString::to_string);
    match event.phase {
        SyncEventPhase::Resource if event.error.is_some() => warn!(
            application = %event.application,
            sync_id = %event.sync_id,
            key = ?key,
            error = ?event.error,
            "{}",
            event.message
        ),
        SyncEventPhase::Resource => debug!(
            application = %event.application,
            sync_id = %event.sync_id,
            key = ?key,
            "{}",
            event.message
        ),
        SyncEventPhase::Failed => warn!(
            application = %event.application,
            sync_id = %event.sync_id,
            error = ?event.error,
            "{}",
            event.message
        ),
        _ => info!(
            application = %event.application,
            sync_id = %event.sync_id,
            phase = %event.phase,
            revision = ?event.revision,
            "{}",
            event.message
        ),
    }
}

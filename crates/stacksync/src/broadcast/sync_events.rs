//! Sync event broadcaster for real-time reconciliation streaming.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::gitops::progress::{SyncEvent, SyncProgress};

/// Broadcasts sync progress events for streaming.
#[derive(Clone)]
pub struct SyncEventBroadcaster {
    sender: Arc<broadcast::Sender<SyncEvent>>,
}

impl SyncEventBroadcaster {
    /// Creates a new broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: SyncEvent) {
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Creates a progress tracker for a new sync pass of `application`.
    pub fn start_sync(&self, application: &str) -> SyncProgress {
        SyncProgress::new(application, Arc::clone(&self.sender))
    }
}

impl Default for SyncEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitops::progress::SyncEventPhase;
    use crate::gitops::resource::ResourceKey;

    #[test]
    fn test_broadcaster_send_receive() {
        let broadcaster = SyncEventBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();

        broadcaster.send(SyncEvent::new(
            "sync-1",
            "demo",
            SyncEventPhase::Started,
            "Test message",
        ));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.sync_id, "sync-1");
        assert_eq!(received.application, "demo");
    }

    #[test]
    fn test_start_sync() {
        let broadcaster = SyncEventBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();

        let progress = broadcaster.start_sync("demo");
        progress.resource(&ResourceKey::new("Service", "demo", "api"), "Created");

        let received = rx.try_recv().unwrap();
        assert_eq!(received.phase, SyncEventPhase::Resource);
        assert_eq!(received.sync_id, progress.sync_id());
    }

    #[test]
    fn test_send_without_subscribers() {
        let broadcaster = SyncEventBroadcaster::default();
        broadcaster.start_sync("demo").started("nobody listening");
    }
}

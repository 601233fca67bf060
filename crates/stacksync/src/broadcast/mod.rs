//! Broadcasting modules for real-time event streaming.

pub mod sync_events;

pub use sync_events::SyncEventBroadcaster;

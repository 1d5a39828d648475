//! Tuning constants recognized by the collaboration core.

use std::time::Duration;

/// Core configuration shared by rooms and the room manager.
///
/// Transport addresses, credentials and allow-lists are the embedding
/// service's concern; the core only recognizes these four knobs.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// How often every non-empty room solicits a fresh snapshot
    pub snapshot_request_interval: Duration,
    /// How long an empty room lingers before a deferred removal attempt
    pub empty_room_grace: Duration,
    /// Per-client write deadline; a timed-out write removes the client
    pub client_write_deadline: Duration,
    /// Random bytes per connection tag (hex doubles the length)
    pub connection_tag_bytes: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            snapshot_request_interval: Duration::from_secs(30),
            empty_room_grace: Duration::from_secs(5),
            client_write_deadline: Duration::from_secs(5),
            connection_tag_bytes: 8,
        }
    }
}

impl CollabConfig {
    /// Create config for testing (millisecond-scale timers).
    pub fn for_testing() -> Self {
        Self {
            snapshot_request_interval: Duration::from_millis(50),
            empty_room_grace: Duration::from_millis(20),
            client_write_deadline: Duration::from_millis(500),
            connection_tag_bytes: 8,
        }
    }
}

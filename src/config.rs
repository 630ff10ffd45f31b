//! Session orchestrator configuration

use crate::signaling::{ClientRequest, SignalingChannel};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Session orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a correlated request may wait for its completion before
    /// failing. The server side offers no delivery guarantee, so without
    /// this bound a silently dropped completion would pend forever.
    pub request_timeout: Duration,
    /// Capacity of the shared server-event broadcast channel
    pub event_capacity: usize,
    /// Request echo cancellation when capturing audio devices
    pub echo_cancellation: bool,
}

impl SessionConfig {
    /// Build a signaling channel sized by this configuration, returning the
    /// outbound request queue for the server connection to drain.
    #[must_use]
    pub fn signaling_channel(
        &self,
    ) -> (SignalingChannel, mpsc::UnboundedReceiver<ClientRequest>) {
        SignalingChannel::new(self.event_capacity)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            event_capacity: 64,
            echo_cancellation: true,
        }
    }
}

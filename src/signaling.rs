//! Signaling message contracts and the shared signaling channel
//!
//! All communication with the SFU control plane flows through two streams:
//! an outbound queue of [`ClientRequest`]s and an inbound broadcast of
//! [`ServerEvent`]s. Every message is scoped by `session_id` and, where
//! relevant, `producer_id`/`consumer_id` so completions can be correlated
//! back to the request that caused them.

use crate::error::{Error, Result};
use crate::types::{
    ConsumerId, MediaKind, MediaParameters, ProducerId, RoutingCapabilities, SessionId,
    TransportParameters, TransportSecurityParameters,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

/// Underlying signaling connectivity, observed by sessions before joining
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Requests sent to the SFU control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Enter the room; completed by [`ServerEvent::SessionJoined`]
    JoinSession { session_id: SessionId },

    /// Provide transport security parameters during connect negotiation;
    /// completed by [`ServerEvent::TransportConnected`]
    ConnectTransport {
        session_id: SessionId,
        security: TransportSecurityParameters,
    },

    /// Create the server-side producer backing a local produce call;
    /// completed by [`ServerEvent::ServerProducerCreated`]
    CreateServerProducer {
        session_id: SessionId,
        kind: MediaKind,
        media: MediaParameters,
    },

    /// Subscribe to a remote producer; completed by
    /// [`ServerEvent::ServerConsumerCreated`] for the same producer id
    CreateServerConsumer {
        producer_id: ProducerId,
        session_id: SessionId,
        routing_capabilities: RoutingCapabilities,
    },

    /// Request the server's pause/resume state for a consumer; answered by
    /// [`ServerEvent::ConsumerStreamToggled`]
    ToggleConsumerStream { consumer_id: ConsumerId },

    /// Fire-and-forget: a local producer closed
    CloseServerProducer {
        session_id: SessionId,
        producer_id: ProducerId,
    },

    /// Fire-and-forget: a local consumer released
    CloseServerConsumer { consumer_id: ConsumerId },

    /// Fire-and-forget: the participant left the room
    LeaveSession { session_id: SessionId },
}

impl ClientRequest {
    /// Stable operation name, used for logging and error reporting
    #[must_use]
    pub const fn op(&self) -> &'static str {
        match self {
            Self::JoinSession { .. } => "join_session",
            Self::ConnectTransport { .. } => "connect_transport",
            Self::CreateServerProducer { .. } => "create_server_producer",
            Self::CreateServerConsumer { .. } => "create_server_consumer",
            Self::ToggleConsumerStream { .. } => "toggle_consumer_stream",
            Self::CloseServerProducer { .. } => "close_server_producer",
            Self::CloseServerConsumer { .. } => "close_server_consumer",
            Self::LeaveSession { .. } => "leave_session",
        }
    }
}

/// Events received from the SFU control plane.
///
/// Completions carry an optional `error` field; a populated error rejects
/// the originating request without side effects on other operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Join confirmation with everything needed to build transports
    SessionJoined {
        session_id: SessionId,
        routing_capabilities: RoutingCapabilities,
        transport_parameters: TransportParameters,
    },

    /// Connect negotiation completed
    TransportConnected {
        session_id: SessionId,
        error: Option<String>,
    },

    /// Server-side producer creation completed
    ServerProducerCreated {
        session_id: SessionId,
        producer_id: Option<ProducerId>,
        error: Option<String>,
    },

    /// Server-side consumer creation completed
    ServerConsumerCreated {
        session_id: SessionId,
        producer_id: ProducerId,
        consumer_id: ConsumerId,
        kind: MediaKind,
        media: MediaParameters,
    },

    /// A consumer's stream was paused or resumed
    ConsumerStreamToggled { consumer_id: ConsumerId, paused: bool },

    /// A remote session started publishing a new producer
    RemoteProducerOpened {
        session_id: SessionId,
        producer_id: ProducerId,
    },

    /// A remote producer stopped publishing
    RemoteProducerClosed {
        session_id: SessionId,
        producer_id: ProducerId,
    },

    /// The actively speaking session changed
    ActiveSpeakerChanged { session_id: SessionId },
}

/// Shared signaling channel: one outbound request queue plus a broadcast
/// stream of inbound server events that any number of listeners may follow
/// with independent cursors.
#[derive(Clone)]
pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<ClientRequest>,
    events: broadcast::Sender<ServerEvent>,
}

impl SignalingChannel {
    /// Create a channel, returning the receiving half of the outbound queue
    /// for the transport layer (or a test fixture) to drain.
    #[must_use]
    pub fn new(event_capacity: usize) -> (Self, mpsc::UnboundedReceiver<ClientRequest>) {
        let (outbound, requests) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(event_capacity);
        (Self { outbound, events }, requests)
    }

    /// Queue a request for delivery to the server
    pub fn send(&self, request: ClientRequest) -> Result<()> {
        self.outbound
            .send(request)
            .map_err(|_| Error::SignalingClosed)
    }

    /// Subscribe to the inbound server-event stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Deliver an inbound server event to all current subscribers.
    ///
    /// Called by the transport layer that owns the server connection.
    /// Returns the number of subscribers that received the event.
    pub fn deliver(&self, event: ServerEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }
}

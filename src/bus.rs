//! Correlated request bus
//!
//! Request/response matching over the shared server-event broadcast. A
//! request subscribes to the event stream *before* it is sent, then takes
//! the first event whose correlation keys (session id plus the
//! operation-specific producer/consumer id) match, and resolves exactly
//! once. The subscription is dropped after the first match, so no
//! listeners leak, and concurrent requests for the same session but
//! different correlation keys never cross-match.

use crate::error::{Error, Result};
use crate::signaling::{ClientRequest, ServerEvent, SignalingChannel};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Correlated request bus over a [`SignalingChannel`]
#[derive(Clone)]
pub struct CorrelatedBus {
    channel: SignalingChannel,
    request_timeout: Duration,
}

impl CorrelatedBus {
    #[must_use]
    pub const fn new(channel: SignalingChannel, request_timeout: Duration) -> Self {
        Self {
            channel,
            request_timeout,
        }
    }

    /// Send a request and obtain a handle for awaiting its completion.
    ///
    /// The event subscription is taken before the request leaves, so a
    /// completion can never race past the listener.
    pub fn begin(&self, request: ClientRequest) -> Result<PendingRequest> {
        let events = self.channel.subscribe();
        self.channel.send(request.clone())?;
        debug!(op = request.op(), "Correlated request sent");
        Ok(PendingRequest {
            events,
            request,
            timeout: self.request_timeout,
        })
    }

    /// Send a request and await its completion
    pub async fn request(&self, request: ClientRequest) -> Result<ServerEvent> {
        self.begin(request)?.complete().await
    }

    /// Send a fire-and-forget notification; no completion is awaited
    pub fn notify(&self, request: ClientRequest) -> Result<()> {
        debug!(op = request.op(), "Notification sent");
        self.channel.send(request)
    }
}

/// An in-flight correlated request
pub struct PendingRequest {
    events: broadcast::Receiver<ServerEvent>,
    request: ClientRequest,
    timeout: Duration,
}

impl PendingRequest {
    /// Await the first matching completion.
    ///
    /// Resolves at most once; completions carrying an error reject with
    /// [`Error::Negotiation`]. Fails with [`Error::Timeout`] if no matching
    /// completion arrives within the configured window.
    pub async fn complete(mut self) -> Result<ServerEvent> {
        let op = self.request.op();
        let recv = async {
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        if correlates(&self.request, &event) {
                            return completion_result(event, op);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(op, skipped, "Completion stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::SignalingClosed);
                    }
                }
            }
        };
        match tokio::time::timeout(self.timeout, recv).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout { op }),
        }
    }
}

/// Whether `event` is the completion of `request`
fn correlates(request: &ClientRequest, event: &ServerEvent) -> bool {
    match (request, event) {
        (
            ClientRequest::JoinSession { session_id },
            ServerEvent::SessionJoined {
                session_id: completed,
                ..
            },
        )
        | (
            ClientRequest::ConnectTransport { session_id, .. },
            ServerEvent::TransportConnected {
                session_id: completed,
                ..
            },
        )
        | (
            ClientRequest::CreateServerProducer { session_id, .. },
            ServerEvent::ServerProducerCreated {
                session_id: completed,
                ..
            },
        ) => completed == session_id,
        (
            ClientRequest::CreateServerConsumer {
                producer_id,
                session_id,
                ..
            },
            ServerEvent::ServerConsumerCreated {
                session_id: completed_session,
                producer_id: completed_producer,
                ..
            },
        ) => completed_session == session_id && completed_producer == producer_id,
        (
            ClientRequest::ToggleConsumerStream { consumer_id },
            ServerEvent::ConsumerStreamToggled {
                consumer_id: completed,
                ..
            },
        ) => completed == consumer_id,
        _ => false,
    }
}

/// Turn a matched completion into a result, surfacing embedded errors
fn completion_result(event: ServerEvent, op: &'static str) -> Result<ServerEvent> {
    let error = match &event {
        ServerEvent::TransportConnected { error, .. }
        | ServerEvent::ServerProducerCreated { error, .. } => error.clone(),
        _ => None,
    };
    match error {
        Some(detail) => Err(Error::Negotiation { op, detail }),
        None => Ok(event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ConsumerId, MediaKind, MediaParameters, ProducerId, RoutingCapabilities, SessionId,
    };

    type RequestQueue = tokio::sync::mpsc::UnboundedReceiver<ClientRequest>;

    fn bus_with_channel() -> (CorrelatedBus, SignalingChannel, RequestQueue) {
        let (channel, requests) = SignalingChannel::new(16);
        (
            CorrelatedBus::new(channel.clone(), Duration::from_secs(1)),
            channel,
            requests,
        )
    }

    #[tokio::test]
    async fn test_completion_matched_by_session_id() {
        let (bus, channel, _requests) = bus_with_channel();
        let pending = bus
            .begin(ClientRequest::JoinSession {
                session_id: SessionId::from("s1"),
            })
            .unwrap();

        // A completion for another session must be ignored.
        channel.deliver(ServerEvent::SessionJoined {
            session_id: SessionId::from("other"),
            routing_capabilities: RoutingCapabilities::null(),
            transport_parameters: crate::types::TransportParameters::null(),
        });
        channel.deliver(ServerEvent::SessionJoined {
            session_id: SessionId::from("s1"),
            routing_capabilities: RoutingCapabilities::null(),
            transport_parameters: crate::types::TransportParameters::null(),
        });

        let completion = pending.complete().await.unwrap();
        assert!(matches!(
            completion,
            ServerEvent::SessionJoined { session_id, .. } if session_id == SessionId::from("s1")
        ));
    }

    #[tokio::test]
    async fn test_concurrent_requests_do_not_cross_match() {
        let (bus, channel, _requests) = bus_with_channel();
        let session = SessionId::from("s1");

        let first = bus
            .begin(ClientRequest::CreateServerConsumer {
                producer_id: ProducerId::from("p1"),
                session_id: session.clone(),
                routing_capabilities: RoutingCapabilities::null(),
            })
            .unwrap();
        let second = bus
            .begin(ClientRequest::CreateServerConsumer {
                producer_id: ProducerId::from("p2"),
                session_id: session.clone(),
                routing_capabilities: RoutingCapabilities::null(),
            })
            .unwrap();

        // Deliver completions in reverse order of the requests.
        channel.deliver(ServerEvent::ServerConsumerCreated {
            session_id: session.clone(),
            producer_id: ProducerId::from("p2"),
            consumer_id: ConsumerId::from("c2"),
            kind: MediaKind::Video,
            media: MediaParameters::null(),
        });
        channel.deliver(ServerEvent::ServerConsumerCreated {
            session_id: session.clone(),
            producer_id: ProducerId::from("p1"),
            consumer_id: ConsumerId::from("c1"),
            kind: MediaKind::Audio,
            media: MediaParameters::null(),
        });

        let first = first.complete().await.unwrap();
        let second = second.complete().await.unwrap();
        assert!(matches!(
            first,
            ServerEvent::ServerConsumerCreated { consumer_id, .. }
                if consumer_id == ConsumerId::from("c1")
        ));
        assert!(matches!(
            second,
            ServerEvent::ServerConsumerCreated { consumer_id, .. }
                if consumer_id == ConsumerId::from("c2")
        ));
    }

    #[tokio::test]
    async fn test_error_completion_rejects() {
        let (bus, channel, _requests) = bus_with_channel();
        let pending = bus
            .begin(ClientRequest::ConnectTransport {
                session_id: SessionId::from("s1"),
                security: crate::types::TransportSecurityParameters::null(),
            })
            .unwrap();

        channel.deliver(ServerEvent::TransportConnected {
            session_id: SessionId::from("s1"),
            error: Some("dtls failure".to_string()),
        });

        let result = pending.complete().await;
        assert!(matches!(
            result,
            Err(Error::Negotiation { op: "connect_transport", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_without_completion() {
        let (channel, _requests) = SignalingChannel::new(16);
        let bus = CorrelatedBus::new(channel, Duration::from_secs(5));

        let result = bus
            .request(ClientRequest::JoinSession {
                session_id: SessionId::from("s1"),
            })
            .await;
        assert!(matches!(
            result,
            Err(Error::Timeout { op: "join_session" })
        ));
    }

    #[tokio::test]
    async fn test_notify_does_not_wait() {
        let (channel, mut requests) = SignalingChannel::new(16);
        let bus = CorrelatedBus::new(channel, Duration::from_secs(1));

        bus.notify(ClientRequest::CloseServerConsumer {
            consumer_id: ConsumerId::from("c1"),
        })
        .unwrap();
        let sent = requests.recv().await.unwrap();
        assert_eq!(sent.op(), "close_server_consumer");
    }
}

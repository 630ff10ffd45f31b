//! Consumer management
//!
//! Negotiates one consumer per remote producer and keeps the combined
//! inbound surface consistent as remote producers start, pause, resume and
//! stop publishing. A consumer is only ever instantiated after its
//! server-side creation completed; there is no speculative state. Close
//! notifications for unknown ids are no-ops, not faults.

use crate::bus::CorrelatedBus;
use crate::engine::{ConsumeOptions, ConsumerHandle, MediaTransport};
use crate::error::{Error, Result};
use crate::signaling::{ClientRequest, ServerEvent};
use crate::stream::MediaSurface;
use crate::types::{ConsumerId, MediaKind, ProducerId, RoutingCapabilities, SessionId, TrackId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct ConsumerEntry {
    handle: Box<dyn ConsumerHandle>,
    producer_id: ProducerId,
    kind: MediaKind,
    /// Id of the track currently attached to the inbound surface, if any
    attached_track: Option<TrackId>,
}

/// Tracks this session's consumers and the combined inbound surface
pub struct ConsumerManager {
    session_id: SessionId,
    bus: CorrelatedBus,
    transport: Arc<dyn MediaTransport>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    inbound: watch::Sender<MediaSurface>,
}

impl ConsumerManager {
    #[must_use]
    pub fn new(
        session_id: SessionId,
        bus: CorrelatedBus,
        transport: Arc<dyn MediaTransport>,
        inbound: watch::Sender<MediaSurface>,
    ) -> Self {
        Self {
            session_id,
            bus,
            transport,
            consumers: HashMap::new(),
            inbound,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    #[must_use]
    pub fn consumes_producer(&self, producer_id: &ProducerId) -> bool {
        self.consumers
            .values()
            .any(|entry| entry.producer_id == *producer_id)
    }

    /// Subscribe to one remote producer.
    ///
    /// Issues the consume request, awaits the server-created consumer
    /// description, instantiates the consumer on the receive transport and
    /// attaches its track as resumed.
    pub async fn consume(
        &mut self,
        producer_id: ProducerId,
        routing_capabilities: RoutingCapabilities,
    ) -> Result<()> {
        if self.consumes_producer(&producer_id) {
            debug!(
                session_id = %self.session_id,
                producer_id = %producer_id,
                "Producer already consumed"
            );
            return Ok(());
        }

        let completion = self
            .bus
            .request(ClientRequest::CreateServerConsumer {
                producer_id: producer_id.clone(),
                session_id: self.session_id.clone(),
                routing_capabilities,
            })
            .await?;
        let ServerEvent::ServerConsumerCreated {
            consumer_id,
            kind,
            media,
            ..
        } = completion
        else {
            return Err(Error::Negotiation {
                op: "create_server_consumer",
                detail: "unexpected completion payload".to_string(),
            });
        };

        let handle = self
            .transport
            .consume(ConsumeOptions {
                consumer_id: consumer_id.clone(),
                producer_id: producer_id.clone(),
                kind,
                media,
            })
            .await?;
        info!(
            session_id = %self.session_id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            kind = %kind,
            "Consumer created"
        );
        self.consumers.insert(
            consumer_id.clone(),
            ConsumerEntry {
                handle,
                producer_id,
                kind,
                attached_track: None,
            },
        );

        // Ask the server for the current pause state; until it answers the
        // consumer is treated as resumed.
        self.bus.notify(ClientRequest::ToggleConsumerStream {
            consumer_id: consumer_id.clone(),
        })?;
        self.apply_toggle(&consumer_id, false);
        Ok(())
    }

    /// Apply a pause/resume toggle to a consumer's kind on the inbound
    /// surface. The previous track of that kind is always stopped and
    /// detached before the new one is attached, so at most one active track
    /// per kind exists. Unknown ids are ignored.
    pub fn apply_toggle(&mut self, consumer_id: &ConsumerId, paused: bool) {
        let Some(entry) = self.consumers.get_mut(consumer_id) else {
            debug!(consumer_id = %consumer_id, "Toggle for unknown consumer ignored");
            return;
        };
        let kind = entry.kind;
        if paused {
            entry.attached_track = None;
            self.inbound.send_modify(|surface| {
                surface.replace(kind, None);
            });
        } else {
            let track = entry.handle.track();
            entry.attached_track = Some(track.id().clone());
            self.inbound.send_modify(|surface| {
                surface.replace(kind, Some(track));
            });
        }
        debug!(
            session_id = %self.session_id,
            consumer_id = %consumer_id,
            kind = %kind,
            paused,
            "Consumer stream toggled"
        );
    }

    /// Release a consumer: close it locally, rebuild the inbound surface
    /// without its track and (unless the whole session is tearing down)
    /// notify the server the resource is released. Unknown ids are no-ops.
    pub fn close_consumer(&mut self, consumer_id: &ConsumerId, notify_server: bool) {
        let Some(entry) = self.consumers.remove(consumer_id) else {
            debug!(consumer_id = %consumer_id, "Close for unknown consumer ignored");
            return;
        };
        if !entry.handle.is_closed() {
            entry.handle.close();
        }
        if let Some(track_id) = entry.attached_track {
            self.inbound.send_modify(|surface| {
                let holds_track = surface
                    .track(entry.kind)
                    .is_some_and(|track| *track.id() == track_id);
                if holds_track {
                    surface.replace(entry.kind, None);
                }
            });
        }
        if notify_server {
            if let Err(e) = self.bus.notify(ClientRequest::CloseServerConsumer {
                consumer_id: consumer_id.clone(),
            }) {
                warn!(consumer_id = %consumer_id, error = %e, "Consumer close notification failed");
            }
        }
        info!(
            session_id = %self.session_id,
            consumer_id = %consumer_id,
            producer_id = %entry.producer_id,
            "Consumer closed"
        );
    }

    /// Close the consumer bound to a remote producer that stopped
    /// publishing. A consumer never outlives its source producer.
    pub fn close_for_producer(&mut self, producer_id: &ProducerId) {
        let consumer_id = self
            .consumers
            .iter()
            .find(|(_, entry)| entry.producer_id == *producer_id)
            .map(|(id, _)| id.clone());
        match consumer_id {
            Some(id) => self.close_consumer(&id, true),
            None => {
                debug!(producer_id = %producer_id, "Close for unknown producer ignored");
            }
        }
    }

    /// Close every consumer locally and clear the inbound surface.
    /// Best-effort; used during session teardown.
    pub fn close_all(&mut self) {
        let ids: Vec<ConsumerId> = self.consumers.keys().cloned().collect();
        for id in ids {
            self.close_consumer(&id, false);
        }
        self.inbound.send_modify(MediaSurface::clear);
    }
}

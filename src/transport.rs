//! Transport negotiation
//!
//! Builds exactly one directional transport per session (send if the
//! session publishes, receive otherwise) and answers the engine's
//! negotiation hooks over the correlated request bus. Building a second
//! transport for a session is a programming-contract violation, as is a
//! produce negotiation overlapping an earlier one still in flight.

use crate::bus::CorrelatedBus;
use crate::engine::{
    MediaEngine, MediaTransport, TransportDirection, TransportHooks,
};
use crate::error::{Error, Result};
use crate::signaling::{ClientRequest, ServerEvent};
use crate::types::{
    MediaKind, MediaParameters, ProducerId, SessionId, TransportParameters,
    TransportSecurityParameters,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Negotiation lifecycle of a session's transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Unbuilt,
    Built,
    Connected,
    Closed,
}

/// Owns the single transport for one session and its negotiation state
pub struct TransportNegotiator {
    session_id: SessionId,
    bus: CorrelatedBus,
    state: Arc<RwLock<TransportState>>,
    transport: Option<Arc<dyn MediaTransport>>,
    direction: Option<TransportDirection>,
}

impl TransportNegotiator {
    #[must_use]
    pub fn new(session_id: SessionId, bus: CorrelatedBus) -> Self {
        Self {
            session_id,
            bus,
            state: Arc::new(RwLock::new(TransportState::Unbuilt)),
            transport: None,
            direction: None,
        }
    }

    /// Build the session's transport in the given direction.
    ///
    /// Registers the negotiation hooks that answer the engine's
    /// connect-requested and produce-requested callbacks over the bus.
    pub async fn build(
        &mut self,
        engine: &dyn MediaEngine,
        direction: TransportDirection,
        params: TransportParameters,
    ) -> Result<Arc<dyn MediaTransport>> {
        if let Some(existing) = self.direction {
            return Err(Error::ContractViolation(format!(
                "a {existing:?} transport already exists for session {}",
                self.session_id
            )));
        }

        let hooks: Arc<dyn TransportHooks> = Arc::new(BusHooks {
            session_id: self.session_id.clone(),
            bus: self.bus.clone(),
            state: Arc::clone(&self.state),
            produce_in_flight: AtomicBool::new(false),
        });
        let transport = match direction {
            TransportDirection::Send => engine.create_send_transport(params, hooks).await?,
            TransportDirection::Recv => engine.create_recv_transport(params, hooks).await?,
        };
        *self.state.write() = TransportState::Built;
        self.direction = Some(direction);
        self.transport = Some(Arc::clone(&transport));

        info!(
            session_id = %self.session_id,
            ?direction,
            "Transport built"
        );
        Ok(transport)
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.state.read()
    }

    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn MediaTransport>> {
        self.transport.clone()
    }

    /// Close the transport if one was built. Idempotent.
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
            *self.state.write() = TransportState::Closed;
            info!(session_id = %self.session_id, "Transport closed");
        }
    }
}

/// Hook implementation answering engine callbacks over the bus
struct BusHooks {
    session_id: SessionId,
    bus: CorrelatedBus,
    state: Arc<RwLock<TransportState>>,
    produce_in_flight: AtomicBool,
}

#[async_trait]
impl TransportHooks for BusHooks {
    async fn on_connect(&self, security: TransportSecurityParameters) -> Result<()> {
        let _completion = self
            .bus
            .request(ClientRequest::ConnectTransport {
                session_id: self.session_id.clone(),
                security,
            })
            .await?;
        *self.state.write() = TransportState::Connected;
        debug!(session_id = %self.session_id, "Transport connect confirmed");
        Ok(())
    }

    async fn on_produce(&self, kind: MediaKind, media: MediaParameters) -> Result<ProducerId> {
        // The engine serializes produce negotiations; a second call while
        // one is pending breaks that contract.
        if self.produce_in_flight.swap(true, Ordering::SeqCst) {
            return Err(Error::ContractViolation(
                "produce negotiation already in flight".to_string(),
            ));
        }
        let result = self
            .bus
            .request(ClientRequest::CreateServerProducer {
                session_id: self.session_id.clone(),
                kind,
                media,
            })
            .await;
        self.produce_in_flight.store(false, Ordering::SeqCst);

        match result? {
            ServerEvent::ServerProducerCreated {
                producer_id: Some(producer_id),
                ..
            } => {
                debug!(
                    session_id = %self.session_id,
                    producer_id = %producer_id,
                    kind = %kind,
                    "Server producer created"
                );
                Ok(producer_id)
            }
            other => {
                warn!(session_id = %self.session_id, ?other, "Produce completion missing producer id");
                Err(Error::Negotiation {
                    op: "create_server_producer",
                    detail: "completion carried no producer id".to_string(),
                })
            }
        }
    }
}

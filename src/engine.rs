//! External SFU media-engine capability surface
//!
//! The orchestrator never touches ICE/DTLS negotiation, RTP routing or
//! codec handling; it drives an engine implementation through these traits.
//! The engine invokes [`TransportHooks`] when it needs server confirmation
//! mid-negotiation, and the orchestrator answers over the correlated
//! request bus.

use crate::error::Result;
use crate::types::{
    ConsumerId, DeviceId, MediaKind, MediaParameters, ProducerId, RoutingCapabilities, TrackId,
    TransportParameters, TransportSecurityParameters,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Engine-reported transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportConnectionState {
    New,
    Connecting,
    Connected,
    Closed,
    Failed,
}

/// Handle to a live local media track.
///
/// Clones share the underlying liveness flag: stopping any clone stops the
/// track everywhere it is attached.
#[derive(Debug, Clone)]
pub struct Track {
    id: TrackId,
    kind: MediaKind,
    live: Arc<AtomicBool>,
}

impl Track {
    #[must_use]
    pub fn new(kind: MediaKind) -> Self {
        Self::with_id(TrackId::new(), kind)
    }

    #[must_use]
    pub fn with_id(id: TrackId, kind: MediaKind) -> Self {
        Self {
            id,
            kind,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Stop the track. Permanent; stopped tracks never resume.
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Audio capture constraints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    pub device: DeviceId,
    pub echo_cancellation: bool,
}

/// Video capture constraints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub device: DeviceId,
}

/// A combined capture request. Audio and video that are both newly desired
/// are requested together so the user sees a single permission prompt and
/// only one capture session is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl CaptureConstraints {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// Tracks produced by one capture request
#[derive(Debug, Default)]
pub struct CapturedMedia {
    pub audio: Option<Track>,
    pub video: Option<Track>,
}

impl CapturedMedia {
    /// Take the captured track of the given kind, if any
    pub fn take(&mut self, kind: MediaKind) -> Option<Track> {
        match kind {
            MediaKind::Audio => self.audio.take(),
            MediaKind::Video => self.video.take(),
        }
    }
}

/// Options for instantiating a consumer on a receive transport
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub media: MediaParameters,
}

/// Engine-originated notifications about consumer resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The remote track backing a consumer ended; terminal for the consumer
    TrackEnded { consumer_id: ConsumerId },
    /// The engine closed a consumer
    ConsumerClosed { consumer_id: ConsumerId },
}

/// Negotiation hooks the engine invokes when it needs server confirmation.
///
/// The engine guarantees that produce negotiations are serialized: it never
/// invokes `on_produce` while an earlier call is still pending.
#[async_trait]
pub trait TransportHooks: Send + Sync {
    /// Connect negotiation: deliver transport security parameters to the
    /// server. Success means the transport is connected; failure must abort
    /// the connect without automatic retry.
    async fn on_connect(&self, security: TransportSecurityParameters) -> Result<()>;

    /// Produce negotiation: create the server-side producer and return its
    /// server-assigned id. On failure the engine aborts the local produce
    /// cleanly, creating no producer.
    async fn on_produce(&self, kind: MediaKind, media: MediaParameters) -> Result<ProducerId>;
}

/// Handle to a local outbound producer
pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    /// The device track this producer publishes
    fn track(&self) -> Track;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Handle to an inbound consumer
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    /// A detachable handle to the consumer's track. Each call returns an
    /// independently stoppable handle with the same track id, so a surface
    /// can stop its copy without ending the consumer's media flow.
    fn track(&self) -> Track;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// A directional media transport negotiated with the SFU
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn direction(&self) -> TransportDirection;
    fn connection_state(&self) -> TransportConnectionState;

    /// Publish a local track. Drives `on_connect` on first use and
    /// `on_produce` through [`TransportHooks`].
    async fn produce(&self, track: Track) -> Result<Box<dyn ProducerHandle>>;

    /// Instantiate a consumer from a server-created consumer description.
    /// Drives `on_connect` on first use.
    async fn consume(&self, options: ConsumeOptions) -> Result<Box<dyn ConsumerHandle>>;

    fn close(&self);
}

/// The SFU media engine
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Load router capabilities received at join; must precede any
    /// transport creation.
    async fn load(&self, routing_capabilities: RoutingCapabilities) -> Result<()>;

    /// Local routing capabilities advertised when consuming
    fn rtp_capabilities(&self) -> RoutingCapabilities;

    async fn create_send_transport(
        &self,
        params: TransportParameters,
        hooks: Arc<dyn TransportHooks>,
    ) -> Result<Arc<dyn MediaTransport>>;

    async fn create_recv_transport(
        &self,
        params: TransportParameters,
        hooks: Arc<dyn TransportHooks>,
    ) -> Result<Arc<dyn MediaTransport>>;

    /// Take the engine's event stream (can only be taken once)
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>>;
}

/// Local device capture surface
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire tracks for every kind named in `constraints` in a single
    /// combined request.
    async fn capture(&self, constraints: CaptureConstraints) -> Result<CapturedMedia>;
}

//! Test helpers and fixtures
//!
//! Fake implementations of the signaling plane, the media engine and the
//! device capture surface, so orchestration logic can be exercised without
//! a real SFU. The fakes honor the same negotiation contracts as the real
//! engine: transports connect lazily on first produce/consume, produce
//! calls are serialized, and a consumer's `track()` mints an independently
//! stoppable handle per call.

use crate::bus::CorrelatedBus;
use crate::engine::{
    CaptureConstraints, CapturedMedia, ConsumeOptions, ConsumerHandle, EngineEvent, MediaEngine,
    MediaSource, MediaTransport, ProducerHandle, Track, TransportConnectionState,
    TransportDirection, TransportHooks,
};
use crate::error::{Error, Result};
use crate::signaling::{ClientRequest, ServerEvent, SignalingChannel};
use crate::types::{
    ConsumerId, MediaKind, MediaParameters, ProducerId, RoutingCapabilities, TrackId,
    TransportParameters, TransportSecurityParameters,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A signaling channel whose outbound queue the test drains by hand.
///
/// Used when a test needs to script the server side explicitly, completion
/// by completion. For the common happy paths prefer [`FakeSfuServer`].
pub struct TestSignaling {
    pub channel: SignalingChannel,
    requests: mpsc::UnboundedReceiver<ClientRequest>,
}

impl TestSignaling {
    pub fn new() -> Self {
        let (channel, requests) = SignalingChannel::new(64);
        Self { channel, requests }
    }

    /// Wait for the next outbound request, panicking if none arrives soon.
    pub async fn expect_request(&mut self) -> ClientRequest {
        match tokio::time::timeout(Duration::from_secs(1), self.requests.recv()).await {
            Ok(Some(request)) => request,
            Ok(None) => panic!("signaling channel closed while awaiting a request"),
            Err(_) => panic!("no request arrived within 1s"),
        }
    }

    /// Deliver a server event to every subscriber
    pub fn deliver(&self, event: ServerEvent) {
        self.channel.deliver(event);
    }

    /// Whether the outbound queue is currently empty
    pub fn no_request_pending(&mut self) -> bool {
        matches!(
            self.requests.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        )
    }
}

impl Default for TestSignaling {
    fn default() -> Self {
        Self::new()
    }
}

/// An auto-responding fake of the SFU control plane.
///
/// Every request is answered with a success completion and recorded so
/// tests can assert on the operations that actually reached the server.
/// `remote_producers` maps producer ids to the kind the server would
/// report when a consumer is created for them.
pub struct FakeSfuServer {
    channel: SignalingChannel,
    seen: mpsc::UnboundedReceiver<ClientRequest>,
}

impl FakeSfuServer {
    pub fn spawn(remote_producers: HashMap<ProducerId, MediaKind>) -> Self {
        let (channel, mut requests) = SignalingChannel::new(64);
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let responder = channel.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                if let Some(event) = respond(&request, &remote_producers) {
                    responder.deliver(event);
                }
                if seen_tx.send(request).is_err() {
                    break;
                }
            }
        });
        Self { channel, seen }
    }

    pub fn channel(&self) -> SignalingChannel {
        self.channel.clone()
    }

    pub fn bus(&self, request_timeout: Duration) -> CorrelatedBus {
        CorrelatedBus::new(self.channel.clone(), request_timeout)
    }

    /// Deliver a server-originated event (one not answering any request)
    pub fn deliver(&self, event: ServerEvent) {
        self.channel.deliver(event);
    }

    /// Collect every request seen so far, waiting out a short quiet period
    /// so fire-and-forget notifications sent just before the call are not
    /// missed.
    pub async fn drain_seen(&mut self) -> Vec<ClientRequest> {
        let mut drained = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_millis(50), self.seen.recv()).await {
                Ok(Some(request)) => drained.push(request),
                Ok(None) | Err(_) => return drained,
            }
        }
    }
}

fn respond(
    request: &ClientRequest,
    remote_producers: &HashMap<ProducerId, MediaKind>,
) -> Option<ServerEvent> {
    match request {
        ClientRequest::JoinSession { session_id } => Some(ServerEvent::SessionJoined {
            session_id: session_id.clone(),
            routing_capabilities: RoutingCapabilities::null(),
            transport_parameters: TransportParameters::null(),
        }),
        ClientRequest::ConnectTransport { session_id, .. } => {
            Some(ServerEvent::TransportConnected {
                session_id: session_id.clone(),
                error: None,
            })
        }
        ClientRequest::CreateServerProducer { session_id, .. } => {
            Some(ServerEvent::ServerProducerCreated {
                session_id: session_id.clone(),
                producer_id: Some(ProducerId::new()),
                error: None,
            })
        }
        ClientRequest::CreateServerConsumer {
            producer_id,
            session_id,
            ..
        } => {
            // Unknown producers get no completion; the request times out
            // exactly as it would against a real server.
            let kind = remote_producers.get(producer_id)?;
            Some(ServerEvent::ServerConsumerCreated {
                session_id: session_id.clone(),
                producer_id: producer_id.clone(),
                consumer_id: ConsumerId::new(),
                kind: *kind,
                media: MediaParameters::null(),
            })
        }
        ClientRequest::ToggleConsumerStream { consumer_id } => {
            Some(ServerEvent::ConsumerStreamToggled {
                consumer_id: consumer_id.clone(),
                paused: false,
            })
        }
        ClientRequest::CloseServerProducer { .. }
        | ClientRequest::CloseServerConsumer { .. }
        | ClientRequest::LeaveSession { .. } => None,
    }
}

/// In-memory media engine
pub struct FakeEngine {
    loaded: AtomicBool,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            loaded: AtomicBool::new(false),
            transports: Mutex::new(Vec::new()),
            events,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().clone()
    }

    /// Emit an engine-originated event, as a real engine would when a
    /// remote track ends or a consumer is torn down underneath us.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn register(&self, direction: TransportDirection, hooks: Arc<dyn TransportHooks>) -> Arc<FakeTransport> {
        let transport = Arc::new(FakeTransport::new(direction, hooks));
        self.transports.lock().push(Arc::clone(&transport));
        transport
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn load(&self, _routing_capabilities: RoutingCapabilities) -> Result<()> {
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn rtp_capabilities(&self) -> RoutingCapabilities {
        RoutingCapabilities::null()
    }

    async fn create_send_transport(
        &self,
        _params: TransportParameters,
        hooks: Arc<dyn TransportHooks>,
    ) -> Result<Arc<dyn MediaTransport>> {
        Ok(self.register(TransportDirection::Send, hooks))
    }

    async fn create_recv_transport(
        &self,
        _params: TransportParameters,
        hooks: Arc<dyn TransportHooks>,
    ) -> Result<Arc<dyn MediaTransport>> {
        Ok(self.register(TransportDirection::Recv, hooks))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events_rx.lock().take()
    }
}

/// Fake transport that connects lazily on first produce/consume and
/// serializes produce negotiations, like the real engine.
pub struct FakeTransport {
    direction: TransportDirection,
    hooks: Arc<dyn TransportHooks>,
    state: Mutex<TransportConnectionState>,
    negotiation: tokio::sync::Mutex<()>,
    producers: Mutex<Vec<FakeProducer>>,
    consumers: Mutex<Vec<FakeConsumer>>,
}

impl FakeTransport {
    fn new(direction: TransportDirection, hooks: Arc<dyn TransportHooks>) -> Self {
        Self {
            direction,
            hooks,
            state: Mutex::new(TransportConnectionState::New),
            negotiation: tokio::sync::Mutex::new(()),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn producer_count(&self) -> usize {
        self.producers
            .lock()
            .iter()
            .filter(|p| !p.is_closed())
            .count()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers
            .lock()
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock() == TransportConnectionState::Closed
    }

    /// Run connect negotiation once, on the first produce/consume
    async fn ensure_connected(&self) -> Result<()> {
        match *self.state.lock() {
            TransportConnectionState::Closed => return Err(Error::TransportUnavailable),
            TransportConnectionState::Connected => return Ok(()),
            _ => {}
        }
        *self.state.lock() = TransportConnectionState::Connecting;
        match self
            .hooks
            .on_connect(TransportSecurityParameters::null())
            .await
        {
            Ok(()) => {
                *self.state.lock() = TransportConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = TransportConnectionState::New;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn connection_state(&self) -> TransportConnectionState {
        *self.state.lock()
    }

    async fn produce(&self, track: Track) -> Result<Box<dyn ProducerHandle>> {
        let _serialized = self.negotiation.lock().await;
        self.ensure_connected().await?;
        let producer_id = self
            .hooks
            .on_produce(track.kind(), MediaParameters::null())
            .await?;
        let producer = FakeProducer {
            id: producer_id,
            kind: track.kind(),
            track,
            closed: Arc::new(AtomicBool::new(false)),
        };
        self.producers.lock().push(producer.clone());
        Ok(Box::new(producer))
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<Box<dyn ConsumerHandle>> {
        let _serialized = self.negotiation.lock().await;
        self.ensure_connected().await?;
        let consumer = FakeConsumer {
            id: options.consumer_id,
            producer_id: options.producer_id,
            kind: options.kind,
            track_id: TrackId::new(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        self.consumers.lock().push(consumer.clone());
        Ok(Box::new(consumer))
    }

    fn close(&self) {
        *self.state.lock() = TransportConnectionState::Closed;
        for producer in self.producers.lock().iter() {
            producer.close();
        }
        for consumer in self.consumers.lock().iter() {
            consumer.close();
        }
    }
}

#[derive(Clone)]
pub struct FakeProducer {
    id: ProducerId,
    kind: MediaKind,
    track: Track,
    closed: Arc<AtomicBool>,
}

impl ProducerHandle for FakeProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Track {
        self.track.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.track.stop();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct FakeConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    track_id: TrackId,
    closed: Arc<AtomicBool>,
}

impl ConsumerHandle for FakeConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Track {
        // Same track id every time, but each handle is independently
        // stoppable; a surface stopping its copy does not end the flow.
        Track::with_id(self.track_id.clone(), self.kind)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Fake device capture surface
pub struct FakeMediaSource {
    capture_count: AtomicUsize,
    last_constraints: Mutex<Option<CaptureConstraints>>,
    fail: AtomicBool,
}

impl FakeMediaSource {
    pub fn new() -> Self {
        Self {
            capture_count: AtomicUsize::new(0),
            last_constraints: Mutex::new(None),
            fail: AtomicBool::new(false),
        }
    }

    pub fn capture_count(&self) -> usize {
        self.capture_count.load(Ordering::SeqCst)
    }

    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        self.last_constraints.lock().clone()
    }

    /// Make subsequent captures fail, as a revoked device permission would
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Default for FakeMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn capture(&self, constraints: CaptureConstraints) -> Result<CapturedMedia> {
        self.capture_count.fetch_add(1, Ordering::SeqCst);
        *self.last_constraints.lock() = Some(constraints.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Device("capture permission denied".to_string()));
        }
        Ok(CapturedMedia {
            audio: constraints.audio.map(|_| Track::new(MediaKind::Audio)),
            video: constraints.video.map(|_| Track::new(MediaKind::Video)),
        })
    }
}

//! Session lifecycle controller
//!
//! One event-loop task per participant session owns every piece of that
//! session's state: join negotiation, the directional transport, and either
//! the producer reconciler (own tile) or the consumer manager (remote tile).
//! Nothing is negotiated before the join confirmation arrives, and teardown
//! attempts every release step even when earlier ones fail.

use crate::bus::CorrelatedBus;
use crate::config::SessionConfig;
use crate::consume::ConsumerManager;
use crate::engine::{EngineEvent, MediaEngine, MediaSource, TransportDirection};
use crate::error::{Error, Result};
use crate::publish::{DesiredMediaState, Publisher};
use crate::signaling::{ClientRequest, ConnectionStatus, ServerEvent, SignalingChannel};
use crate::stream::MediaSurface;
use crate::transport::TransportNegotiator;
use crate::types::RoomSessionInfo;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What an active session does with media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveMode {
    Publishing,
    Consuming,
}

/// Lifecycle of one participant session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Joining,
    AwaitingJoinConfirmation,
    Active(ActiveMode),
    Leaving,
    Left,
}

/// Commands the handle may send into the session loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Leave,
}

/// Owner-facing handle to a running session.
///
/// Dropping the handle closes the command channel, which the session loop
/// treats as a leave request.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    preview: watch::Receiver<MediaSurface>,
    inbound: watch::Receiver<MediaSurface>,
    active_speaking: watch::Receiver<bool>,
    /// User-visible failures (device errors, negotiation failures) that do
    /// not end the session by themselves
    pub errors: mpsc::UnboundedReceiver<Error>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Request an orderly leave. Teardown runs on the session task.
    pub fn leave(&self) {
        let _ = self.commands.send(SessionCommand::Leave);
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Local outbound preview surface (own tile, audio excluded)
    #[must_use]
    pub fn preview(&self) -> watch::Receiver<MediaSurface> {
        self.preview.clone()
    }

    /// Combined inbound surface (remote tile)
    #[must_use]
    pub fn inbound(&self) -> watch::Receiver<MediaSurface> {
        self.inbound.clone()
    }

    /// Whether this session is the room's active speaker
    #[must_use]
    pub fn active_speaking(&self) -> watch::Receiver<bool> {
        self.active_speaking.clone()
    }

    /// Wait for the session task to finish teardown
    pub async fn closed(self) {
        let _ = self.task.await;
    }
}

/// Select outcome of an active session loop
enum Wake {
    Desired,
    Command(Option<SessionCommand>),
    Event(std::result::Result<ServerEvent, broadcast::error::RecvError>),
    Engine(Option<EngineEvent>),
}

/// The per-session event loop and all state it owns
pub struct RoomSession {
    info: RoomSessionInfo,
    engine: Arc<dyn MediaEngine>,
    source: Arc<dyn MediaSource>,
    bus: CorrelatedBus,
    channel: SignalingChannel,
    connectivity: watch::Receiver<ConnectionStatus>,
    desired: watch::Receiver<DesiredMediaState>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    state: watch::Sender<SessionState>,
    preview: Option<watch::Sender<MediaSurface>>,
    inbound: Option<watch::Sender<MediaSurface>>,
    active_speaking: watch::Sender<bool>,
    errors: mpsc::UnboundedSender<Error>,
    echo_cancellation: bool,
    joined: bool,
    negotiator: Option<TransportNegotiator>,
    publisher: Option<Publisher>,
    consumers: Option<ConsumerManager>,
}

impl RoomSession {
    /// Spawn the session loop on the current runtime.
    ///
    /// `connectivity` gates the join: nothing is sent until it reports
    /// connected. `desired` drives producer reconciliation for publishing
    /// sessions and is ignored for consuming ones.
    #[must_use]
    pub fn spawn(
        info: RoomSessionInfo,
        config: SessionConfig,
        engine: Arc<dyn MediaEngine>,
        source: Arc<dyn MediaSource>,
        channel: SignalingChannel,
        connectivity: watch::Receiver<ConnectionStatus>,
        desired: watch::Receiver<DesiredMediaState>,
    ) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (preview_tx, preview_rx) = watch::channel(MediaSurface::default());
        let (inbound_tx, inbound_rx) = watch::channel(MediaSurface::default());
        let (speaking_tx, speaking_rx) = watch::channel(false);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let session = Self {
            bus: CorrelatedBus::new(channel.clone(), config.request_timeout),
            info,
            engine,
            source,
            channel,
            connectivity,
            desired,
            commands: commands_rx,
            state: state_tx,
            preview: Some(preview_tx),
            inbound: Some(inbound_tx),
            active_speaking: speaking_tx,
            errors: errors_tx,
            echo_cancellation: config.echo_cancellation,
            joined: false,
            negotiator: None,
            publisher: None,
            consumers: None,
        };
        let task = tokio::spawn(session.run());

        SessionHandle {
            commands: commands_tx,
            state: state_rx,
            preview: preview_rx,
            inbound: inbound_rx,
            active_speaking: speaking_rx,
            errors: errors_rx,
            task,
        }
    }

    async fn run(mut self) {
        if let Err(e) = self.drive().await {
            warn!(session_id = %self.info.id, error = %e, "Session loop ended with error");
            let _ = self.errors.send(e);
        }
        self.teardown();
    }

    /// Join, go active and serve until leave or a fatal error
    async fn drive(&mut self) -> Result<()> {
        // Join is gated on signaling connectivity.
        loop {
            if *self.connectivity.borrow_and_update() == ConnectionStatus::Connected {
                break;
            }
            tokio::select! {
                changed = self.connectivity.changed() => {
                    changed.map_err(|_| Error::SignalingClosed)?;
                }
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Leave) | None => return Ok(()),
                },
            }
        }

        self.state.send_replace(SessionState::Joining);
        let pending = self.bus.begin(ClientRequest::JoinSession {
            session_id: self.info.id.clone(),
        })?;
        self.state
            .send_replace(SessionState::AwaitingJoinConfirmation);

        let complete = pending.complete();
        tokio::pin!(complete);
        let completion = tokio::select! {
            completion = &mut complete => completion?,
            command = self.commands.recv() => match command {
                Some(SessionCommand::Leave) | None => return Ok(()),
            },
        };
        let ServerEvent::SessionJoined {
            routing_capabilities,
            transport_parameters,
            ..
        } = completion
        else {
            return Err(Error::Negotiation {
                op: "join_session",
                detail: "unexpected completion payload".to_string(),
            });
        };
        self.joined = true;
        self.engine.load(routing_capabilities).await?;

        let direction = if self.info.can_publish {
            TransportDirection::Send
        } else {
            TransportDirection::Recv
        };
        let mut negotiator = TransportNegotiator::new(self.info.id.clone(), self.bus.clone());
        negotiator
            .build(self.engine.as_ref(), direction, transport_parameters)
            .await?;
        self.negotiator = Some(negotiator);
        info!(
            session_id = %self.info.id,
            display_name = %self.info.display_name,
            can_publish = self.info.can_publish,
            "Session joined"
        );

        if self.info.can_publish {
            self.run_publishing().await
        } else {
            self.run_consuming().await
        }
    }

    fn transport(&self) -> Result<Arc<dyn crate::engine::MediaTransport>> {
        self.negotiator
            .as_ref()
            .and_then(TransportNegotiator::transport)
            .ok_or(Error::TransportUnavailable)
    }

    async fn run_publishing(&mut self) -> Result<()> {
        let transport = self.transport()?;
        let Some(preview) = self.preview.take() else {
            return Err(Error::ContractViolation(
                "publishing loop entered twice".to_string(),
            ));
        };
        let mut publisher = Publisher::new(
            self.info.id.clone(),
            self.bus.clone(),
            transport,
            Arc::clone(&self.source),
            preview,
            self.echo_cancellation,
        );
        // Subscribe before going observably active so no event delivered to
        // an active session can be missed.
        let mut events = self.channel.subscribe();
        self.state
            .send_replace(SessionState::Active(ActiveMode::Publishing));

        let result = self.publishing_loop(&mut publisher, &mut events).await;
        self.publisher = Some(publisher);
        result
    }

    async fn publishing_loop(
        &mut self,
        publisher: &mut Publisher,
        events: &mut broadcast::Receiver<ServerEvent>,
    ) -> Result<()> {
        let initial = self.desired.borrow_and_update().clone();
        if let Err(e) = publisher.reconcile(&initial).await {
            let _ = self.errors.send(e);
        }

        let mut desired_open = true;
        loop {
            let wake = tokio::select! {
                changed = self.desired.changed(), if desired_open => {
                    desired_open = changed.is_ok();
                    Wake::Desired
                }
                command = self.commands.recv() => Wake::Command(command),
                event = events.recv() => Wake::Event(event),
            };
            match wake {
                Wake::Desired => {
                    if desired_open {
                        let desired = self.desired.borrow_and_update().clone();
                        if let Err(e) = publisher.reconcile(&desired).await {
                            let _ = self.errors.send(e);
                        }
                    }
                }
                Wake::Command(Some(SessionCommand::Leave) | None) => return Ok(()),
                Wake::Event(Ok(event)) => self.observe_room_event(&event),
                Wake::Event(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(session_id = %self.info.id, skipped, "Event stream lagged");
                }
                Wake::Event(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(Error::SignalingClosed);
                }
                Wake::Engine(_) => {}
            }
        }
    }

    async fn run_consuming(&mut self) -> Result<()> {
        let transport = self.transport()?;
        let Some(inbound) = self.inbound.take() else {
            return Err(Error::ContractViolation(
                "consuming loop entered twice".to_string(),
            ));
        };
        let mut manager = ConsumerManager::new(
            self.info.id.clone(),
            self.bus.clone(),
            transport,
            inbound,
        );
        // Subscribe before the initial consumes so producers announced
        // while they run are not missed.
        let mut events = self.channel.subscribe();
        self.state
            .send_replace(SessionState::Active(ActiveMode::Consuming));
        let (engine_hold, fallback) = mpsc::unbounded_channel();
        let mut engine_events = self.engine.take_events().unwrap_or(fallback);

        for producer_id in self.info.producers.clone() {
            if let Err(e) = manager
                .consume(producer_id, self.engine.rtp_capabilities())
                .await
            {
                let _ = self.errors.send(e);
            }
        }

        let result = self
            .consuming_loop(&mut manager, &mut events, &mut engine_events)
            .await;
        drop(engine_hold);
        self.consumers = Some(manager);
        result
    }

    async fn consuming_loop(
        &mut self,
        manager: &mut ConsumerManager,
        events: &mut broadcast::Receiver<ServerEvent>,
        engine_events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Result<()> {
        let mut engine_open = true;
        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                event = events.recv() => Wake::Event(event),
                event = engine_events.recv(), if engine_open => Wake::Engine(event),
            };
            match wake {
                Wake::Command(Some(SessionCommand::Leave) | None) => return Ok(()),
                Wake::Event(Ok(event)) => {
                    self.observe_room_event(&event);
                    match event {
                        ServerEvent::RemoteProducerOpened {
                            session_id,
                            producer_id,
                        } if session_id == self.info.id => {
                            if let Err(e) = manager
                                .consume(producer_id, self.engine.rtp_capabilities())
                                .await
                            {
                                let _ = self.errors.send(e);
                            }
                        }
                        ServerEvent::RemoteProducerClosed {
                            session_id,
                            producer_id,
                        } if session_id == self.info.id => {
                            manager.close_for_producer(&producer_id);
                        }
                        ServerEvent::ConsumerStreamToggled {
                            consumer_id,
                            paused,
                        } => manager.apply_toggle(&consumer_id, paused),
                        _ => {}
                    }
                }
                Wake::Event(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(session_id = %self.info.id, skipped, "Event stream lagged");
                }
                Wake::Event(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(Error::SignalingClosed);
                }
                Wake::Engine(Some(event)) => match event {
                    EngineEvent::TrackEnded { consumer_id }
                    | EngineEvent::ConsumerClosed { consumer_id } => {
                        debug!(
                            session_id = %self.info.id,
                            consumer_id = %consumer_id,
                            "Consumer ended by engine"
                        );
                        manager.close_consumer(&consumer_id, true);
                    }
                },
                Wake::Engine(None) => engine_open = false,
                Wake::Desired => {}
            }
        }
    }

    /// Events relevant in every active mode
    fn observe_room_event(&self, event: &ServerEvent) {
        if let ServerEvent::ActiveSpeakerChanged { session_id } = event {
            self.active_speaking
                .send_replace(*session_id == self.info.id);
        }
    }

    /// Release everything this session acquired. Every step is attempted
    /// even when an earlier one fails; afterwards the producer set, the
    /// consumer set and both surfaces are empty.
    fn teardown(&mut self) {
        self.state.send_replace(SessionState::Leaving);

        if let Some(mut publisher) = self.publisher.take() {
            publisher.close_all();
        } else if let Some(preview) = self.preview.take() {
            preview.send_modify(MediaSurface::clear);
        }
        if let Some(mut manager) = self.consumers.take() {
            manager.close_all();
        } else if let Some(inbound) = self.inbound.take() {
            inbound.send_modify(MediaSurface::clear);
        }
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.close();
        }
        if self.joined {
            if let Err(e) = self.bus.notify(ClientRequest::LeaveSession {
                session_id: self.info.id.clone(),
            }) {
                warn!(session_id = %self.info.id, error = %e, "Leave notification failed");
            }
        }

        self.state.send_replace(SessionState::Left);
        info!(session_id = %self.info.id, "Session left");
    }
}

//! Producer reconciliation
//!
//! Derives the correct set of local outbound producers from the declarative
//! desired media state (selected devices and mute flags) and applies only
//! the deltas. Planning is a pure function so any permutation of desired
//! state changes converges to the same producer set, and re-running with an
//! unchanged state issues zero SFU operations.

use crate::bus::CorrelatedBus;
use crate::engine::{
    AudioConstraints, CaptureConstraints, MediaSource, MediaTransport, ProducerHandle,
    VideoConstraints,
};
use crate::error::{Error, Result};
use crate::signaling::ClientRequest;
use crate::stream::MediaSurface;
use crate::types::{DeviceId, MediaKind, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Declarative description of what this session wants to publish.
///
/// Recomputed by the owner whenever any input changes; there is no ordering
/// constraint between the fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredMediaState {
    pub audio_device: Option<DeviceId>,
    pub video_device: Option<DeviceId>,
    pub audio_muted: bool,
    pub video_muted: bool,
}

impl DesiredMediaState {
    #[must_use]
    pub const fn device_for(&self, kind: MediaKind) -> Option<&DeviceId> {
        match kind {
            MediaKind::Audio => self.audio_device.as_ref(),
            MediaKind::Video => self.video_device.as_ref(),
        }
    }

    #[must_use]
    pub const fn is_muted(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_muted,
            MediaKind::Video => self.video_muted,
        }
    }
}

/// The deltas one reconciliation pass must apply
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Kinds whose producer must close
    pub to_close: Vec<MediaKind>,
    /// Kinds that need capture and a new producer
    pub to_capture: Vec<MediaKind>,
}

impl ReconcilePlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_close.is_empty() && self.to_capture.is_empty()
    }
}

/// Compute the deltas between the desired state and the kinds that
/// currently have a producer. Pure; no hidden mutable capture.
#[must_use]
pub fn plan(desired: &DesiredMediaState, current: &[MediaKind]) -> ReconcilePlan {
    let mut result = ReconcilePlan::default();
    for kind in MediaKind::ALL {
        let has_producer = current.contains(&kind);
        if desired.is_muted(kind) {
            if has_producer {
                result.to_close.push(kind);
            }
        } else if desired.device_for(kind).is_some() && !has_producer {
            result.to_capture.push(kind);
        }
    }
    result
}

/// Applies reconciliation plans against the send transport and maintains
/// the outbound preview surface.
pub struct Publisher {
    session_id: SessionId,
    bus: CorrelatedBus,
    transport: Arc<dyn MediaTransport>,
    source: Arc<dyn MediaSource>,
    producers: HashMap<MediaKind, Box<dyn ProducerHandle>>,
    preview: watch::Sender<MediaSurface>,
    echo_cancellation: bool,
}

impl Publisher {
    #[must_use]
    pub fn new(
        session_id: SessionId,
        bus: CorrelatedBus,
        transport: Arc<dyn MediaTransport>,
        source: Arc<dyn MediaSource>,
        preview: watch::Sender<MediaSurface>,
        echo_cancellation: bool,
    ) -> Self {
        Self {
            session_id,
            bus,
            transport,
            source,
            producers: HashMap::new(),
            preview,
            echo_cancellation,
        }
    }

    /// Kinds that currently have a producer
    #[must_use]
    pub fn producer_kinds(&self) -> Vec<MediaKind> {
        let mut kinds: Vec<MediaKind> = self.producers.keys().copied().collect();
        kinds.sort_by_key(MediaKind::as_str);
        kinds
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Bring the producer set in line with `desired`.
    ///
    /// Closes first, then captures every newly desired kind in one combined
    /// request and produces each captured track. A device failure is
    /// reported without undoing the closes already applied or affecting the
    /// other kind, and the preview surface is rebuilt regardless.
    pub async fn reconcile(&mut self, desired: &DesiredMediaState) -> Result<()> {
        let current = self.producer_kinds();
        let plan = plan(desired, &current);
        if plan.is_empty() {
            return Ok(());
        }
        debug!(
            session_id = %self.session_id,
            to_close = plan.to_close.len(),
            to_capture = plan.to_capture.len(),
            "Reconciling producers"
        );

        for kind in &plan.to_close {
            self.close_producer(*kind);
        }

        let mut first_error: Option<Error> = None;
        if !plan.to_capture.is_empty() {
            let constraints = self.constraints_for(desired, &plan.to_capture);
            match self.source.capture(constraints).await {
                Ok(mut captured) => {
                    for kind in &plan.to_capture {
                        let Some(track) = captured.take(*kind) else {
                            warn!(session_id = %self.session_id, kind = %kind, "Capture returned no track");
                            first_error.get_or_insert(Error::Device(format!(
                                "no {kind} track captured"
                            )));
                            continue;
                        };
                        match self.transport.produce(track.clone()).await {
                            Ok(handle) => {
                                info!(
                                    session_id = %self.session_id,
                                    producer_id = %handle.id(),
                                    kind = %kind,
                                    "Producer created"
                                );
                                self.producers.insert(*kind, handle);
                            }
                            Err(e) => {
                                track.stop();
                                warn!(session_id = %self.session_id, kind = %kind, error = %e, "Produce failed");
                                first_error.get_or_insert(e);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Device capture failed");
                    first_error = Some(match e {
                        Error::Device(detail) => Error::Device(detail),
                        other => Error::Device(other.to_string()),
                    });
                }
            }
        }

        self.rebuild_preview();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close every producer and clear the preview. Best-effort; used during
    /// session teardown.
    pub fn close_all(&mut self) {
        for kind in MediaKind::ALL {
            self.close_producer(kind);
        }
        self.preview.send_modify(MediaSurface::clear);
    }

    fn close_producer(&mut self, kind: MediaKind) {
        if let Some(handle) = self.producers.remove(&kind) {
            if !handle.is_closed() {
                handle.close();
            }
            if let Err(e) = self.bus.notify(ClientRequest::CloseServerProducer {
                session_id: self.session_id.clone(),
                producer_id: handle.id(),
            }) {
                warn!(session_id = %self.session_id, kind = %kind, error = %e, "Producer close notification failed");
            }
            info!(
                session_id = %self.session_id,
                producer_id = %handle.id(),
                kind = %kind,
                "Producer closed"
            );
        }
    }

    fn constraints_for(
        &self,
        desired: &DesiredMediaState,
        kinds: &[MediaKind],
    ) -> CaptureConstraints {
        let mut constraints = CaptureConstraints::default();
        for kind in kinds {
            match kind {
                MediaKind::Audio => {
                    if let Some(device) = desired.audio_device.clone() {
                        constraints.audio = Some(AudioConstraints {
                            device,
                            echo_cancellation: self.echo_cancellation,
                        });
                    }
                }
                MediaKind::Video => {
                    if let Some(device) = desired.video_device.clone() {
                        constraints.video = Some(VideoConstraints { device });
                    }
                }
            }
        }
        constraints
    }

    /// The preview mirrors the producing tracks, except that the session's
    /// own audio is never played back to the participant.
    fn rebuild_preview(&self) {
        let mut surface = MediaSurface::default();
        for (kind, handle) in &self.producers {
            if *kind == MediaKind::Audio {
                continue;
            }
            let track = handle.track();
            if track.is_live() {
                surface.attach(*kind, track);
            }
        }
        let _ = self.preview.send(surface);
    }
}

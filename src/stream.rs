//! Combined media surfaces
//!
//! A [`MediaSurface`] is the union of the currently active tracks for a
//! session, keyed by kind: at most one audio and one video track at any
//! time. It backs both the combined inbound stream (everything consumed
//! from remotes) and the local outbound preview. It is always rebuilt or
//! replaced per kind, never partially mutated across kinds.

use crate::engine::Track;
use crate::types::MediaKind;

/// At most one active track per kind
#[derive(Debug, Clone, Default)]
pub struct MediaSurface {
    audio: Option<Track>,
    video: Option<Track>,
}

impl MediaSurface {
    fn slot_mut(&mut self, kind: MediaKind) -> &mut Option<Track> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    /// Set a kind's track on a freshly built surface without touching any
    /// previous occupant. Used when rebuilding wholesale from live sources
    /// whose tracks must keep flowing (e.g. producer preview rebuilds).
    pub fn attach(&mut self, kind: MediaKind, track: Track) {
        *self.slot_mut(kind) = Some(track);
    }

    /// Replace a kind's track: the previous track of that kind is always
    /// stopped and detached before the new one (if any) is attached.
    pub fn replace(&mut self, kind: MediaKind, track: Option<Track>) {
        let slot = self.slot_mut(kind);
        if let Some(previous) = slot.take() {
            previous.stop();
        }
        *slot = track;
    }

    /// Stop and detach every track
    pub fn clear(&mut self) {
        self.replace(MediaKind::Audio, None);
        self.replace(MediaKind::Video, None);
    }

    #[must_use]
    pub const fn track(&self, kind: MediaKind) -> Option<&Track> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    #[must_use]
    pub const fn has(&self, kind: MediaKind) -> bool {
        self.track(kind).is_some()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

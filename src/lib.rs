//! `RoomLink` media session orchestration
//!
//! Coordinates per-participant audio/video sessions in a room on top of an
//! external SFU (selective forwarding unit). The SFU owns negotiation and
//! media routing; this crate owns everything around it: correlating
//! signaling requests with their completions, transport negotiation,
//! reconciling local producers against a declarative desired state, and
//! managing the consumers behind each remote participant's combined stream.
//!
//! ## Architecture
//!
//! - **`RoomSession`**: one event-loop task per participant session, from
//!   join to teardown
//! - **`CorrelatedBus`**: request/completion matching over the shared
//!   server-event broadcast
//! - **`TransportNegotiator`**: the single directional transport per
//!   session and its negotiation hooks
//! - **`Publisher`**: derives producer create/close deltas from the desired
//!   media state and applies them
//! - **`ConsumerManager`**: one consumer per remote producer, feeding the
//!   combined inbound surface
//!
//! Media-engine specifics stay behind the [`MediaEngine`]/[`MediaTransport`]
//! traits; the orchestrator never touches ICE, DTLS or RTP itself.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomlink::{RoomSession, RoomSessionInfo, SessionConfig, SessionId};
//!
//! let info = RoomSessionInfo::new(SessionId::new(), "alice", true);
//! let handle = RoomSession::spawn(
//!     info,
//!     SessionConfig::default(),
//!     engine,
//!     source,
//!     channel,
//!     connectivity,
//!     desired,
//! );
//! ```

mod bus;
mod config;
mod consume;
mod engine;
mod error;
mod publish;
mod session;
mod signaling;
mod stream;
mod transport;
mod types;

#[cfg(test)]
pub mod test_helpers;

pub use bus::{CorrelatedBus, PendingRequest};
pub use config::SessionConfig;
pub use consume::ConsumerManager;
pub use engine::{
    AudioConstraints, CaptureConstraints, CapturedMedia, ConsumeOptions, ConsumerHandle,
    EngineEvent, MediaEngine, MediaSource, MediaTransport, ProducerHandle, Track,
    TransportConnectionState, TransportDirection, TransportHooks, VideoConstraints,
};
pub use error::{Error, Result};
pub use publish::{plan, DesiredMediaState, Publisher, ReconcilePlan};
pub use session::{ActiveMode, RoomSession, SessionCommand, SessionHandle, SessionState};
pub use signaling::{ClientRequest, ConnectionStatus, ServerEvent, SignalingChannel};
pub use stream::MediaSurface;
pub use transport::{TransportNegotiator, TransportState};
pub use types::{
    ConsumerId, DeviceId, MediaKind, MediaParameters, ProducerId, RoomSessionInfo,
    RoutingCapabilities, SessionId, TrackId, TransportParameters, TransportSecurityParameters,
};

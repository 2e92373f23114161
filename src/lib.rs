//! # voicemesh
//!
//! Full-mesh WebRTC call engine for community voice and video channels.
//!
//! Each participant in a voice channel holds one peer connection per other
//! participant; there is no media server. The engine owns connection
//! negotiation, ICE candidate buffering, disconnect recovery with capped
//! ICE restarts, local track fan-out, and a call-level state machine.
//! Signaling transport, channel membership, and platform media capture are
//! external collaborators behind the [`SignalingSink`],
//! [`ChannelDirectory`], and [`MediaSource`] traits.
//!
//! ## Usage
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use voicemesh::{run_call, CallCommand, CallConfig, ChannelRef, ParticipantId};
//! # fn demo(
//! #     sink: Arc<dyn voicemesh::SignalingSink>,
//! #     directory: Arc<dyn voicemesh::ChannelDirectory>,
//! #     media: Arc<dyn voicemesh::MediaSource>,
//! # ) -> voicemesh::Result<()> {
//! let handle = run_call(
//!     ParticipantId::new("user-42"),
//!     CallConfig::default(),
//!     sink,
//!     directory,
//!     media,
//! )?;
//! handle.command(CallCommand::Join(ChannelRef::new("acme", "general-voice")))?;
//! let _snapshots = handle.snapshots();
//! # Ok(())
//! # }
//! ```
//!
//! Inbound signaling and membership events are delivered with
//! [`CallHandle::deliver`]; the session ignores events for channels other
//! than the one it joined.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod media;
pub mod mesh;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::{CallConfig, TurnServerConfig};
pub use error::{Error, Result};
pub use media::{LocalTracks, MediaSource, MediaState, MediaToggles, TrackSlot};
pub use mesh::{MeshManager, MeshQuality, ParticipantSnapshot};
pub use peer::{LinkEvent, PeerLink};
pub use session::{
    run_call, CallCommand, CallHandle, CallSession, CallSnapshot, CallState,
};
pub use signaling::{
    ChannelDirectory, ChannelEvent, ChannelRef, ParticipantId, ParticipantInfo, SdpKind,
    SignalingSink, WireMessage,
};

/// Returns the version of the voicemesh crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_version() {
        assert!(!super::version().is_empty());
    }
}

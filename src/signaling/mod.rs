//! Signaling identifiers, channel events, and external collaborator traits
//!
//! The engine never talks to a signaling server directly. Outbound SDP and
//! ICE candidates go through a [`SignalingSink`], channel membership goes
//! through a [`ChannelDirectory`], and inbound traffic is delivered to the
//! session as [`ChannelEvent`]s.

pub mod codec;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::error::Result;
use crate::media::MediaState;

pub use codec::WireMessage;

/// Identity of one voice channel inside a community
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    /// Community (server) the channel belongs to
    pub community_id: String,
    /// Channel within the community
    pub channel_id: String,
}

impl ChannelRef {
    /// Create a channel reference
    pub fn new(community_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            community_id: community_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.community_id, self.channel_id)
    }
}

/// Stable identifier of a call participant.
///
/// Ordering is plain byte comparison of the inner string. The offerer of
/// every peer link is the lexicographically smaller participant, so both
/// sides of a link derive the same role without coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Create a participant id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Roster entry for one participant in a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    /// Participant identity
    pub id: ParticipantId,
    /// Human-readable name for UI projection
    pub display_name: String,
    /// Last published media state
    pub media_state: MediaState,
}

/// Which half of an SDP exchange a payload carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    /// Session description offer
    Offer,
    /// Session description answer
    Answer,
}

/// Inbound event for one voice channel.
///
/// Every variant is scoped by a [`ChannelRef`]; the session drops events
/// that do not match its active channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A participant joined the channel
    ParticipantJoined {
        /// Channel the event belongs to
        channel: ChannelRef,
        /// The joining participant
        participant: ParticipantInfo,
    },
    /// A participant left the channel
    ParticipantLeft {
        /// Channel the event belongs to
        channel: ChannelRef,
        /// The departing participant
        participant: ParticipantId,
    },
    /// A participant published a new media state
    MediaStateChanged {
        /// Channel the event belongs to
        channel: ChannelRef,
        /// The participant whose state changed
        participant: ParticipantId,
        /// The new state
        state: MediaState,
    },
    /// An SDP offer or answer arrived
    SdpReceived {
        /// Channel the event belongs to
        channel: ChannelRef,
        /// Sender of the description
        from: ParticipantId,
        /// Offer or answer
        kind: SdpKind,
        /// Raw SDP text
        sdp: String,
    },
    /// A remote ICE candidate arrived
    CandidateReceived {
        /// Channel the event belongs to
        channel: ChannelRef,
        /// Sender of the candidate
        from: ParticipantId,
        /// Candidate attribute line
        candidate: String,
        /// Media section id the candidate belongs to
        sdp_mid: Option<String>,
        /// Media section index the candidate belongs to
        sdp_mline_index: Option<u16>,
    },
}

impl ChannelEvent {
    /// The channel this event is scoped to
    pub fn channel(&self) -> &ChannelRef {
        match self {
            ChannelEvent::ParticipantJoined { channel, .. }
            | ChannelEvent::ParticipantLeft { channel, .. }
            | ChannelEvent::MediaStateChanged { channel, .. }
            | ChannelEvent::SdpReceived { channel, .. }
            | ChannelEvent::CandidateReceived { channel, .. } => channel,
        }
    }
}

/// Outbound signaling transport.
///
/// Sends are fire-and-forget from the engine's point of view: a failure is
/// logged and the affected link recovers through the normal ICE machinery,
/// it is never retried here.
#[async_trait]
pub trait SignalingSink: Send + Sync {
    /// Send an SDP offer or answer to one participant
    async fn send_sdp(
        &self,
        channel: &ChannelRef,
        to: &ParticipantId,
        kind: SdpKind,
        sdp: &str,
    ) -> Result<()>;

    /// Send a local ICE candidate to one participant
    async fn send_candidate(
        &self,
        channel: &ChannelRef,
        to: &ParticipantId,
        candidate: &RTCIceCandidateInit,
    ) -> Result<()>;
}

/// Channel membership service
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Current roster of a channel, queried once at join time
    async fn participants(&self, channel: &ChannelRef) -> Result<Vec<ParticipantInfo>>;

    /// Publish the local participant's media state to the channel
    async fn publish_media_state(&self, channel: &ChannelRef, state: &MediaState) -> Result<()>;

    /// Announce that the local participant left the channel
    async fn announce_leave(&self, channel: &ChannelRef) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_id_ordering_is_lexicographic() {
        let a = ParticipantId::new("alice");
        let b = ParticipantId::new("bob");
        let z = ParticipantId::new("zed");
        assert!(a < b);
        assert!(b < z);
        assert!(!(z < a));
        // uppercase sorts before lowercase in byte order
        assert!(ParticipantId::new("Zed") < a);
    }

    #[test]
    fn test_channel_ref_display() {
        let channel = ChannelRef::new("acme", "general-voice");
        assert_eq!(channel.to_string(), "acme/general-voice");
    }

    #[test]
    fn test_event_channel_accessor() {
        let channel = ChannelRef::new("acme", "voice");
        let event = ChannelEvent::ParticipantLeft {
            channel: channel.clone(),
            participant: ParticipantId::new("bob"),
        };
        assert_eq!(event.channel(), &channel);
    }
}

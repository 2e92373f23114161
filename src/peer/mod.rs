//! Peer link management: one WebRTC connection per remote participant

pub mod link;
pub mod negotiation;

pub use link::{LinkEvent, PeerLink};
pub use negotiation::{
    should_offer, CandidateBuffer, LinkHealth, LinkPhase, PolicyAction, RestartPolicy,
};

//! Pure negotiation policy: offer-role selection, candidate buffering,
//! and the ICE restart state machine
//!
//! Everything in this module is synchronous and side-effect free so the
//! rules can be tested without a peer connection.

use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::signaling::ParticipantId;

/// Decide which side of a link creates the offer.
///
/// The lexicographically smaller participant offers. Both ends evaluate
/// this with their arguments swapped and reach opposite answers, so exactly
/// one side offers and no glare is possible between correct peers.
pub fn should_offer(local: &ParticipantId, remote: &ParticipantId) -> bool {
    local < remote
}

/// Buffer for remote ICE candidates that arrive before the remote
/// description is set.
///
/// Applying a candidate before `setRemoteDescription` fails, so early
/// candidates are held and drained exactly once, in arrival order, when the
/// description lands. Later candidates pass straight through.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<RTCIceCandidateInit>,
    remote_set: bool,
}

impl CandidateBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a candidate to the buffer.
    ///
    /// Returns the candidate back when it can be applied immediately, or
    /// `None` when it was queued.
    pub fn accept(&mut self, candidate: RTCIceCandidateInit) -> Option<RTCIceCandidateInit> {
        if self.remote_set {
            Some(candidate)
        } else {
            self.pending.push(candidate);
            None
        }
    }

    /// Mark the remote description as set and drain the queue.
    ///
    /// Candidates come back in arrival order. Calling this again later
    /// returns an empty vector.
    pub fn remote_description_set(&mut self) -> Vec<RTCIceCandidateInit> {
        self.remote_set = true;
        std::mem::take(&mut self.pending)
    }

    /// Number of queued candidates
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True while candidates are still being queued
    pub fn is_buffering(&self) -> bool {
        !self.remote_set
    }
}

/// Connectivity phase of one peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// Connected, or still performing the initial connection
    Stable,
    /// ICE reported disconnected; a grace timer is running
    DisconnectPending,
    /// An ICE restart offer is in flight
    Restarting,
    /// Restart budget spent; the link is unrecoverable
    Failed,
}

/// Health of a link as seen by mesh quality aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    /// Never connected yet
    Connecting,
    /// Connected and stable
    Healthy,
    /// Disconnected or restarting
    Degraded,
    /// Unrecoverable
    Failed,
}

/// What the caller must do after feeding an event into [`RestartPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Nothing
    None,
    /// Start the disconnect grace timer with this generation
    ArmTimer(u64),
    /// Send an ICE restart offer now
    Restart,
    /// The restart budget is spent; tear the link down
    GiveUp,
}

/// ICE restart decision machine for one link.
///
/// A transient disconnect gets a grace period before any restart; a hard
/// failure restarts immediately. Attempts are capped, and a successful
/// reconnection refills the budget. Timer generations make a grace timer
/// that outlived its disconnect harmless.
#[derive(Debug)]
pub struct RestartPolicy {
    phase: LinkPhase,
    attempts: u32,
    max_attempts: u32,
    timer_generation: u64,
    ever_connected: bool,
}

impl RestartPolicy {
    /// Create a policy with the given restart budget
    pub fn new(max_attempts: u32) -> Self {
        Self {
            phase: LinkPhase::Stable,
            attempts: 0,
            max_attempts,
            timer_generation: 0,
            ever_connected: false,
        }
    }

    /// Current phase
    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    /// Restart attempts made since the last successful connection
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether this link has ever reached a connected ICE state
    pub fn ever_connected(&self) -> bool {
        self.ever_connected
    }

    /// Health classification for quality aggregation
    pub fn health(&self) -> LinkHealth {
        match self.phase {
            LinkPhase::Stable => {
                if self.ever_connected {
                    LinkHealth::Healthy
                } else {
                    LinkHealth::Connecting
                }
            }
            LinkPhase::DisconnectPending | LinkPhase::Restarting => LinkHealth::Degraded,
            LinkPhase::Failed => LinkHealth::Failed,
        }
    }

    /// ICE reached connected or completed
    pub fn on_connected(&mut self) -> PolicyAction {
        self.ever_connected = true;
        self.attempts = 0;
        self.timer_generation += 1;
        self.phase = LinkPhase::Stable;
        PolicyAction::None
    }

    /// ICE reported disconnected
    pub fn on_disconnected(&mut self) -> PolicyAction {
        match self.phase {
            LinkPhase::Stable => {
                self.phase = LinkPhase::DisconnectPending;
                self.timer_generation += 1;
                PolicyAction::ArmTimer(self.timer_generation)
            }
            // already waiting, restarting, or given up
            _ => PolicyAction::None,
        }
    }

    /// ICE reported failed; no grace period applies
    pub fn on_failed(&mut self) -> PolicyAction {
        self.escalate()
    }

    /// The disconnect grace timer fired.
    ///
    /// A fire from a stale generation, or one arriving after the link
    /// recovered, does nothing.
    pub fn on_timer_fired(&mut self, generation: u64) -> PolicyAction {
        if generation != self.timer_generation || self.phase != LinkPhase::DisconnectPending {
            return PolicyAction::None;
        }
        self.escalate()
    }

    fn escalate(&mut self) -> PolicyAction {
        if self.phase == LinkPhase::Failed {
            return PolicyAction::None;
        }
        self.timer_generation += 1;
        if self.attempts >= self.max_attempts {
            self.phase = LinkPhase::Failed;
            PolicyAction::GiveUp
        } else {
            self.attempts += 1;
            self.phase = LinkPhase::Restarting;
            PolicyAction::Restart
        }
    }
}

//! A single peer-to-peer connection inside the mesh
//!
//! One [`PeerLink`] owns one `RTCPeerConnection` from creation to close.
//! Library callbacks do no work themselves; they forward [`LinkEvent`]s
//! into the session loop, which drives the link single-threaded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::media::TrackSlot;
use crate::peer::negotiation::{
    should_offer, CandidateBuffer, LinkHealth, PolicyAction, RestartPolicy,
};
use crate::signaling::{codec, ParticipantId};

/// Event emitted by a link into the session loop
pub enum LinkEvent {
    /// The ICE connection state of a link changed
    IceStateChanged {
        /// Remote participant of the link
        peer: ParticipantId,
        /// New ICE connection state
        state: RTCIceConnectionState,
    },
    /// A local ICE candidate was gathered and should be sent to the peer
    LocalCandidate {
        /// Remote participant of the link
        peer: ParticipantId,
        /// The gathered candidate
        candidate: RTCIceCandidateInit,
    },
    /// A remote media track started arriving
    RemoteTrack {
        /// Remote participant of the link
        peer: ParticipantId,
        /// The incoming track
        track: Arc<TrackRemote>,
    },
    /// The disconnect grace timer for a link elapsed
    DisconnectTimerFired {
        /// Remote participant of the link
        peer: ParticipantId,
        /// Timer generation, checked against the restart policy
        generation: u64,
    },
}

/// One WebRTC connection to a remote participant
pub struct PeerLink {
    peer_id: ParticipantId,
    connection_id: String,
    pc: Arc<RTCPeerConnection>,
    offerer: bool,
    candidates: CandidateBuffer,
    policy: RestartPolicy,
    senders: HashMap<TrackSlot, Arc<RTCRtpSender>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    timer: Option<JoinHandle<()>>,
    negotiation_failures: u32,
    negotiation_failure_limit: u32,
    grace: Duration,
    closed: bool,
}

impl PeerLink {
    /// Create a link to `peer_id` and register its callbacks.
    ///
    /// The offerer role is derived from the two participant ids and never
    /// changes for the lifetime of the link.
    pub async fn new(
        local_id: &ParticipantId,
        peer_id: ParticipantId,
        config: &CallConfig,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::WebRtc(format!("failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![RTCIceServer {
            urls: config.stun_servers.clone(),
            ..Default::default()
        }];
        for turn in &config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::WebRtc(format!("failed to create peer connection: {}", e)))?,
        );

        let connection_id = Uuid::new_v4().to_string();
        let offerer = should_offer(local_id, &peer_id);

        let tx = events.clone();
        let pid = peer_id.clone();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            let pid = pid.clone();
            Box::pin(async move {
                let _ = tx.send(LinkEvent::IceStateChanged { peer: pid, state });
            })
        }));

        let tx = events.clone();
        let pid = peer_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            let pid = pid.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(LinkEvent::LocalCandidate {
                                peer: pid,
                                candidate: init,
                            });
                        }
                        Err(e) => {
                            warn!(peer = %pid, error = %e, "failed to serialize local ICE candidate");
                        }
                    }
                }
            })
        }));

        let tx = events.clone();
        let pid = peer_id.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            let pid = pid.clone();
            Box::pin(async move {
                let _ = tx.send(LinkEvent::RemoteTrack { peer: pid, track });
            })
        }));

        info!(
            peer = %peer_id,
            connection = %connection_id,
            offerer,
            "created peer link"
        );

        Ok(Self {
            peer_id,
            connection_id,
            pc,
            offerer,
            candidates: CandidateBuffer::new(),
            policy: RestartPolicy::new(config.max_ice_restarts),
            senders: HashMap::new(),
            events,
            timer: None,
            negotiation_failures: 0,
            negotiation_failure_limit: config.negotiation_failure_limit,
            grace: config.disconnect_grace(),
            closed: false,
        })
    }

    /// Remote participant of this link
    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    /// Unique id of this connection instance
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Whether the local side creates offers on this link
    pub fn is_offerer(&self) -> bool {
        self.offerer
    }

    /// Health classification for quality aggregation
    pub fn health(&self) -> LinkHealth {
        self.policy.health()
    }

    /// Number of remote candidates still waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.candidates.pending_len()
    }

    /// Create an offer, install it as the local description, and return
    /// its SDP. Candidates trickle separately through
    /// [`LinkEvent::LocalCandidate`].
    pub async fn create_offer(&mut self) -> Result<String> {
        self.create_offer_inner(None).await
    }

    /// Create an offer that forces an ICE restart
    pub async fn create_restart_offer(&mut self) -> Result<String> {
        self.create_offer_inner(Some(RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        }))
        .await
    }

    async fn create_offer_inner(&mut self, options: Option<RTCOfferOptions>) -> Result<String> {
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| Error::Negotiation(format!("failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Negotiation(format!("failed to set local offer: {}", e)))?;
        let description = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Negotiation("local description missing after offer".to_string()))?;
        debug!(peer = %self.peer_id, "created offer");
        Ok(description.sdp)
    }

    /// Apply a remote offer and return the answer SDP
    pub async fn handle_offer(&mut self, sdp: &str) -> Result<String> {
        let offer = codec::offer_description(sdp)?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::Negotiation(format!("failed to set remote offer: {}", e)))?;
        self.flush_candidates().await;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("failed to create answer: {}", e)))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Negotiation(format!("failed to set local answer: {}", e)))?;
        let description = self.pc.local_description().await.ok_or_else(|| {
            Error::Negotiation("local description missing after answer".to_string())
        })?;
        debug!(peer = %self.peer_id, "answered remote offer");
        Ok(description.sdp)
    }

    /// Apply a remote answer to a previously sent offer
    pub async fn handle_answer(&mut self, sdp: &str) -> Result<()> {
        let answer = codec::answer_description(sdp)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::Negotiation(format!("failed to set remote answer: {}", e)))?;
        self.flush_candidates().await;
        debug!(peer = %self.peer_id, "applied remote answer");
        Ok(())
    }

    /// Apply or buffer a remote ICE candidate.
    ///
    /// A single bad candidate is logged and dropped; the link keeps its
    /// remaining candidates and its state.
    pub async fn handle_candidate(&mut self, init: RTCIceCandidateInit) {
        match self.candidates.accept(init) {
            Some(init) => {
                if let Err(e) = self.pc.add_ice_candidate(init).await {
                    warn!(peer = %self.peer_id, error = %e, "ignoring bad ICE candidate");
                }
            }
            None => {
                debug!(
                    peer = %self.peer_id,
                    pending = self.candidates.pending_len(),
                    "buffered ICE candidate until remote description is set"
                );
            }
        }
    }

    async fn flush_candidates(&mut self) {
        for init in self.candidates.remote_description_set() {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!(peer = %self.peer_id, error = %e, "dropping buffered ICE candidate");
            }
        }
    }

    /// Reconcile attached senders against the desired local track set.
    ///
    /// A slot that already has a sender gets its track swapped in place; a
    /// missing microphone or camera is detached but keeps its sender so the
    /// toggle never forces renegotiation. Screen capture adds and removes
    /// its sender. Returns true when the change needs a new offer/answer
    /// exchange.
    pub async fn update_tracks(
        &mut self,
        desired: &[(TrackSlot, Arc<dyn TrackLocal + Send + Sync>)],
    ) -> Result<bool> {
        let mut topology_changed = false;
        for slot in TrackSlot::ALL {
            let wanted = desired
                .iter()
                .find(|(s, _)| *s == slot)
                .map(|(_, track)| track.clone());
            let attached = self.senders.get(&slot).cloned();
            match (wanted, attached) {
                (Some(track), Some(sender)) => {
                    sender.replace_track(Some(track)).await.map_err(|e| {
                        Error::WebRtc(format!("failed to replace {} track: {}", slot.as_str(), e))
                    })?;
                }
                (Some(track), None) => {
                    let sender = self.pc.add_track(track).await.map_err(|e| {
                        Error::WebRtc(format!("failed to add {} track: {}", slot.as_str(), e))
                    })?;
                    self.senders.insert(slot, sender);
                    topology_changed = true;
                    debug!(peer = %self.peer_id, slot = slot.as_str(), "attached local track");
                }
                (None, Some(sender)) => {
                    if slot == TrackSlot::Screen {
                        self.pc.remove_track(&sender).await.map_err(|e| {
                            Error::WebRtc(format!("failed to remove screen track: {}", e))
                        })?;
                        self.senders.remove(&slot);
                        topology_changed = true;
                        debug!(peer = %self.peer_id, "removed screen sender");
                    } else {
                        sender.replace_track(None).await.map_err(|e| {
                            Error::WebRtc(format!(
                                "failed to detach {} track: {}",
                                slot.as_str(),
                                e
                            ))
                        })?;
                    }
                }
                (None, None) => {}
            }
        }
        Ok(topology_changed)
    }

    /// Feed an ICE connection state change into the restart policy
    pub fn on_ice_state(&mut self, state: RTCIceConnectionState) -> PolicyAction {
        match state {
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                self.negotiation_failures = 0;
                self.cancel_timer();
                self.policy.on_connected()
            }
            RTCIceConnectionState::Disconnected => {
                let action = self.policy.on_disconnected();
                if let PolicyAction::ArmTimer(generation) = action {
                    self.arm_timer(generation);
                }
                action
            }
            RTCIceConnectionState::Failed => {
                self.cancel_timer();
                self.policy.on_failed()
            }
            _ => PolicyAction::None,
        }
    }

    /// Feed a grace timer fire into the restart policy
    pub fn on_timer_fired(&mut self, generation: u64) -> PolicyAction {
        self.policy.on_timer_fired(generation)
    }

    /// Record a failed offer/answer exchange.
    ///
    /// Persistent negotiation failure is escalated like an ICE failure once
    /// the configured limit is reached.
    pub fn record_negotiation_failure(&mut self) -> PolicyAction {
        self.negotiation_failures += 1;
        if self.negotiation_failures >= self.negotiation_failure_limit {
            warn!(
                peer = %self.peer_id,
                failures = self.negotiation_failures,
                "persistent negotiation failure, escalating"
            );
            self.negotiation_failures = 0;
            self.cancel_timer();
            self.policy.on_failed()
        } else {
            PolicyAction::None
        }
    }

    /// Record a completed offer/answer exchange
    pub fn record_negotiation_success(&mut self) {
        self.negotiation_failures = 0;
    }

    fn arm_timer(&mut self, generation: u64) {
        self.cancel_timer();
        let tx = self.events.clone();
        let peer = self.peer_id.clone();
        let grace = self.grace;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(LinkEvent::DisconnectTimerFired { peer, generation });
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }

    /// Close the link.
    ///
    /// Callbacks are replaced with no-ops before the connection is closed so
    /// nothing fires into the session afterwards. Safe to call more than
    /// once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel_timer();

        self.pc
            .on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));

        if let Err(e) = self.pc.close().await {
            warn!(peer = %self.peer_id, error = %e, "error closing peer connection");
        }
        info!(peer = %self.peer_id, connection = %self.connection_id, "peer link closed");
    }
}

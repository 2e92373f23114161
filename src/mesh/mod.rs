//! Full-mesh connection management for one voice channel
//!
//! One [`MeshManager`] exists per active call. It keeps one [`PeerLink`]
//! per remote participant, routes signaling to the right link, reconciles
//! local tracks across every link, and derives an aggregate quality for
//! the session.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::media::{MediaState, TrackSlot};
use crate::peer::link::{LinkEvent, PeerLink};
use crate::peer::negotiation::{LinkHealth, PolicyAction};
use crate::signaling::{codec, ChannelRef, ParticipantId, ParticipantInfo, SdpKind, SignalingSink};

/// Aggregate connectivity of the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshQuality {
    /// No link has connected yet
    Connecting,
    /// Every live link is stable
    Good,
    /// At least one link is disconnected or restarting
    Degraded,
    /// Links have failed and nothing is healthy
    Failed,
}

impl fmt::Display for MeshQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MeshQuality::Connecting => "connecting",
            MeshQuality::Good => "good",
            MeshQuality::Degraded => "degraded",
            MeshQuality::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one remote participant for UI projection
#[derive(Clone)]
pub struct ParticipantSnapshot {
    /// Roster entry
    pub info: ParticipantInfo,
    /// Remote tracks currently arriving from this participant
    pub tracks: Vec<Arc<TrackRemote>>,
    /// False once the link to this participant failed permanently
    pub reachable: bool,
}

/// Items held under a string id, newest insert wins.
///
/// Renegotiation re-announces a remote track under its existing id, so
/// keyed storage keeps exactly one handle per id instead of accumulating
/// one per announcement.
#[derive(Debug, Clone)]
struct TrackTable<T> {
    by_id: BTreeMap<String, T>,
}

impl<T> Default for TrackTable<T> {
    fn default() -> Self {
        Self {
            by_id: BTreeMap::new(),
        }
    }
}

impl<T: Clone> TrackTable<T> {
    fn insert(&mut self, id: String, item: T) {
        self.by_id.insert(id, item);
    }

    fn items(&self) -> Vec<T> {
        self.by_id.values().cloned().collect()
    }
}

/// Manages every peer link of one call
pub struct MeshManager {
    local_id: ParticipantId,
    channel: ChannelRef,
    config: CallConfig,
    sink: Arc<dyn SignalingSink>,
    links: HashMap<ParticipantId, PeerLink>,
    participants: HashMap<ParticipantId, ParticipantInfo>,
    remote_tracks: HashMap<ParticipantId, TrackTable<Arc<TrackRemote>>>,
    failed_peers: HashSet<ParticipantId>,
    current_tracks: Vec<(TrackSlot, Arc<dyn TrackLocal + Send + Sync>)>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
}

impl MeshManager {
    /// Create a mesh for one channel.
    ///
    /// `link_events` is the channel every link's callbacks feed into; the
    /// session loop pumps it back through [`MeshManager::handle_link_event`].
    pub fn new(
        local_id: ParticipantId,
        channel: ChannelRef,
        config: CallConfig,
        sink: Arc<dyn SignalingSink>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            local_id,
            channel,
            config,
            sink,
            links: HashMap::new(),
            participants: HashMap::new(),
            remote_tracks: HashMap::new(),
            failed_peers: HashSet::new(),
            current_tracks: Vec::new(),
            link_events,
        }
    }

    /// Channel this mesh serves
    pub fn channel(&self) -> &ChannelRef {
        &self.channel
    }

    /// Number of live links
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Connect to every participant in the join-time roster
    pub async fn join(&mut self, roster: Vec<ParticipantInfo>) -> Result<()> {
        info!(channel = %self.channel, peers = roster.len(), "joining mesh");
        for info in roster {
            if info.id == self.local_id {
                continue;
            }
            self.participant_joined(info).await?;
        }
        Ok(())
    }

    /// A participant joined the channel.
    ///
    /// Idempotent: a duplicate join keeps the existing link untouched.
    pub async fn participant_joined(&mut self, info: ParticipantInfo) -> Result<()> {
        if info.id == self.local_id {
            return Ok(());
        }
        let peer = info.id.clone();
        self.participants.insert(peer.clone(), info);
        self.failed_peers.remove(&peer);

        if self.links.contains_key(&peer) {
            debug!(peer = %peer, "duplicate join, keeping existing link");
            return Ok(());
        }

        let mut link = PeerLink::new(
            &self.local_id,
            peer.clone(),
            &self.config,
            self.link_events.clone(),
        )
        .await?;
        if !self.current_tracks.is_empty() {
            link.update_tracks(&self.current_tracks).await?;
        }
        let offerer = link.is_offerer();
        self.links.insert(peer.clone(), link);

        if offerer {
            self.send_offer(&peer).await;
        }
        Ok(())
    }

    /// A participant left the channel; tear its link down
    pub async fn participant_left(&mut self, peer: &ParticipantId) {
        self.participants.remove(peer);
        self.remote_tracks.remove(peer);
        self.failed_peers.remove(peer);
        if let Some(mut link) = self.links.remove(peer) {
            link.close().await;
            info!(peer = %peer, "removed link for departed participant");
        }
    }

    /// A participant published a new media state.
    ///
    /// Pure bookkeeping; the connection is untouched.
    pub fn media_state_changed(&mut self, peer: &ParticipantId, state: MediaState) {
        match self.participants.get_mut(peer) {
            Some(info) => info.media_state = state,
            None => debug!(peer = %peer, "media state for unknown participant ignored"),
        }
    }

    /// Route an inbound SDP payload to its link.
    ///
    /// An offer may race ahead of the membership event; the link is created
    /// on demand in that case. Malformed payloads are logged and dropped
    /// without touching link state.
    pub async fn handle_sdp(&mut self, from: &ParticipantId, kind: SdpKind, sdp: &str) {
        if !self.links.contains_key(from) {
            if kind == SdpKind::Answer {
                warn!(peer = %from, "answer for unknown link dropped");
                return;
            }
            // offer arrived before the join event
            if !self.ensure_link(from).await {
                return;
            }
        }

        match kind {
            SdpKind::Offer => {
                if let Some(link) = self.links.get(from) {
                    if link.is_offerer() {
                        warn!(peer = %from, "dropping offer from the answering side");
                        return;
                    }
                }
                let result = match self.links.get_mut(from) {
                    Some(link) => link.handle_offer(sdp).await,
                    None => return,
                };
                match result {
                    Ok(answer) => {
                        if let Some(link) = self.links.get_mut(from) {
                            link.record_negotiation_success();
                        }
                        if let Err(e) = self
                            .sink
                            .send_sdp(&self.channel, from, SdpKind::Answer, &answer)
                            .await
                        {
                            warn!(peer = %from, error = %e, "failed to send answer");
                        }
                    }
                    Err(e) => self.note_sdp_failure(from, e).await,
                }
            }
            SdpKind::Answer => {
                let result = match self.links.get_mut(from) {
                    Some(link) => link.handle_answer(sdp).await,
                    None => return,
                };
                match result {
                    Ok(()) => {
                        if let Some(link) = self.links.get_mut(from) {
                            link.record_negotiation_success();
                        }
                    }
                    Err(e) => self.note_sdp_failure(from, e).await,
                }
            }
        }
    }

    async fn note_sdp_failure(&mut self, peer: &ParticipantId, error: Error) {
        if matches!(error, Error::SignalingDecode(_)) {
            warn!(peer = %peer, error = %error, "malformed sdp payload dropped");
            return;
        }
        warn!(peer = %peer, error = %error, "negotiation failed");
        let action = match self.links.get_mut(peer) {
            Some(link) => link.record_negotiation_failure(),
            None => return,
        };
        self.apply_policy_action(peer, action).await;
    }

    /// Route an inbound ICE candidate to its link.
    ///
    /// The transport may reorder payloads, so a candidate can land before
    /// the offer that introduces its peer. The link is created on demand and
    /// buffers the candidate until a remote description arrives.
    pub async fn handle_candidate(
        &mut self,
        from: &ParticipantId,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) {
        if !self.links.contains_key(from) && !self.ensure_link(from).await {
            return;
        }
        let init = codec::candidate_init(&candidate, sdp_mid, sdp_mline_index);
        if let Some(link) = self.links.get_mut(from) {
            link.handle_candidate(init).await;
        }
    }

    /// Create a link for a peer whose signaling raced ahead of its join
    /// event. Returns false when creation failed.
    async fn ensure_link(&mut self, from: &ParticipantId) -> bool {
        let info = self.participants.get(from).cloned().unwrap_or_else(|| {
            ParticipantInfo {
                id: from.clone(),
                display_name: String::new(),
                media_state: MediaState::default(),
            }
        });
        if let Err(e) = self.participant_joined(info).await {
            warn!(peer = %from, error = %e, "failed to create link for early signaling");
            return false;
        }
        self.links.contains_key(from)
    }

    /// Apply a new desired local track set to every link.
    ///
    /// Links whose topology changed renegotiate: the offerer side sends a
    /// fresh offer, the answerer side carries the change in its next answer.
    pub async fn broadcast_tracks(
        &mut self,
        desired: Vec<(TrackSlot, Arc<dyn TrackLocal + Send + Sync>)>,
    ) {
        self.current_tracks = desired;
        let peers: Vec<ParticipantId> = self.links.keys().cloned().collect();
        for peer in peers {
            let outcome = match self.links.get_mut(&peer) {
                Some(link) => {
                    let offerer = link.is_offerer();
                    link.update_tracks(&self.current_tracks)
                        .await
                        .map(|changed| (changed, offerer))
                }
                None => continue,
            };
            match outcome {
                Ok((true, true)) => self.send_offer(&peer).await,
                Ok((true, false)) => {
                    debug!(peer = %peer, "track change waits for the next remote offer");
                }
                Ok((false, _)) => {}
                Err(e) => warn!(peer = %peer, error = %e, "failed to update tracks"),
            }
        }
    }

    /// Handle an event emitted by one of the links
    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::IceStateChanged { peer, state } => {
                debug!(peer = %peer, ?state, "ICE connection state changed");
                let action = match self.links.get_mut(&peer) {
                    Some(link) => link.on_ice_state(state),
                    None => return,
                };
                self.apply_policy_action(&peer, action).await;
            }
            LinkEvent::DisconnectTimerFired { peer, generation } => {
                let action = match self.links.get_mut(&peer) {
                    Some(link) => link.on_timer_fired(generation),
                    None => return,
                };
                self.apply_policy_action(&peer, action).await;
            }
            LinkEvent::LocalCandidate { peer, candidate } => {
                if let Err(e) = self.sink.send_candidate(&self.channel, &peer, &candidate).await {
                    warn!(peer = %peer, error = %e, "failed to send ICE candidate");
                }
            }
            LinkEvent::RemoteTrack { peer, track } => {
                info!(peer = %peer, kind = %track.kind(), id = %track.id(), "remote track received");
                self.remote_tracks
                    .entry(peer)
                    .or_default()
                    .insert(track.id(), track);
            }
        }
    }

    async fn send_offer(&mut self, peer: &ParticipantId) {
        let result = match self.links.get_mut(peer) {
            Some(link) => link.create_offer().await,
            None => return,
        };
        match result {
            Ok(sdp) => {
                if let Err(e) = self
                    .sink
                    .send_sdp(&self.channel, peer, SdpKind::Offer, &sdp)
                    .await
                {
                    warn!(peer = %peer, error = %e, "failed to send offer");
                }
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "offer creation failed");
                let action = match self.links.get_mut(peer) {
                    Some(link) => link.record_negotiation_failure(),
                    None => return,
                };
                self.apply_policy_action(peer, action).await;
            }
        }
    }

    async fn apply_policy_action(&mut self, peer: &ParticipantId, mut action: PolicyAction) {
        // restart attempts that fail immediately loop back through the
        // policy, bounded by its attempt budget
        loop {
            match action {
                PolicyAction::None | PolicyAction::ArmTimer(_) => return,
                PolicyAction::GiveUp => {
                    self.fail_link(peer).await;
                    return;
                }
                PolicyAction::Restart => {
                    // the glare rule holds for restarts too: the answering
                    // side would see its restart offer dropped by the peer,
                    // so it waits for the offerer to renegotiate
                    match self.links.get(peer) {
                        Some(link) if !link.is_offerer() => {
                            debug!(peer = %peer, "degraded link waits for the offering side to restart");
                            return;
                        }
                        Some(_) => {}
                        None => return,
                    }
                    info!(peer = %peer, "attempting ICE restart");
                    let result = match self.links.get_mut(peer) {
                        Some(link) => link.create_restart_offer().await,
                        None => return,
                    };
                    match result {
                        Ok(sdp) => {
                            if let Err(e) = self
                                .sink
                                .send_sdp(&self.channel, peer, SdpKind::Offer, &sdp)
                                .await
                            {
                                warn!(peer = %peer, error = %e, "failed to send restart offer");
                            }
                            return;
                        }
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "restart offer failed");
                            action = match self.links.get_mut(peer) {
                                Some(link) => link.record_negotiation_failure(),
                                None => return,
                            };
                        }
                    }
                }
            }
        }
    }

    async fn fail_link(&mut self, peer: &ParticipantId) {
        let err = Error::RestartsExhausted(peer.to_string());
        warn!(peer = %peer, error = %err, "removing unrecoverable link");
        self.failed_peers.insert(peer.clone());
        self.remote_tracks.remove(peer);
        if let Some(mut link) = self.links.remove(peer) {
            link.close().await;
        }
    }

    /// Aggregate quality of the mesh.
    ///
    /// A solo call is good. A still-connecting late joiner does not drag an
    /// established call below good; degradation comes only from links that
    /// lost a connection they had.
    pub fn quality(&self) -> MeshQuality {
        let healths: Vec<LinkHealth> = self.links.values().map(|l| l.health()).collect();
        let any_healthy = healths.iter().any(|h| *h == LinkHealth::Healthy);

        if !self.failed_peers.is_empty() && !any_healthy {
            return MeshQuality::Failed;
        }
        if healths.iter().any(|h| *h == LinkHealth::Degraded) {
            return MeshQuality::Degraded;
        }
        if healths.is_empty() {
            return MeshQuality::Good;
        }
        if healths.iter().all(|h| *h == LinkHealth::Healthy) || any_healthy {
            return MeshQuality::Good;
        }
        MeshQuality::Connecting
    }

    /// Remote participants with their tracks, for UI projection
    pub fn participant_snapshots(&self) -> Vec<ParticipantSnapshot> {
        let mut snapshots: Vec<ParticipantSnapshot> = self
            .participants
            .values()
            .map(|info| ParticipantSnapshot {
                info: info.clone(),
                tracks: self
                    .remote_tracks
                    .get(&info.id)
                    .map(TrackTable::items)
                    .unwrap_or_default(),
                reachable: !self.failed_peers.contains(&info.id),
            })
            .collect();
        snapshots.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        snapshots
    }

    /// Close every link and clear all state
    pub async fn close_all(&mut self) {
        for (_, mut link) in self.links.drain() {
            link.close().await;
        }
        self.participants.clear();
        self.remote_tracks.clear();
        self.failed_peers.clear();
        self.current_tracks.clear();
        info!(channel = %self.channel, "mesh closed");
    }
}

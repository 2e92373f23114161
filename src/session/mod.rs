//! Call session lifecycle: one active voice channel per session
//!
//! [`CallSession`] ties the mesh, local media, and the external
//! collaborators together behind a small state machine. It is driven from
//! a single task (see [`driver`]); every handler runs to completion before
//! the next event is taken, so no internal locking is needed.

pub mod driver;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::CallConfig;
use crate::error::Result;
use crate::media::{LocalTracks, MediaSource, MediaState, MediaToggles};
use crate::mesh::{MeshManager, MeshQuality, ParticipantSnapshot};
use crate::peer::link::LinkEvent;
use crate::signaling::{ChannelDirectory, ChannelEvent, ChannelRef, ParticipantId, SignalingSink};

pub use driver::{run_call, CallCommand, CallHandle};

/// Lifecycle state of the call session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Not in a call
    Idle,
    /// Acquiring media and building the mesh
    Connecting,
    /// In a call with a good mesh
    Connected,
    /// In a call but at least one link is recovering
    Degraded,
    /// The call ended abnormally; `retry` or `leave` apply
    Error(String),
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallState::Idle => f.write_str("idle"),
            CallState::Connecting => f.write_str("connecting"),
            CallState::Connected => f.write_str("connected"),
            CallState::Degraded => f.write_str("degraded"),
            CallState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Reactive projection of the whole call for UI consumption
#[derive(Clone)]
pub struct CallSnapshot {
    /// Session state
    pub state: CallState,
    /// Active channel, if any
    pub channel: Option<ChannelRef>,
    /// Local media toggles as published
    pub local_media: MediaState,
    /// Remote participants with their tracks
    pub participants: Vec<ParticipantSnapshot>,
}

impl CallSnapshot {
    /// Snapshot of a session that is not in a call
    pub fn idle() -> Self {
        Self {
            state: CallState::Idle,
            channel: None,
            local_media: MediaState::default(),
            participants: Vec::new(),
        }
    }
}

/// Internal event re-entering the session loop from a spawned task
pub enum InternalEvent {
    /// Media acquisition for a join finished
    MediaReady {
        /// Session epoch the acquisition belongs to
        epoch: u64,
        /// Channel the join targeted
        channel: ChannelRef,
        /// The acquired tracks, or the acquisition error
        result: Result<LocalTracks>,
    },
}

/// One user's call session
pub struct CallSession {
    local_id: ParticipantId,
    config: CallConfig,
    sink: Arc<dyn SignalingSink>,
    directory: Arc<dyn ChannelDirectory>,
    media: Arc<dyn MediaSource>,
    state: CallState,
    channel: Option<ChannelRef>,
    last_channel: Option<ChannelRef>,
    epoch: u64,
    toggles: MediaToggles,
    tracks: LocalTracks,
    mesh: Option<MeshManager>,
    pending_events: Vec<ChannelEvent>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    internal_events: mpsc::UnboundedSender<InternalEvent>,
    snapshots: watch::Sender<CallSnapshot>,
}

impl CallSession {
    /// Create a session.
    ///
    /// `link_events` and `internal_events` are the senders whose receivers
    /// the driving loop pumps back through [`CallSession::handle_link_event`]
    /// and [`CallSession::handle_internal`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: ParticipantId,
        config: CallConfig,
        sink: Arc<dyn SignalingSink>,
        directory: Arc<dyn ChannelDirectory>,
        media: Arc<dyn MediaSource>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
        internal_events: mpsc::UnboundedSender<InternalEvent>,
        snapshots: watch::Sender<CallSnapshot>,
    ) -> Self {
        Self {
            local_id,
            config,
            sink,
            directory,
            media,
            state: CallState::Idle,
            channel: None,
            last_channel: None,
            epoch: 0,
            toggles: MediaToggles::default(),
            tracks: LocalTracks::default(),
            mesh: None,
            pending_events: Vec::new(),
            link_events,
            internal_events,
            snapshots,
        }
    }

    /// Current state
    pub fn state(&self) -> &CallState {
        &self.state
    }

    /// Local participant id
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Join a voice channel.
    ///
    /// Leaves any current call first. The session goes to `Connecting`
    /// immediately; media acquisition runs in a spawned task and re-enters
    /// the loop as [`InternalEvent::MediaReady`].
    pub async fn join(&mut self, channel: ChannelRef) -> Result<()> {
        if !matches!(self.state, CallState::Idle | CallState::Error(_)) {
            self.leave().await;
        }

        self.epoch += 1;
        let epoch = self.epoch;
        self.state = CallState::Connecting;
        self.channel = Some(channel.clone());
        self.last_channel = Some(channel.clone());
        info!(channel = %channel, "joining voice channel");

        let media = self.media.clone();
        let events = self.internal_events.clone();
        tokio::spawn(async move {
            let result = media.acquire_microphone().await.map(|microphone| LocalTracks {
                microphone: Some(microphone),
                ..Default::default()
            });
            let _ = events.send(InternalEvent::MediaReady {
                epoch,
                channel,
                result,
            });
        });

        self.publish_snapshot();
        Ok(())
    }

    /// Leave the current call, from any state.
    ///
    /// Always releases every local track, closes every link, and announces
    /// the leave, then returns to `Idle`.
    pub async fn leave(&mut self) {
        self.epoch += 1;
        self.pending_events.clear();
        if let Some(mut mesh) = self.mesh.take() {
            mesh.close_all().await;
        }
        for track in self.tracks.take_all() {
            self.media.release(track).await;
        }
        self.toggles.set_video(false);
        self.toggles.set_screen_sharing(false);
        if let Some(channel) = self.channel.take() {
            if let Err(e) = self.directory.announce_leave(&channel).await {
                warn!(error = %e, "failed to announce leave");
            }
            info!(channel = %channel, "left voice channel");
        }
        self.state = CallState::Idle;
        self.publish_snapshot();
    }

    /// Re-join the last channel after an error. No-op outside `Error`.
    pub async fn retry(&mut self) -> Result<()> {
        if !matches!(self.state, CallState::Error(_)) {
            return Ok(());
        }
        match self.last_channel.clone() {
            Some(channel) => self.join(channel).await,
            None => {
                self.state = CallState::Idle;
                self.publish_snapshot();
                Ok(())
            }
        }
    }

    /// Flip the microphone mute
    pub async fn toggle_mute(&mut self) {
        let state = self.toggles.toggle_mute();
        self.after_media_change(state).await;
    }

    /// Flip deafen; deafening also mutes
    pub async fn toggle_deafen(&mut self) {
        let state = self.toggles.toggle_deafen();
        self.after_media_change(state).await;
    }

    /// Flip camera video, acquiring or releasing the camera as needed
    pub async fn toggle_video(&mut self) {
        let enable = !self.toggles.state().video_enabled;
        if enable && self.tracks.camera.is_none() {
            match self.media.acquire_camera().await {
                Ok(track) => self.tracks.camera = Some(track),
                Err(e) => {
                    warn!(error = %e, "camera acquisition failed");
                    return;
                }
            }
        }
        let state = self.toggles.set_video(enable);
        if !enable {
            if let Some(track) = self.tracks.camera.take() {
                self.media.release(track).await;
            }
        }
        self.after_media_change(state).await;
    }

    /// Flip screen sharing, acquiring or releasing the capture as needed
    pub async fn toggle_screen_share(&mut self) {
        let enable = !self.toggles.state().screen_sharing;
        if enable && self.tracks.screen.is_none() {
            match self.media.acquire_screen().await {
                Ok(track) => self.tracks.screen = Some(track),
                Err(e) => {
                    warn!(error = %e, "screen capture acquisition failed");
                    return;
                }
            }
        }
        let state = self.toggles.set_screen_sharing(enable);
        if !enable {
            if let Some(track) = self.tracks.screen.take() {
                self.media.release(track).await;
            }
        }
        self.after_media_change(state).await;
    }

    async fn after_media_change(&mut self, state: MediaState) {
        if let Some(mesh) = &mut self.mesh {
            mesh.broadcast_tracks(self.tracks.desired(&state)).await;
        }
        if let Some(channel) = self.channel.clone() {
            if let Err(e) = self.directory.publish_media_state(&channel, &state).await {
                warn!(error = %e, "failed to publish media state");
            }
        }
        self.publish_snapshot();
    }

    /// Handle an inbound channel event.
    ///
    /// Events scoped to a channel other than the active one are dropped.
    /// Events for the active channel that arrive while media is still being
    /// acquired are held and replayed once the mesh exists, so a remote
    /// offer sent during the permission prompt is not lost.
    pub async fn handle_channel_event(&mut self, event: ChannelEvent) {
        let Some(active) = self.channel.clone() else {
            return;
        };
        if event.channel() != &active {
            debug!(
                channel = %event.channel(),
                active = %active,
                "ignoring event for inactive channel"
            );
            return;
        }
        let Some(mesh) = &mut self.mesh else {
            debug!("holding channel event until the mesh is ready");
            self.pending_events.push(event);
            return;
        };
        match event {
            ChannelEvent::ParticipantJoined { participant, .. } => {
                if let Err(e) = mesh.participant_joined(participant).await {
                    warn!(error = %e, "failed to connect to joining participant");
                }
            }
            ChannelEvent::ParticipantLeft { participant, .. } => {
                mesh.participant_left(&participant).await;
            }
            ChannelEvent::MediaStateChanged {
                participant, state, ..
            } => {
                mesh.media_state_changed(&participant, state);
            }
            ChannelEvent::SdpReceived {
                from, kind, sdp, ..
            } => {
                mesh.handle_sdp(&from, kind, &sdp).await;
            }
            ChannelEvent::CandidateReceived {
                from,
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..
            } => {
                mesh.handle_candidate(&from, candidate, sdp_mid, sdp_mline_index)
                    .await;
            }
        }
        self.refresh_quality().await;
        self.publish_snapshot();
    }

    /// Handle an event emitted by a peer link
    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        if let Some(mesh) = &mut self.mesh {
            mesh.handle_link_event(event).await;
        }
        self.refresh_quality().await;
        self.publish_snapshot();
    }

    /// Handle an internal event from a spawned task
    pub async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::MediaReady {
                epoch,
                channel,
                result,
            } => self.on_media_ready(epoch, channel, result).await,
        }
    }

    async fn on_media_ready(
        &mut self,
        epoch: u64,
        channel: ChannelRef,
        result: Result<LocalTracks>,
    ) {
        if epoch != self.epoch || self.channel.as_ref() != Some(&channel) {
            // the join this acquisition belonged to was superseded
            if let Ok(mut tracks) = result {
                for track in tracks.take_all() {
                    self.media.release(track).await;
                }
                debug!(channel = %channel, "released media from a superseded join");
            }
            return;
        }

        match result {
            Ok(tracks) => {
                self.tracks = tracks;
                let mut mesh = MeshManager::new(
                    self.local_id.clone(),
                    channel.clone(),
                    self.config.clone(),
                    self.sink.clone(),
                    self.link_events.clone(),
                );

                let roster = match self.directory.participants(&channel).await {
                    Ok(roster) => roster,
                    Err(e) => {
                        self.fail_call(format!("failed to fetch channel roster: {}", e))
                            .await;
                        return;
                    }
                };

                mesh.broadcast_tracks(self.tracks.desired(&self.toggles.state()))
                    .await;
                if let Err(e) = mesh.join(roster).await {
                    self.fail_call(format!("failed to build mesh: {}", e)).await;
                    return;
                }
                self.mesh = Some(mesh);

                let state = self.toggles.state();
                if let Err(e) = self.directory.publish_media_state(&channel, &state).await {
                    warn!(error = %e, "failed to publish media state");
                }

                // replay anything that arrived while the microphone prompt
                // was open
                let held = std::mem::take(&mut self.pending_events);
                if !held.is_empty() {
                    debug!(count = held.len(), "replaying held channel events");
                }
                for event in held {
                    self.handle_channel_event(event).await;
                }

                self.refresh_quality().await;
                self.publish_snapshot();
            }
            Err(e) => {
                error!(error = %e, "media acquisition failed");
                self.fail_call(format!("could not access microphone: {}", e))
                    .await;
            }
        }
    }

    async fn refresh_quality(&mut self) {
        let quality = match &self.mesh {
            Some(mesh) => mesh.quality(),
            None => return,
        };
        let next = match (&self.state, quality) {
            (CallState::Connecting, MeshQuality::Good) => Some(CallState::Connected),
            (CallState::Connecting, MeshQuality::Degraded) => Some(CallState::Degraded),
            (CallState::Connected, MeshQuality::Degraded) => Some(CallState::Degraded),
            (CallState::Degraded, MeshQuality::Good) => Some(CallState::Connected),
            (
                CallState::Connecting | CallState::Connected | CallState::Degraded,
                MeshQuality::Failed,
            ) => Some(CallState::Error("all voice connections failed".to_string())),
            _ => None,
        };
        let Some(next) = next else { return };
        info!(from = %self.state, to = %next, "call state changed");
        match next {
            CallState::Error(reason) => self.fail_call(reason).await,
            next => self.state = next,
        }
    }

    async fn fail_call(&mut self, reason: String) {
        error!(reason = %reason, "call failed");
        self.epoch += 1;
        self.pending_events.clear();
        if let Some(mut mesh) = self.mesh.take() {
            mesh.close_all().await;
        }
        for track in self.tracks.take_all() {
            self.media.release(track).await;
        }
        self.channel = None;
        self.state = CallState::Error(reason);
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let participants = self
            .mesh
            .as_ref()
            .map(|mesh| mesh.participant_snapshots())
            .unwrap_or_default();
        let _ = self.snapshots.send(CallSnapshot {
            state: self.state.clone(),
            channel: self.channel.clone(),
            local_media: self.toggles.state(),
            participants,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::media::MediaState;
    use crate::signaling::{ParticipantInfo, SdpKind};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;
    use webrtc::api::media_engine::MIME_TYPE_OPUS;
    use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
    use webrtc::track::track_local::TrackLocal;

    #[derive(Default)]
    struct NullSink {
        sdp: Mutex<Vec<(ParticipantId, SdpKind)>>,
    }

    #[async_trait::async_trait]
    impl SignalingSink for NullSink {
        async fn send_sdp(
            &self,
            _channel: &ChannelRef,
            to: &ParticipantId,
            kind: SdpKind,
            _sdp: &str,
        ) -> Result<()> {
            self.sdp.lock().await.push((to.clone(), kind));
            Ok(())
        }

        async fn send_candidate(
            &self,
            _channel: &ChannelRef,
            _to: &ParticipantId,
            _candidate: &RTCIceCandidateInit,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeDirectory {
        roster: Mutex<Vec<ParticipantInfo>>,
        published: Mutex<Vec<MediaState>>,
        left: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ChannelDirectory for FakeDirectory {
        async fn participants(&self, _channel: &ChannelRef) -> Result<Vec<ParticipantInfo>> {
            Ok(self.roster.lock().await.clone())
        }

        async fn publish_media_state(
            &self,
            _channel: &ChannelRef,
            state: &MediaState,
        ) -> Result<()> {
            self.published.lock().await.push(*state);
            Ok(())
        }

        async fn announce_leave(&self, _channel: &ChannelRef) -> Result<()> {
            self.left.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeMedia {
        fail_microphone: bool,
        released: Mutex<Vec<String>>,
    }

    fn sample_track(id: &str) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            id.to_owned(),
            "local".to_owned(),
        ))
    }

    #[async_trait::async_trait]
    impl MediaSource for FakeMedia {
        async fn acquire_microphone(&self) -> Result<Arc<TrackLocalStaticSample>> {
            if self.fail_microphone {
                return Err(Error::MediaAcquisition("microphone in use".to_string()));
            }
            Ok(sample_track("microphone"))
        }

        async fn acquire_camera(&self) -> Result<Arc<TrackLocalStaticSample>> {
            Ok(sample_track("camera"))
        }

        async fn acquire_screen(&self) -> Result<Arc<TrackLocalStaticSample>> {
            Ok(sample_track("screen"))
        }

        async fn release(&self, track: Arc<TrackLocalStaticSample>) {
            self.released.lock().await.push(track.id().to_string());
        }
    }

    struct Harness {
        session: CallSession,
        sink: Arc<NullSink>,
        directory: Arc<FakeDirectory>,
        media: Arc<FakeMedia>,
        internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
        snapshot_rx: watch::Receiver<CallSnapshot>,
    }

    fn harness_with(media: FakeMedia, roster: Vec<ParticipantInfo>) -> Harness {
        let sink = Arc::new(NullSink::default());
        let directory = Arc::new(FakeDirectory::default());
        *directory.roster.try_lock().unwrap() = roster;
        let media = Arc::new(media);
        let (link_tx, _link_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::idle());
        let session = CallSession::new(
            ParticipantId::new("alice"),
            CallConfig::default(),
            sink.clone(),
            directory.clone(),
            media.clone(),
            link_tx,
            internal_tx,
            snapshot_tx,
        );
        Harness {
            session,
            sink,
            directory,
            media,
            internal_rx,
            snapshot_rx,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeMedia::default(), Vec::new())
    }

    fn roster_entry(id: &str) -> ParticipantInfo {
        ParticipantInfo {
            id: ParticipantId::new(id),
            display_name: id.to_string(),
            media_state: MediaState::default(),
        }
    }

    fn voice_channel() -> ChannelRef {
        ChannelRef::new("acme", "voice")
    }

    /// Run the pending media acquisition to completion.
    async fn pump_media(harness: &mut Harness) {
        let event = harness.internal_rx.recv().await.unwrap();
        harness.session.handle_internal(event).await;
    }

    #[tokio::test]
    async fn test_solo_join_reaches_connected() {
        let mut h = harness();
        h.session.join(voice_channel()).await.unwrap();
        assert_eq!(h.session.state(), &CallState::Connecting);

        pump_media(&mut h).await;
        assert_eq!(h.session.state(), &CallState::Connected);
        assert_eq!(h.directory.published.lock().await.len(), 1);
        assert!(h.sink.sdp.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_join_offers_to_higher_peer() {
        let mut h = harness_with(FakeMedia::default(), vec![roster_entry("bob")]);
        h.session.join(voice_channel()).await.unwrap();
        pump_media(&mut h).await;

        let sent = h.sink.sdp.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ParticipantId::new("bob"));
        assert_eq!(sent[0].1, SdpKind::Offer);
    }

    #[tokio::test]
    async fn test_media_failure_enters_error_state() {
        let mut h = harness_with(
            FakeMedia {
                fail_microphone: true,
                ..Default::default()
            },
            Vec::new(),
        );
        h.session.join(voice_channel()).await.unwrap();
        pump_media(&mut h).await;

        assert!(matches!(h.session.state(), CallState::Error(_)));
        assert!(h.snapshot_rx.borrow().channel.is_none());
    }

    #[tokio::test]
    async fn test_leave_during_pending_join_releases_media() {
        let mut h = harness();
        h.session.join(voice_channel()).await.unwrap();
        h.session.leave().await;
        assert_eq!(h.session.state(), &CallState::Idle);

        // the acquisition completes after the leave; its track must go
        // straight back to the source
        pump_media(&mut h).await;
        assert_eq!(h.session.state(), &CallState::Idle);
        assert_eq!(
            h.media.released.lock().await.as_slice(),
            ["microphone".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rejoin_supersedes_pending_join() {
        let mut h = harness();
        h.session.join(voice_channel()).await.unwrap();
        h.session.join(ChannelRef::new("acme", "other")).await.unwrap();

        // first acquisition is stale, second installs
        pump_media(&mut h).await;
        pump_media(&mut h).await;

        assert_eq!(h.session.state(), &CallState::Connected);
        assert_eq!(h.media.released.lock().await.len(), 1);
        assert_eq!(
            h.snapshot_rx.borrow().channel,
            Some(ChannelRef::new("acme", "other"))
        );
    }

    #[tokio::test]
    async fn test_leave_from_connected_cleans_up() {
        let mut h = harness();
        h.session.join(voice_channel()).await.unwrap();
        pump_media(&mut h).await;
        assert_eq!(h.session.state(), &CallState::Connected);

        h.session.leave().await;
        assert_eq!(h.session.state(), &CallState::Idle);
        assert!(h.directory.left.load(Ordering::SeqCst));
        assert_eq!(h.media.released.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_when_idle_is_harmless() {
        let mut h = harness();
        h.session.leave().await;
        assert_eq!(h.session.state(), &CallState::Idle);
        assert!(!h.directory.left.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_retry_rejoins_last_channel() {
        let mut h = harness_with(
            FakeMedia {
                fail_microphone: true,
                ..Default::default()
            },
            Vec::new(),
        );
        h.session.join(voice_channel()).await.unwrap();
        pump_media(&mut h).await;
        assert!(matches!(h.session.state(), CallState::Error(_)));

        h.session.retry().await.unwrap();
        assert_eq!(h.session.state(), &CallState::Connecting);
        assert_eq!(h.snapshot_rx.borrow().channel, Some(voice_channel()));
    }

    #[tokio::test]
    async fn test_retry_outside_error_is_noop() {
        let mut h = harness();
        h.session.retry().await.unwrap();
        assert_eq!(h.session.state(), &CallState::Idle);
    }

    #[tokio::test]
    async fn test_toggles_publish_coupled_state() {
        let mut h = harness();
        h.session.join(voice_channel()).await.unwrap();
        pump_media(&mut h).await;
        h.directory.published.lock().await.clear();

        h.session.toggle_deafen().await;
        h.session.toggle_mute().await;

        let published = h.directory.published.lock().await;
        assert_eq!(published.len(), 2);
        assert!(published[0].deafened && published[0].muted);
        assert!(!published[1].deafened && !published[1].muted);
    }

    #[tokio::test]
    async fn test_video_toggle_acquires_and_releases_camera() {
        let mut h = harness();
        h.session.join(voice_channel()).await.unwrap();
        pump_media(&mut h).await;

        h.session.toggle_video().await;
        assert!(h.snapshot_rx.borrow().local_media.video_enabled);

        h.session.toggle_video().await;
        assert!(!h.snapshot_rx.borrow().local_media.video_enabled);
        assert!(h
            .media
            .released
            .lock()
            .await
            .contains(&"camera".to_string()));
    }

    #[tokio::test]
    async fn test_events_for_other_channels_are_dropped() {
        let mut h = harness();
        h.session.join(voice_channel()).await.unwrap();
        pump_media(&mut h).await;

        h.session
            .handle_channel_event(ChannelEvent::ParticipantJoined {
                channel: ChannelRef::new("acme", "other"),
                participant: roster_entry("bob"),
            })
            .await;

        assert!(h.snapshot_rx.borrow().participants.is_empty());
    }

    #[tokio::test]
    async fn test_offer_during_media_acquisition_is_answered() {
        use crate::media::TrackSlot;
        use crate::peer::PeerLink;

        // "aaa" offers toward "alice" while alice's microphone prompt is
        // still open; the offer must be answered once media lands
        let mut h = harness_with(FakeMedia::default(), vec![roster_entry("aaa")]);
        h.session.join(voice_channel()).await.unwrap();

        let (remote_tx, _remote_rx) = mpsc::unbounded_channel();
        let mut remote = PeerLink::new(
            &ParticipantId::new("aaa"),
            ParticipantId::new("alice"),
            &CallConfig::default(),
            remote_tx,
        )
        .await
        .unwrap();
        let microphone: Arc<dyn TrackLocal + Send + Sync> = sample_track("aaa-mic");
        remote
            .update_tracks(&[(TrackSlot::Microphone, microphone)])
            .await
            .unwrap();
        let offer = remote.create_offer().await.unwrap();

        h.session
            .handle_channel_event(ChannelEvent::SdpReceived {
                channel: voice_channel(),
                from: ParticipantId::new("aaa"),
                kind: SdpKind::Offer,
                sdp: offer,
            })
            .await;
        assert!(
            h.sink.sdp.lock().await.is_empty(),
            "nothing goes out before media is ready"
        );

        pump_media(&mut h).await;

        let sent = h.sink.sdp.lock().await;
        assert!(
            sent.iter()
                .any(|(to, kind)| to == &ParticipantId::new("aaa") && *kind == SdpKind::Answer),
            "held offer answered after media landed: {:?}",
            sent.iter().map(|(to, kind)| (to.clone(), *kind)).collect::<Vec<_>>()
        );
        drop(sent);
        remote.close().await;
    }

    #[tokio::test]
    async fn test_held_events_are_dropped_on_leave() {
        let mut h = harness();
        h.session.join(voice_channel()).await.unwrap();
        h.session
            .handle_channel_event(ChannelEvent::ParticipantJoined {
                channel: voice_channel(),
                participant: roster_entry("bob"),
            })
            .await;

        h.session.leave().await;
        h.session.join(voice_channel()).await.unwrap();
        // two acquisitions are pending; the first is stale
        pump_media(&mut h).await;
        pump_media(&mut h).await;

        assert_eq!(h.session.state(), &CallState::Connected);
        assert!(
            h.snapshot_rx.borrow().participants.is_empty(),
            "event held for the abandoned join does not leak into the next call"
        );
    }

    #[tokio::test]
    async fn test_participant_join_event_extends_mesh() {
        let mut h = harness();
        h.session.join(voice_channel()).await.unwrap();
        pump_media(&mut h).await;

        h.session
            .handle_channel_event(ChannelEvent::ParticipantJoined {
                channel: voice_channel(),
                participant: roster_entry("bob"),
            })
            .await;

        let snapshot = h.snapshot_rx.borrow();
        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(snapshot.participants[0].info.id, ParticipantId::new("bob"));
    }
}

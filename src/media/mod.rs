//! Local media state, toggle rules, and track ownership

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::Result;

/// Published media state of one participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaState {
    /// Microphone is not being sent
    pub muted: bool,
    /// Incoming audio is suppressed (implies muted)
    pub deafened: bool,
    /// Camera video is being sent
    pub video_enabled: bool,
    /// Screen capture is being sent
    pub screen_sharing: bool,
}

/// The purpose a local track serves on a peer connection.
///
/// Senders are registered under their slot, so reconciliation never has to
/// guess what an attached sender was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSlot {
    /// Voice capture
    Microphone,
    /// Camera capture
    Camera,
    /// Screen capture
    Screen,
}

impl TrackSlot {
    /// All slots, in reconciliation order
    pub const ALL: [TrackSlot; 3] = [TrackSlot::Microphone, TrackSlot::Camera, TrackSlot::Screen];

    /// Slot name for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackSlot::Microphone => "microphone",
            TrackSlot::Camera => "camera",
            TrackSlot::Screen => "screen",
        }
    }
}

/// Local capture tracks owned by the session.
///
/// Every track held here was acquired from the [`MediaSource`] and must be
/// released back to it exactly once.
#[derive(Clone, Default)]
pub struct LocalTracks {
    /// Voice capture track
    pub microphone: Option<Arc<TrackLocalStaticSample>>,
    /// Camera capture track
    pub camera: Option<Arc<TrackLocalStaticSample>>,
    /// Screen capture track
    pub screen: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalTracks {
    /// True when no track is held
    pub fn is_empty(&self) -> bool {
        self.microphone.is_none() && self.camera.is_none() && self.screen.is_none()
    }

    /// Remove and return every held track, for release back to the source
    pub fn take_all(&mut self) -> Vec<Arc<TrackLocalStaticSample>> {
        [
            self.microphone.take(),
            self.camera.take(),
            self.screen.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Tracks that should currently be attached to peer connections.
    ///
    /// Mute removes the microphone from the set; video and screen tracks
    /// appear only while their toggles are on.
    pub fn desired(&self, state: &MediaState) -> Vec<(TrackSlot, Arc<dyn TrackLocal + Send + Sync>)> {
        let mut out: Vec<(TrackSlot, Arc<dyn TrackLocal + Send + Sync>)> = Vec::new();
        if !state.muted {
            if let Some(track) = &self.microphone {
                out.push((TrackSlot::Microphone, track.clone()));
            }
        }
        if state.video_enabled {
            if let Some(track) = &self.camera {
                out.push((TrackSlot::Camera, track.clone()));
            }
        }
        if state.screen_sharing {
            if let Some(track) = &self.screen {
                out.push((TrackSlot::Screen, track.clone()));
            }
        }
        out
    }
}

/// Local toggle state with the deafen/mute coupling rules.
///
/// Deafening mutes the microphone as a side effect; lifting deafen restores
/// the microphone only if the deafen was what muted it. Unmuting always
/// lifts deafen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaToggles {
    state: MediaState,
    muted_by_deafen: bool,
}

impl MediaToggles {
    /// Current published state
    pub fn state(&self) -> MediaState {
        self.state
    }

    /// Flip the microphone mute and return the new state
    pub fn toggle_mute(&mut self) -> MediaState {
        if self.state.muted {
            self.state.muted = false;
            self.state.deafened = false;
            self.muted_by_deafen = false;
        } else {
            self.state.muted = true;
            self.muted_by_deafen = false;
        }
        self.state
    }

    /// Flip deafen and return the new state
    pub fn toggle_deafen(&mut self) -> MediaState {
        if self.state.deafened {
            self.state.deafened = false;
            if self.muted_by_deafen {
                self.state.muted = false;
                self.muted_by_deafen = false;
            }
        } else {
            self.state.deafened = true;
            if !self.state.muted {
                self.state.muted = true;
                self.muted_by_deafen = true;
            }
        }
        self.state
    }

    /// Set camera video on or off and return the new state
    pub fn set_video(&mut self, enabled: bool) -> MediaState {
        self.state.video_enabled = enabled;
        self.state
    }

    /// Set screen sharing on or off and return the new state
    pub fn set_screen_sharing(&mut self, enabled: bool) -> MediaState {
        self.state.screen_sharing = enabled;
        self.state
    }
}

/// Platform media capture.
///
/// Each `acquire_*` hands ownership of a live capture track to the caller;
/// the caller returns it with [`MediaSource::release`] exactly once.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open the microphone
    async fn acquire_microphone(&self) -> Result<Arc<TrackLocalStaticSample>>;

    /// Open the camera
    async fn acquire_camera(&self) -> Result<Arc<TrackLocalStaticSample>>;

    /// Start screen capture
    async fn acquire_screen(&self) -> Result<Arc<TrackLocalStaticSample>>;

    /// Stop and release a previously acquired track
    async fn release(&self, track: Arc<TrackLocalStaticSample>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::media_engine::MIME_TYPE_OPUS;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    fn opus_track(id: &str) -> Arc<TrackLocalStaticSample> {
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

    #[test]
    fn test_deafen_mutes_microphone() {
        let mut toggles = MediaToggles::default();
        let state = toggles.toggle_deafen();
        assert!(state.deafened);
        assert!(state.muted);
    }

    #[test]
    fn test_undeafen_restores_deafen_induced_mute() {
        let mut toggles = MediaToggles::default();
        toggles.toggle_deafen();
        let state = toggles.toggle_deafen();
        assert!(!state.deafened);
        assert!(!state.muted);
    }

    #[test]
    fn test_undeafen_keeps_independent_mute() {
        let mut toggles = MediaToggles::default();
        toggles.toggle_mute();
        toggles.toggle_deafen();
        let state = toggles.toggle_deafen();
        assert!(!state.deafened);
        assert!(state.muted, "mute chosen before deafen must survive undeafen");
    }

    #[test]
    fn test_unmute_lifts_deafen() {
        let mut toggles = MediaToggles::default();
        toggles.toggle_deafen();
        let state = toggles.toggle_mute();
        assert!(!state.muted);
        assert!(!state.deafened);
    }

    #[test]
    fn test_desired_set_honors_mute() {
        let tracks = LocalTracks {
            microphone: Some(opus_track("mic")),
            ..Default::default()
        };
        let mut state = MediaState::default();
        assert_eq!(tracks.desired(&state).len(), 1);

        state.muted = true;
        assert!(tracks.desired(&state).is_empty());
    }

    #[test]
    fn test_desired_set_requires_toggle_and_track() {
        let tracks = LocalTracks {
            microphone: Some(opus_track("mic")),
            camera: Some(opus_track("cam")),
            ..Default::default()
        };
        let state = MediaState {
            video_enabled: true,
            screen_sharing: true, // no screen track held
            ..Default::default()
        };
        let desired = tracks.desired(&state);
        let slots: Vec<TrackSlot> = desired.iter().map(|(slot, _)| *slot).collect();
        assert_eq!(slots, vec![TrackSlot::Microphone, TrackSlot::Camera]);
    }

    #[test]
    fn test_take_all_empties_tracks() {
        let mut tracks = LocalTracks {
            microphone: Some(opus_track("mic")),
            camera: Some(opus_track("cam")),
            screen: None,
        };
        let taken = tracks.take_all();
        assert_eq!(taken.len(), 2);
        assert!(tracks.is_empty());
    }
}

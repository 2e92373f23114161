//! Event-loop front end for [`CallSession`]
//!
//! The session is single-threaded by construction: one task owns it and
//! pumps commands, inbound channel events, link events, and internal
//! events through `tokio::select!`. Callers talk to the loop through a
//! [`CallHandle`] and observe it through a `watch` channel of
//! [`CallSnapshot`]s.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{CallSession, CallSnapshot, InternalEvent};
use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::media::MediaSource;
use crate::peer::link::LinkEvent;
use crate::signaling::{ChannelDirectory, ChannelEvent, ChannelRef, ParticipantId, SignalingSink};

/// Command for the call loop
#[derive(Debug, Clone)]
pub enum CallCommand {
    /// Join a voice channel, leaving any current one
    Join(ChannelRef),
    /// Leave the current call
    Leave,
    /// Re-join the last channel after an error
    Retry,
    /// Flip microphone mute
    ToggleMute,
    /// Flip deafen
    ToggleDeafen,
    /// Flip camera video
    ToggleVideo,
    /// Flip screen sharing
    ToggleScreenShare,
    /// Leave and terminate the loop
    Shutdown,
}

/// Handle to a running call loop
pub struct CallHandle {
    commands: mpsc::UnboundedSender<CallCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    snapshots: watch::Receiver<CallSnapshot>,
    task: JoinHandle<()>,
}

impl CallHandle {
    /// Send a command to the loop
    pub fn command(&self, command: CallCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::TransportSend("call loop has terminated".to_string()))
    }

    /// Deliver an inbound channel event to the loop
    pub fn deliver(&self, event: ChannelEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| Error::TransportSend("call loop has terminated".to_string()))
    }

    /// Subscribe to call snapshots
    pub fn snapshots(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.clone()
    }

    /// Leave any current call, stop the loop, and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.commands.send(CallCommand::Shutdown);
        let _ = self.task.await;
    }
}

/// Validate the config, spawn the call loop, and return its handle
pub fn run_call(
    local_id: ParticipantId,
    config: CallConfig,
    sink: Arc<dyn SignalingSink>,
    directory: Arc<dyn ChannelDirectory>,
    media: Arc<dyn MediaSource>,
) -> Result<CallHandle> {
    config.validate()?;

    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<CallCommand>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ChannelEvent>();
    let (link_tx, mut link_rx) = mpsc::unbounded_channel::<LinkEvent>();
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<InternalEvent>();
    let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::idle());

    let mut session = CallSession::new(
        local_id, config, sink, directory, media, link_tx, internal_tx, snapshot_tx,
    );

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(command) = command_rx.recv() => {
                    match command {
                        CallCommand::Shutdown => {
                            session.leave().await;
                            break;
                        }
                        CallCommand::Join(channel) => {
                            if let Err(e) = session.join(channel).await {
                                error!(error = %e, "join failed");
                            }
                        }
                        CallCommand::Leave => session.leave().await,
                        CallCommand::Retry => {
                            if let Err(e) = session.retry().await {
                                error!(error = %e, "retry failed");
                            }
                        }
                        CallCommand::ToggleMute => session.toggle_mute().await,
                        CallCommand::ToggleDeafen => session.toggle_deafen().await,
                        CallCommand::ToggleVideo => session.toggle_video().await,
                        CallCommand::ToggleScreenShare => session.toggle_screen_share().await,
                    }
                }
                Some(event) = event_rx.recv() => session.handle_channel_event(event).await,
                Some(event) = link_rx.recv() => session.handle_link_event(event).await,
                Some(event) = internal_rx.recv() => session.handle_internal(event).await,
                else => break,
            }
        }
        debug!("call loop terminated");
    });

    Ok(CallHandle {
        commands: command_tx,
        events: event_tx,
        snapshots: snapshot_rx,
        task,
    })
}

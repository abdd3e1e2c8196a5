use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::{IllegalStateError, Link};
use crate::client::FullEvent;
use crate::constants::{DEFAULT_VOLUME, MAX_VOLUME, MIN_VOLUME};
use crate::internal::prelude::*;
use crate::model::event::{EventType, PlayerStateUpdate, TrackEndReason};
use crate::model::id::GuildId;
use crate::model::track::Track;
use crate::node::{Node, NodeConnectionExt};

struct PlayerState {
    track: Option<Track>,
    paused: bool,
    volume: u16,
    /// Last known position, as of `update_time`.
    position: Duration,
    update_time: Option<Instant>,
    connected: bool,
    filters: Option<Value>,
}

impl PlayerState {
    fn estimated_position(&self) -> Duration {
        let Some(track) = &self.track else { return Duration::ZERO };

        let mut position = self.position;

        if !self.paused {
            if let Some(update_time) = self.update_time {
                position += update_time.elapsed();
            }
        }

        match track.length {
            Some(length) => position.min(length),
            None => position,
        }
    }
}

/// The playback facade of a [`Link`].
///
/// The player mirrors what it last told the node and what the node last reported, so playback can
/// be resumed on another node after a failover.
pub struct Player {
    guild_id: GuildId,
    link: Weak<Link>,
    state: Mutex<PlayerState>,
}

impl Player {
    pub(crate) fn new(guild_id: GuildId, link: Weak<Link>) -> Self {
        Self {
            guild_id,
            link,
            state: Mutex::new(PlayerState {
                track: None,
                paused: false,
                volume: DEFAULT_VOLUME,
                position: Duration::ZERO,
                update_time: None,
                connected: false,
                filters: None,
            }),
        }
    }

    #[must_use]
    pub fn playing_track(&self) -> Option<Track> {
        self.state.lock().track.clone()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    #[must_use]
    pub fn volume(&self) -> u16 {
        self.state.lock().volume
    }

    #[must_use]
    pub fn filters(&self) -> Option<Value> {
        self.state.lock().filters.clone()
    }

    /// Whether the node last reported being connected to the voice server.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Whether a track is loaded and not paused.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        let state = self.state.lock();

        state.track.is_some() && !state.paused
    }

    /// The estimated position in the playing track.
    ///
    /// Extrapolated from the node's last report, never past the track's length. Zero when nothing
    /// is playing.
    #[must_use]
    pub fn track_position(&self) -> Duration {
        self.state.lock().estimated_position()
    }

    /// Plays `track` from its start time, selecting a node for the link if it has none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAvailableNode`] if no node can take the link, or an
    /// [`IllegalStateError`] if the link is destroyed.
    #[cfg_attr(feature = "tracing_instrument", tracing::instrument(skip(self)))]
    pub fn play_track(&self, track: Track) -> Result<()> {
        let node = self.link()?.node_or_select()?;

        let (paused, volume) = {
            let mut state = self.state.lock();
            state.position = track.start_time;
            state.update_time = Some(Instant::now());
            state.track = Some(track.clone());

            (state.paused, state.volume)
        };

        node.connection().send_play(self.guild_id, &track, track.start_time, paused, volume);

        Ok(())
    }

    /// Stops the playing track.
    ///
    /// # Errors
    ///
    /// Returns an [`IllegalStateError`] if the link is gone.
    pub fn stop_track(&self) -> Result<()> {
        let link = self.link()?;

        self.state.lock().track = None;

        if let Some(node) = link.node() {
            node.connection().send_stop(self.guild_id);
        }

        Ok(())
    }

    /// Pauses or resumes playback. Does nothing if already in the requested state.
    ///
    /// # Errors
    ///
    /// Returns an [`IllegalStateError`] if the link is gone.
    pub fn set_paused(&self, paused: bool) -> Result<()> {
        let link = self.link()?;

        {
            let mut state = self.state.lock();

            if state.paused == paused {
                return Ok(());
            }

            // Freeze or restart the position estimate at the switch.
            state.position = state.estimated_position();
            state.update_time = Some(Instant::now());
            state.paused = paused;
        }

        if let Some(node) = link.node() {
            node.connection().send_pause(self.guild_id, paused);
        }

        let event = if paused {
            FullEvent::PlayerPause {
                link: Arc::clone(&link),
            }
        } else {
            FullEvent::PlayerResume {
                link: Arc::clone(&link),
            }
        };

        if let Ok(pool) = link.pool() {
            pool.dispatch(&event);
        }

        Ok(())
    }

    /// Seeks the playing track to `position`.
    ///
    /// # Errors
    ///
    /// Returns [`IllegalStateError::NotPlaying`] without a track,
    /// [`IllegalStateError::NotSeekable`] if the track does not allow seeking, or
    /// [`Error::NoAvailableNode`] if no node can take the link.
    pub fn seek_to(&self, position: Duration) -> Result<()> {
        {
            let state = self.state.lock();
            let track = state.track.as_ref().ok_or(IllegalStateError::NotPlaying)?;

            if !track.seekable {
                return Err(IllegalStateError::NotSeekable.into());
            }
        }

        let node = self.link()?.node_or_select()?;

        {
            let mut state = self.state.lock();
            state.position = position;
            state.update_time = Some(Instant::now());
        }

        node.connection().send_seek(self.guild_id, position);

        Ok(())
    }

    /// Sets the volume, clamped to the range the node accepts.
    ///
    /// # Errors
    ///
    /// Returns an [`IllegalStateError`] if the link is gone.
    pub fn set_volume(&self, volume: u16) -> Result<()> {
        let link = self.link()?;
        let volume = volume.clamp(MIN_VOLUME, MAX_VOLUME);

        self.state.lock().volume = volume;

        if let Some(node) = link.node() {
            node.connection().send_volume(self.guild_id, volume);
        }

        Ok(())
    }

    /// Sets the audio filters, an object whose fields are sent to the node as-is.
    ///
    /// # Errors
    ///
    /// Returns an [`IllegalStateError`] if the link is gone.
    pub fn set_filters(&self, filters: Value) -> Result<()> {
        let link = self.link()?;

        if let Some(node) = link.node() {
            node.connection().send_filters(self.guild_id, &filters);
        }

        self.state.lock().filters = Some(filters);

        Ok(())
    }

    pub(crate) fn provide_state(&self, update: PlayerStateUpdate) {
        let mut state = self.state.lock();
        state.position = Duration::from_millis(update.position);
        state.update_time = Some(Instant::now());
        state.connected = update.connected;
    }

    pub(crate) fn handle_event(&self, kind: &EventType) {
        if let EventType::TrackEnd {
            reason,
        } = kind
        {
            // A replacement has already been loaded; a stop already cleared the track.
            if !matches!(reason, TrackEndReason::Replaced | TrackEndReason::Stopped) {
                let mut state = self.state.lock();
                state.track = None;
                state.position = Duration::ZERO;
            }
        }
    }

    /// Resumes playback on `node` where it left off on the previous one.
    pub(crate) fn on_node_change(&self, node: &Arc<Node>) {
        let (track, position, paused, volume, filters) = {
            let state = self.state.lock();

            (
                state.track.clone(),
                state.estimated_position(),
                state.paused,
                state.volume,
                state.filters.clone(),
            )
        };

        if let Some(track) = track {
            debug!("[Link {}] Resuming playback on node {} at {:?}", self.guild_id, node.name(), position);

            node.connection().send_play(self.guild_id, &track, position, paused, volume);
        }

        if let Some(filters) = filters {
            node.connection().send_filters(self.guild_id, &filters);
        }
    }

    fn link(&self) -> Result<Arc<Link>> {
        self.link.upgrade().ok_or_else(|| IllegalStateError::Detached.into())
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();

        f.debug_struct("Player")
            .field("guild_id", &self.guild_id)
            .field("track", &state.track.as_ref().map(|t| &t.encoded))
            .field("paused", &state.paused)
            .field("volume", &state.volume)
            .finish_non_exhaustive()
    }
}

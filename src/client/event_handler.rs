use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::link::Link;
use crate::model::event::{TrackEndReason, TrackException};
use crate::node::Node;

/// The core trait for handling events of the pool.
///
/// Every method has an empty default, so implementors only override what they need. Each event
/// is dispatched on its own task.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Dispatched when a node's connection finished its handshake.
    async fn node_connect(&self, _node: Arc<Node>) {}

    /// Dispatched when a node's connection closed, after its links were moved to other nodes.
    async fn node_disconnect(&self, _node: Arc<Node>, _code: u16, _reason: String, _by_remote: bool) {}

    /// Dispatched when a node started playing a track.
    ///
    /// Provides the node's encoded track, if it sent one.
    async fn track_start(&self, _link: Arc<Link>, _track: Option<String>) {}

    async fn track_end(&self, _link: Arc<Link>, _track: Option<String>, _reason: TrackEndReason) {}

    async fn track_exception(&self, _link: Arc<Link>, _track: Option<String>, _exception: TrackException) {}

    /// Dispatched when a track produced no audio for longer than `threshold`.
    async fn track_stuck(&self, _link: Arc<Link>, _track: Option<String>, _threshold: Duration) {}

    /// Dispatched when a node's connection to the voice server closed.
    async fn voice_socket_closed(&self, _link: Arc<Link>, _code: u16, _reason: String, _by_remote: bool) {}

    async fn player_pause(&self, _link: Arc<Link>) {}

    async fn player_resume(&self, _link: Arc<Link>) {}
}

/// This enum stores every possible event that an [`EventHandler`] can receive.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum FullEvent {
    NodeConnect { node: Arc<Node> },
    NodeDisconnect { node: Arc<Node>, code: u16, reason: String, by_remote: bool },
    TrackStart { link: Arc<Link>, track: Option<String> },
    TrackEnd { link: Arc<Link>, track: Option<String>, reason: TrackEndReason },
    TrackException { link: Arc<Link>, track: Option<String>, exception: TrackException },
    TrackStuck { link: Arc<Link>, track: Option<String>, threshold: Duration },
    VoiceSocketClosed { link: Arc<Link>, code: u16, reason: String, by_remote: bool },
    PlayerPause { link: Arc<Link> },
    PlayerResume { link: Arc<Link> },
}

impl FullEvent {
    /// Runs the given [`EventHandler`]'s code for this event.
    pub async fn dispatch(self, handler: &dyn EventHandler) {
        match self {
            Self::NodeConnect {
                node,
            } => handler.node_connect(node).await,
            Self::NodeDisconnect {
                node,
                code,
                reason,
                by_remote,
            } => handler.node_disconnect(node, code, reason, by_remote).await,
            Self::TrackStart {
                link,
                track,
            } => handler.track_start(link, track).await,
            Self::TrackEnd {
                link,
                track,
                reason,
            } => handler.track_end(link, track, reason).await,
            Self::TrackException {
                link,
                track,
                exception,
            } => handler.track_exception(link, track, exception).await,
            Self::TrackStuck {
                link,
                track,
                threshold,
            } => handler.track_stuck(link, track, threshold).await,
            Self::VoiceSocketClosed {
                link,
                code,
                reason,
                by_remote,
            } => handler.voice_socket_closed(link, code, reason, by_remote).await,
            Self::PlayerPause {
                link,
            } => handler.player_pause(link).await,
            Self::PlayerResume {
                link,
            } => handler.player_resume(link).await,
        }
    }
}

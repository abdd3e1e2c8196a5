//! Per-guild sessions and their state machine.
//!
//! A [`Link`] tracks whether a guild is affiliated with a voice channel and which node its audio is
//! routed through. Every mutable field of a link is guarded by one lock, so a node migration and a
//! concurrent state transition can never lose each other's update.

mod error;
mod player;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

pub use self::error::Error as IllegalStateError;
pub use self::player::Player;
use crate::client::{ConfigurationError, Lavalink, VoiceGateway};
use crate::internal::prelude::*;
use crate::model::id::{ChannelId, GuildId};
use crate::model::voice::{VoiceCredentials, VoiceServerUpdate};
use crate::node::{Node, NodeConnectionExt};

/// The lifecycle state of a [`Link`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LinkState {
    /// Not affiliated with any voice channel. The initial state.
    Unbound,
    /// A channel join was requested, waiting for voice gateway credentials.
    Binding,
    /// Routed through the assigned node.
    Bound,
    /// Leaving the voice channel.
    Unbinding,
    /// The link is being torn down.
    Destroying,
    /// The link is gone. Absorbing.
    Destroyed,
}

impl LinkState {
    /// Whether the link is being or has been destroyed.
    #[must_use]
    pub fn is_destroyed(self) -> bool {
        matches!(self, Self::Destroying | Self::Destroyed)
    }

    /// Whether a link in this state may move to `to`.
    #[must_use]
    pub fn can_transition_to(self, to: LinkState) -> bool {
        match self {
            Self::Destroyed | Self::Destroying => to == Self::Destroyed,
            _ => true,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unbound => "UNBOUND",
            Self::Binding => "BINDING",
            Self::Bound => "BOUND",
            Self::Unbinding => "UNBINDING",
            Self::Destroying => "DESTROYING",
            Self::Destroyed => "DESTROYED",
        })
    }
}

struct LinkInner {
    state: LinkState,
    node: Weak<Node>,
    channel: Option<ChannelId>,
    credentials: Option<VoiceCredentials>,
    player: Option<Arc<Player>>,
}

impl LinkInner {
    fn transition(&mut self, guild_id: GuildId, to: LinkState) -> Result<LinkState> {
        let from = self.state;

        if !from.can_transition_to(to) {
            return Err(IllegalStateError::Transition {
                from,
                to,
            }
            .into());
        }

        if from != to {
            debug!("[Link {}] {} -> {}", guild_id, from, to);
        }

        self.state = to;

        Ok(from)
    }

    /// Pins the link to `node`, re-binding it there if it holds gateway credentials.
    fn assign(&mut self, guild_id: GuildId, node: &Arc<Node>) {
        self.node = Arc::downgrade(node);

        if let Some(credentials) = &self.credentials {
            node.connection().send_bind(guild_id, credentials);
        }
    }
}

/// The session of one guild.
///
/// Links are created by [`Lavalink::link`], which guarantees there is at most one per guild.
pub struct Link {
    guild_id: GuildId,
    pool: Weak<Lavalink>,
    me: Weak<Link>,
    inner: Mutex<LinkInner>,
}

impl Link {
    pub(crate) fn new(guild_id: GuildId, pool: Weak<Lavalink>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            guild_id,
            pool,
            me: me.clone(),
            inner: Mutex::new(LinkInner {
                state: LinkState::Unbound,
                node: Weak::new(),
                channel: None,
                credentials: None,
                player: None,
            }),
        })
    }

    #[must_use]
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    /// Moves the link to `state`.
    ///
    /// # Errors
    ///
    /// Returns [`IllegalStateError::Transition`] when leaving [`LinkState::Destroyed`], or when
    /// leaving [`LinkState::Destroying`] for anything but [`LinkState::Destroyed`].
    pub fn set_state(&self, state: LinkState) -> Result<()> {
        self.inner.lock().transition(self.guild_id, state).map(|_| ())
    }

    /// The channel the link occupies, absent while unbound or destroyed.
    #[must_use]
    pub fn channel(&self) -> Option<ChannelId> {
        let inner = self.inner.lock();

        match inner.state {
            LinkState::Unbound | LinkState::Destroyed => None,
            _ => inner.channel,
        }
    }

    /// The channel the link last meant to occupy, regardless of state.
    #[must_use]
    pub fn last_channel(&self) -> Option<ChannelId> {
        self.inner.lock().channel
    }

    /// Records that the voice gateway moved the link to `channel`.
    pub fn set_channel(&self, channel: ChannelId) {
        self.inner.lock().channel = Some(channel);
    }

    /// The node the link is pinned to, if any.
    #[must_use]
    pub fn node(&self) -> Option<Arc<Node>> {
        self.inner.lock().node.upgrade()
    }

    /// The node the link is pinned to, asking the load balancer for one if unassigned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAvailableNode`] if no node can be selected, or an
    /// [`IllegalStateError`] if the link is destroyed.
    pub fn node_or_select(&self) -> Result<Arc<Node>> {
        {
            let inner = self.inner.lock();

            if inner.state.is_destroyed() {
                return Err(IllegalStateError::Detached.into());
            }

            if let Some(node) = inner.node.upgrade() {
                return Ok(node);
            }
        }

        // The balancer inspects every link, so it must not run under this link's lock.
        let best = self.pool()?.load_balancer().determine_best_node(self.guild_id)?;

        let player = {
            let mut inner = self.inner.lock();

            if inner.state.is_destroyed() {
                return Err(IllegalStateError::Detached.into());
            }

            if let Some(node) = inner.node.upgrade() {
                return Ok(node);
            }

            debug!("[Link {}] Assigned to node {}", self.guild_id, best.name());
            inner.assign(self.guild_id, &best);

            inner.player.clone()
        };

        if let Some(player) = player {
            player.on_node_change(&best);
        }

        Ok(best)
    }

    /// Whether the link is pinned to `node`.
    #[must_use]
    pub fn is_on(&self, node: &Node) -> bool {
        std::ptr::eq(self.inner.lock().node.as_ptr(), node)
    }

    pub(crate) fn is_playing(&self) -> bool {
        let player = self.inner.lock().player.clone();

        player.is_some_and(|player| player.is_playing())
    }

    /// Asks the voice gateway to join `channel`.
    ///
    /// # Errors
    ///
    /// Returns an [`IllegalStateError`] if the link is destroyed, a [`ConfigurationError`] if no
    /// voice gateway or shard count is configured, or the voice gateway's own error.
    pub fn connect(&self, channel: impl Into<ChannelId>) -> Result<()> {
        let channel = channel.into();
        let (gateway, shard_id) = self.gateway()?;

        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.transition(self.guild_id, LinkState::Binding)?;
            inner.channel = Some(channel);

            previous
        };

        if let Err(why) = gateway.connect(self.guild_id, channel, shard_id) {
            let mut inner = self.inner.lock();

            if inner.state == LinkState::Binding {
                inner.state = previous;
            }

            return Err(why.into());
        }

        Ok(())
    }

    /// Asks the voice gateway to leave the current channel.
    ///
    /// The link becomes [`LinkState::Unbound`] once the gateway reports it left, through
    /// [`Self::on_disconnected`].
    ///
    /// # Errors
    ///
    /// Returns an [`IllegalStateError`] if the link is destroyed, a [`ConfigurationError`] if no
    /// voice gateway or shard count is configured, or the voice gateway's own error.
    pub fn disconnect(&self) -> Result<()> {
        let (gateway, shard_id) = self.gateway()?;

        let previous = self.inner.lock().transition(self.guild_id, LinkState::Unbinding)?;

        if let Err(why) = gateway.disconnect(self.guild_id, shard_id) {
            let mut inner = self.inner.lock();

            if inner.state == LinkState::Unbinding {
                inner.state = previous;
            }

            return Err(why.into());
        }

        Ok(())
    }

    /// Applies new voice gateway credentials and binds the link to its node.
    ///
    /// Without a node, one is selected first. When already bound this re-sends the bind frame to
    /// the current node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAvailableNode`] if no node can take the link, or an
    /// [`IllegalStateError`] if the link is destroyed.
    pub fn on_voice_server_update(
        &self,
        session_id: impl Into<String>,
        server_update: VoiceServerUpdate,
    ) -> Result<()> {
        let credentials = VoiceCredentials {
            session_id: session_id.into(),
            server_update,
        };

        {
            let mut inner = self.inner.lock();

            if inner.state.is_destroyed() {
                return Err(IllegalStateError::Detached.into());
            }

            if let Some(node) = inner.node.upgrade() {
                node.connection().send_bind(self.guild_id, &credentials);
                inner.credentials = Some(credentials);
                inner.transition(self.guild_id, LinkState::Bound)?;

                return Ok(());
            }

            // Stored first, so that assignment below binds with them.
            inner.credentials = Some(credentials);
        }

        self.node_or_select()?;

        self.inner.lock().transition(self.guild_id, LinkState::Bound).map(|_| ())
    }

    /// Called when the voice gateway reports the link left its channel.
    ///
    /// The node is told to release the session and the link becomes unassigned. Does nothing
    /// while the link is being destroyed.
    pub fn on_disconnected(&self) {
        let mut inner = self.inner.lock();

        if inner.state.is_destroyed() {
            return;
        }

        if inner.transition(self.guild_id, LinkState::Unbound).is_err() {
            return;
        }

        inner.credentials = None;

        if let Some(node) = inner.node.upgrade() {
            node.connection().send_release(self.guild_id);
        }

        inner.node = Weak::new();
    }

    /// Moves the link to `node`.
    ///
    /// Cached gateway credentials are re-sent to the new node right away, and a playing track is
    /// resumed there. Nothing is sent to the previous node.
    pub fn change_node(&self, node: Arc<Node>) {
        let player = {
            let mut inner = self.inner.lock();

            if inner.state.is_destroyed() {
                return;
            }

            debug!("[Link {}] Moving to node {}", self.guild_id, node.name());
            inner.assign(self.guild_id, &node);

            inner.player.clone()
        };

        if let Some(player) = player {
            player.on_node_change(&node);
        }
    }

    /// Assigns `node` only if the link has none, returning whether it did.
    pub(crate) fn claim(&self, node: &Arc<Node>) -> bool {
        let player = {
            let mut inner = self.inner.lock();

            if inner.state.is_destroyed() || inner.node.upgrade().is_some() {
                return false;
            }

            inner.assign(self.guild_id, node);

            inner.player.clone()
        };

        if let Some(player) = player {
            player.on_node_change(node);
        }

        true
    }

    /// Unpins the link from `node` without telling it, returning whether it was pinned there.
    pub(crate) fn reset_node_if_on(&self, node: &Node) -> bool {
        let mut inner = self.inner.lock();

        if !std::ptr::eq(inner.node.as_ptr(), node) {
            return false;
        }

        inner.node = Weak::new();

        true
    }

    /// Tears the link down and removes it from its pool.
    ///
    /// If the link is affiliated with a channel, it leaves it and releases the session on its node
    /// first. Failures along the way are ignored; the link goes away regardless.
    pub fn destroy(&self) {
        let (affiliated, node) = {
            let mut inner = self.inner.lock();

            if inner.state.is_destroyed() {
                return;
            }

            let affiliated = !matches!(inner.state, LinkState::Unbinding | LinkState::Unbound);
            inner.state = LinkState::Destroying;
            debug!("[Link {}] Destroying", self.guild_id);

            (affiliated, inner.node.upgrade())
        };

        if affiliated {
            match self.gateway() {
                Ok((gateway, shard_id)) => {
                    if let Err(why) = gateway.disconnect(self.guild_id, shard_id) {
                        warn!("[Link {}] Error leaving voice channel while destroying: {}", self.guild_id, why);
                    }
                },
                Err(why) => debug!("[Link {}] Not leaving voice channel: {}", self.guild_id, why),
            }
        }

        if let Some(node) = node {
            node.connection().send_release(self.guild_id);
        }

        {
            let mut inner = self.inner.lock();
            inner.state = LinkState::Destroyed;
            inner.node = Weak::new();
            inner.credentials = None;
            inner.player = None;
        }

        debug!("[Link {}] Destroyed", self.guild_id);

        if let Some(pool) = self.pool.upgrade() {
            pool.on_session_destroyed(self);
        }
    }

    /// The link's player, created on first use.
    #[must_use]
    pub fn player(&self) -> Arc<Player> {
        let mut inner = self.inner.lock();

        Arc::clone(
            inner
                .player
                .get_or_insert_with(|| Arc::new(Player::new(self.guild_id, self.me.clone()))),
        )
    }

    /// Drops the link's player, if one was created. A new one is created on next use.
    pub fn reset_player(&self) {
        self.inner.lock().player = None;
    }

    /// Sends a frame through the assigned node.
    ///
    /// # Errors
    ///
    /// Returns [`IllegalStateError::NoNode`] if the link is unassigned.
    pub fn send(&self, frame: &Value) -> Result<()> {
        let node = self.node().ok_or(IllegalStateError::NoNode)?;

        node.connection().send(frame);

        Ok(())
    }

    pub(crate) fn pool(&self) -> Result<Arc<Lavalink>> {
        self.pool.upgrade().ok_or_else(|| IllegalStateError::Detached.into())
    }

    fn gateway(&self) -> Result<(Arc<dyn VoiceGateway>, u64)> {
        let pool = self.pool()?;
        let gateway = pool.voice_gateway().ok_or(ConfigurationError::MissingVoiceGateway)?;
        let shard_id = pool.shard_id(self.guild_id).ok_or(ConfigurationError::MissingShardCount)?;

        Ok((gateway, shard_id))
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();

        f.debug_struct("Link")
            .field("guild_id", &self.guild_id)
            .field("state", &inner.state)
            .field("node", &inner.node.upgrade().map(|n| n.name().to_owned()))
            .field("channel", &inner.channel)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{frames, open_node, pool};
    use crate::model::stats::stats_for_test;
    use crate::model::Track;

    const ALL: [LinkState; 6] = [
        LinkState::Unbound,
        LinkState::Binding,
        LinkState::Bound,
        LinkState::Unbinding,
        LinkState::Destroying,
        LinkState::Destroyed,
    ];

    #[test]
    fn destroyed_is_absorbing() {
        for to in ALL {
            assert_eq!(LinkState::Destroyed.can_transition_to(to), to == LinkState::Destroyed);
            assert_eq!(LinkState::Destroying.can_transition_to(to), to == LinkState::Destroyed);
        }

        for from in &ALL[..4] {
            assert!(ALL.iter().all(|to| from.can_transition_to(*to)));
        }
    }

    #[test]
    fn set_state_enforces_transitions() {
        let link = Link::new(GuildId(1), Weak::new());

        link.set_state(LinkState::Binding).unwrap();
        link.set_state(LinkState::Destroying).unwrap();

        assert!(matches!(
            link.set_state(LinkState::Bound),
            Err(Error::State(IllegalStateError::Transition {
                from: LinkState::Destroying,
                to: LinkState::Bound,
            }))
        ));

        link.set_state(LinkState::Destroyed).unwrap();

        for to in &ALL[..5] {
            assert!(link.set_state(*to).is_err());
        }
        assert_eq!(link.state(), LinkState::Destroyed);
    }

    #[test]
    fn detached_links_cannot_select_nodes() {
        let link = Link::new(GuildId(1), Weak::new());

        assert!(matches!(link.node_or_select(), Err(Error::State(IllegalStateError::Detached))));
    }

    #[tokio::test]
    async fn migration_resumes_playback() {
        let pool = pool();
        let (a, _rx_a) = open_node(&pool, "a");
        let (b, mut rx_b) = open_node(&pool, "b");
        a.set_stats(stats_for_test(0.0, None));

        let link = pool.link(GuildId(1));
        let player = link.player();
        player.play_track(Track::new("abc").length(std::time::Duration::from_secs(60))).unwrap();
        player.set_volume(50).unwrap();
        player.set_filters(serde_json::json!({"timescale": {"speed": 1.5}})).unwrap();

        link.change_node(Arc::clone(&b));

        let sent = frames(&mut rx_b);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["op"], "play");
        assert_eq!(sent[0]["track"], "abc");
        assert_eq!(sent[0]["volume"], 50);
        assert_eq!(sent[1]["op"], "filters");
        assert_eq!(sent[1]["timescale"]["speed"], 1.5);
    }

    #[tokio::test]
    async fn lazy_selection_resumes_playback() {
        let pool = pool();
        let (a, _rx_a) = open_node(&pool, "a");
        a.set_stats(stats_for_test(0.0, None));

        let link = pool.link(GuildId(1));
        let player = link.player();
        player.play_track(Track::new("abc").length(std::time::Duration::from_secs(60))).unwrap();

        a.connection().set_loopback_state(crate::node::ReadyState::Closed);
        a.mark_closed();
        pool.load_balancer().on_node_disconnect(&a);
        assert!(link.node().is_none());

        // Comes up while another node is registered, so it claims nothing.
        let (b, mut rx_b) = open_node(&pool, "b");
        b.set_stats(stats_for_test(0.0, None));
        assert!(link.node().is_none());

        player.seek_to(std::time::Duration::from_secs(5)).unwrap();

        assert!(link.is_on(&b));
        let sent = frames(&mut rx_b);
        let ops: Vec<&str> = sent.iter().filter_map(|frame| frame["op"].as_str()).collect();
        assert_eq!(ops, ["play", "seek"]);
        assert_eq!(sent[0]["track"], "abc");
        assert_eq!(sent[1]["position"], 5000);
    }

    #[tokio::test]
    async fn claim_only_takes_unassigned_links() {
        let pool = pool();
        let (a, _rx_a) = open_node(&pool, "a");
        let (b, _rx_b) = open_node(&pool, "b");

        let link = pool.link(GuildId(1));

        assert!(link.claim(&a));
        assert!(!link.claim(&b));
        assert!(link.is_on(&a));

        assert!(!link.reset_node_if_on(&b));
        assert!(link.is_on(&a));

        assert!(link.reset_node_if_on(&a));
        assert!(link.node().is_none());
    }

    #[tokio::test]
    async fn seeking_needs_a_seekable_track() {
        let pool = pool();
        let (a, mut rx) = open_node(&pool, "a");
        a.set_stats(stats_for_test(0.0, None));

        let player = pool.link(GuildId(1)).player();
        let second = std::time::Duration::from_secs(1);

        assert!(matches!(player.seek_to(second), Err(Error::State(IllegalStateError::NotPlaying))));

        player.play_track(Track::new("live").seekable(false)).unwrap();
        assert!(matches!(player.seek_to(second), Err(Error::State(IllegalStateError::NotSeekable))));

        player.play_track(Track::new("abc")).unwrap();
        player.seek_to(second).unwrap();

        let sent = frames(&mut rx);
        assert_eq!(sent.last().unwrap()["op"], "seek");
        assert_eq!(sent.last().unwrap()["position"], 1000);
    }

    #[tokio::test]
    async fn volume_is_clamped_and_position_bounded() {
        let pool = pool();
        let (a, _rx) = open_node(&pool, "a");
        a.set_stats(stats_for_test(0.0, None));

        let player = pool.link(GuildId(1)).player();
        player.set_volume(5000).unwrap();
        assert_eq!(player.volume(), crate::constants::MAX_VOLUME);

        assert_eq!(player.track_position(), std::time::Duration::ZERO);

        let length = std::time::Duration::from_millis(10);
        player
            .play_track(Track::new("abc").length(length).start_time(std::time::Duration::from_secs(5)))
            .unwrap();
        assert_eq!(player.track_position(), length);

        player.stop_track().unwrap();
        assert!(!player.is_playing());
    }
}

//! The [`Lavalink`] pool, the entry point of the library.
//!
//! The pool owns every registered [`Node`] and every [`Link`], and is the facade the bot's
//! gateway bindings talk to. It is always handled through an [`Arc`]; nodes, links and the load
//! balancer point back at it weakly, so dropping the last handle tears everything down.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::num::NonZeroU64;
//!
//! use lavalink_client::client::Lavalink;
//! use lavalink_client::model::id::GuildId;
//!
//! # async fn run() -> lavalink_client::Result<()> {
//! let lavalink = Lavalink::builder()
//!     .user_id(123_456_789_u64)
//!     .shard_count(NonZeroU64::MIN)
//!     .build();
//!
//! lavalink.add_node("main", "ws://localhost:2333", "youshallnotpass", None)?;
//!
//! let link = lavalink.link(GuildId::new(81384788765712384));
//! println!("{:?}", link.state());
//! # Ok(())
//! # }
//! ```

mod error;
mod event_handler;
mod settings;
mod voice;

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::channel::mpsc::{self, UnboundedSender as Sender};
use parking_lot::{Mutex, RwLock};
use secrecy::SecretString;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use url::Url;

pub use self::error::Error as ConfigurationError;
pub use self::event_handler::{EventHandler, FullEvent};
pub use self::settings::Settings;
pub use self::voice::{GatewayError, VoiceGateway};
use crate::constants::{close_codes, NODE_NAME_PREFIX};
use crate::internal::prelude::*;
use crate::internal::tokio::spawn_named;
use crate::link::Link;
use crate::load_balancer::{LoadBalancer, PenaltyProvider};
use crate::model::id::{ChannelId, GuildId, UserId};
use crate::model::voice::VoiceServerUpdate;
use crate::node::{Node, NodeRunner, ReconnectScheduler, ReconnectSchedulerMessage};

static NODE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A builder for a [`Lavalink`] pool.
#[must_use = "Builders do nothing unless built"]
pub struct LavalinkBuilder {
    settings: Settings,
    event_handlers: Vec<Arc<dyn EventHandler>>,
    voice_gateway: Option<Arc<dyn VoiceGateway>>,
    penalty_providers: Vec<Arc<dyn PenaltyProvider>>,
}

impl LavalinkBuilder {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            event_handlers: vec![],
            voice_gateway: None,
            penalty_providers: vec![],
        }
    }

    /// Replaces all settings, including a user id or shard count set earlier.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;

        self
    }

    /// Gets the settings. See [`Self::settings`] for more info.
    pub fn get_settings(&self) -> &Settings {
        &self.settings
    }

    pub fn user_id(mut self, user_id: impl Into<UserId>) -> Self {
        self.settings.user_id = Some(user_id.into());

        self
    }

    pub fn shard_count(mut self, shard_count: NonZeroU64) -> Self {
        self.settings.shard_count = Some(shard_count);

        self
    }

    /// Adds an event handler with multiple methods for each possible event.
    pub fn event_handler<H>(mut self, event_handler: impl Into<Arc<H>>) -> Self
    where
        H: EventHandler + 'static,
    {
        self.event_handlers.push(event_handler.into());

        self
    }

    /// Gets the added event handlers. See [`Self::event_handler`] for more info.
    pub fn get_event_handlers(&self) -> &[Arc<dyn EventHandler>] {
        &self.event_handlers
    }

    /// Sets the collaborator links use to join and leave voice channels.
    pub fn voice_gateway<V>(mut self, voice_gateway: impl Into<Arc<V>>) -> Self
    where
        V: VoiceGateway + 'static,
    {
        self.voice_gateway = Some(voice_gateway.into());

        self
    }

    /// Registers an extra load balancing signal. See [`LoadBalancer::add_penalty_provider`].
    pub fn penalty_provider(mut self, provider: Arc<dyn PenaltyProvider>) -> Self {
        self.penalty_providers.push(provider);

        self
    }

    /// Builds the pool, and starts its reconnect scheduler unless disabled in the settings.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn build(self) -> Arc<Lavalink> {
        let Self {
            settings,
            event_handlers,
            voice_gateway,
            penalty_providers,
        } = self;

        let (scheduler_tx, scheduler_rx) = mpsc::unbounded();
        let auto_reconnect = settings.auto_reconnect;

        let lavalink = Arc::new_cyclic(|me: &Weak<Lavalink>| Lavalink {
            me: me.clone(),
            runtime: Handle::current(),
            user_id: RwLock::new(settings.user_id),
            shard_count: RwLock::new(settings.shard_count),
            nodes: RwLock::new(Vec::new()),
            links: DashMap::new(),
            load_balancer: LoadBalancer::new(me.clone(), penalty_providers),
            event_handlers,
            voice_gateway,
            scheduler: Mutex::new(auto_reconnect.then(|| scheduler_tx)),
            shut_down: AtomicBool::new(false),
            settings,
        });

        if auto_reconnect {
            let mut scheduler = ReconnectScheduler {
                pool: Arc::downgrade(&lavalink),
                rx: scheduler_rx,
                interval: lavalink.settings.reconnect_interval,
                backoff: lavalink.settings.reconnect_backoff,
            };

            spawn_named("reconnect_scheduler", async move { scheduler.run().await });
        }

        lavalink
    }
}

impl Default for LavalinkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A pool of audio nodes and the links routed through them.
pub struct Lavalink {
    me: Weak<Lavalink>,
    runtime: Handle,
    settings: Settings,
    user_id: RwLock<Option<UserId>>,
    shard_count: RwLock<Option<NonZeroU64>>,
    /// Registration order is the load balancer's tie-break order.
    nodes: RwLock<Vec<Arc<Node>>>,
    links: DashMap<GuildId, Arc<Link>>,
    load_balancer: LoadBalancer,
    event_handlers: Vec<Arc<dyn EventHandler>>,
    voice_gateway: Option<Arc<dyn VoiceGateway>>,
    scheduler: Mutex<Option<Sender<ReconnectSchedulerMessage>>>,
    shut_down: AtomicBool,
}

impl Lavalink {
    pub fn builder() -> LavalinkBuilder {
        LavalinkBuilder::new()
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        *self.user_id.read()
    }

    /// Sets the bot's user id, sent to nodes on handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::NodesRegistered`] if any node was already added.
    pub fn set_user_id(&self, user_id: impl Into<UserId>) -> Result<()> {
        let nodes = self.nodes.read();

        if !nodes.is_empty() {
            return Err(ConfigurationError::NodesRegistered.into());
        }

        *self.user_id.write() = Some(user_id.into());

        Ok(())
    }

    #[must_use]
    pub fn shard_count(&self) -> Option<NonZeroU64> {
        *self.shard_count.read()
    }

    /// Sets the bot's total shard count, sent to nodes on handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::NodesRegistered`] if any node was already added.
    pub fn set_shard_count(&self, shard_count: NonZeroU64) -> Result<()> {
        let nodes = self.nodes.read();

        if !nodes.is_empty() {
            return Err(ConfigurationError::NodesRegistered.into());
        }

        *self.shard_count.write() = Some(shard_count);

        Ok(())
    }

    /// The shard the gateway events of `guild_id` arrive on, if the shard count is known.
    #[must_use]
    pub fn shard_id(&self, guild_id: GuildId) -> Option<u64> {
        self.shard_count().map(|count| guild_id.shard_id(count.get()))
    }

    /// Registers a node and starts connecting to it.
    ///
    /// The node is listed immediately, but only becomes available once its handshake completes.
    /// A failing first connection is logged and left to the reconnect scheduler.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the user id or shard count is unset, a node named
    /// `name` already exists, or a handshake header cannot be built. Returns [`Error::Url`] if
    /// `address` is not a valid URL.
    #[cfg_attr(feature = "tracing_instrument", tracing::instrument(skip(self, password)))]
    pub fn add_node(
        &self,
        name: &str,
        address: &str,
        password: &str,
        resume_key: Option<&str>,
    ) -> Result<Arc<Node>> {
        let address = Url::parse(address)?;

        let (node, events) = {
            let mut nodes = self.nodes.write();

            let user_id = self.user_id().ok_or(ConfigurationError::MissingUserId)?;
            let shard_count = self.shard_count().ok_or(ConfigurationError::MissingShardCount)?;

            if nodes.iter().any(|node| node.name() == name) {
                return Err(ConfigurationError::DuplicateNodeName(name.to_owned()).into());
            }

            let (node, events) = Node::new(
                name,
                address,
                SecretString::new(password.to_owned()),
                resume_key,
                user_id,
                shard_count,
                &self.settings,
            )?;

            nodes.push(Arc::clone(&node));

            (node, events)
        };

        info!("[Lavalink] Added node {}", node);

        let _guard = self.runtime.enter();
        spawn_named("node::runner", NodeRunner::new(&node, self.me.clone(), events).run());

        if let Err(why) = node.connection().connect() {
            warn!("[Lavalink] Error connecting to node {}: {:?}", node.name(), why);
        }

        Ok(node)
    }

    /// Like [`Self::add_node`], with a generated name.
    ///
    /// # Errors
    ///
    /// See [`Self::add_node`].
    pub fn add_node_unnamed(&self, address: &str, password: &str, resume_key: Option<&str>) -> Result<Arc<Node>> {
        let name = format!("{}{}", NODE_NAME_PREFIX, NODE_COUNTER.fetch_add(1, Ordering::Relaxed));

        self.add_node(&name, address, password, resume_key)
    }

    /// Closes the connection of the node named `name` and unregisters it.
    ///
    /// Links pinned to the node are not migrated; they read as unassigned from now on and select
    /// a new node on their next send.
    pub fn remove_node(&self, name: &str) -> Option<Arc<Node>> {
        let node = {
            let mut nodes = self.nodes.write();
            let index = nodes.iter().position(|node| node.name() == name)?;

            nodes.remove(index)
        };

        info!("[Lavalink] Removed node {}", node);
        node.connection().close(close_codes::NORMAL, "Node removed");

        Some(node)
    }

    /// All registered nodes, in registration order.
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().clone()
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.read().iter().find(|node| node.name() == name).cloned()
    }

    pub(crate) fn has_node(&self, node: &Arc<Node>) -> bool {
        self.nodes.read().iter().any(|n| Arc::ptr_eq(n, node))
    }

    /// The link of `guild_id`, created if it does not exist.
    ///
    /// There is never more than one link per guild, even under concurrent calls.
    #[must_use]
    pub fn link(&self, guild_id: impl Into<GuildId>) -> Arc<Link> {
        let guild_id = guild_id.into();
        let link = self.links.entry(guild_id).or_insert_with(|| {
            debug!("[Lavalink] Creating link {}", guild_id);

            Link::new(guild_id, self.me.clone())
        });

        Arc::clone(link.value())
    }

    /// The link of `guild_id`, if one exists.
    #[must_use]
    pub fn existing_link(&self, guild_id: impl Into<GuildId>) -> Option<Arc<Link>> {
        self.links.get(&guild_id.into()).map(|link| Arc::clone(link.value()))
    }

    /// A snapshot of all links.
    #[must_use]
    pub fn links(&self) -> Vec<Arc<Link>> {
        self.links.iter().map(|link| Arc::clone(link.value())).collect()
    }

    pub(crate) fn on_session_destroyed(&self, link: &Link) {
        let removed = self
            .links
            .remove_if(&link.guild_id(), |_, existing| std::ptr::eq(Arc::as_ptr(existing), link));

        if removed.is_some() {
            debug!("[Lavalink] Removed destroyed link {}", link.guild_id());
        }
    }

    #[must_use]
    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    #[must_use]
    pub fn voice_gateway(&self) -> Option<Arc<dyn VoiceGateway>> {
        self.voice_gateway.clone()
    }

    /// Feeds a voice server update for the bot to the link of `guild_id`.
    ///
    /// `session_id` is the bot's voice session id, taken from its latest voice state.
    ///
    /// # Errors
    ///
    /// See [`Link::on_voice_server_update`].
    pub fn on_voice_server_update(
        &self,
        guild_id: impl Into<GuildId>,
        session_id: impl Into<String>,
        update: VoiceServerUpdate,
    ) -> Result<()> {
        self.link(guild_id).on_voice_server_update(session_id, update)
    }

    /// Feeds a voice state update of the bot to the link of `guild_id`.
    ///
    /// `None` means the bot left its voice channel.
    pub fn on_voice_state_update(&self, guild_id: impl Into<GuildId>, channel_id: Option<ChannelId>) {
        let Some(link) = self.existing_link(guild_id) else { return };

        match channel_id {
            Some(channel_id) => link.set_channel(channel_id),
            None => link.on_disconnected(),
        }
    }

    /// Hands `event` to every event handler, each on its own task.
    pub(crate) fn dispatch(&self, event: &FullEvent) {
        if self.event_handlers.is_empty() {
            return;
        }

        let _guard = self.runtime.enter();

        for handler in &self.event_handlers {
            let handler = Arc::clone(handler);
            let event = event.clone();

            spawn_named("dispatch::event_handler", async move { event.dispatch(&*handler).await });
        }
    }

    /// Stops the reconnect scheduler and closes every node connection.
    ///
    /// Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("[Lavalink] Shutting down");

        if let Some(tx) = self.scheduler.lock().take() {
            if let Err(why) = tx.unbounded_send(ReconnectSchedulerMessage::Shutdown) {
                debug!("[Lavalink] Reconnect scheduler already stopped: {:?}", why);
            }
        }

        for node in self.nodes() {
            node.connection().close(close_codes::NORMAL, "Client shutdown");
        }
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Lavalink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lavalink")
            .field("user_id", &self.user_id())
            .field("shard_count", &self.shard_count())
            .field("nodes", &self.nodes.read().len())
            .field("links", &self.links.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    use super::*;
    use crate::link::{IllegalStateError, LinkState};
    use crate::model::stats::stats_for_test;
    use crate::model::Track;
    use crate::node::Command;

    pub(crate) fn pool_with(builder: LavalinkBuilder) -> Arc<Lavalink> {
        let mut settings = Settings::default();
        settings.auto_reconnect = false;

        builder.settings(settings).user_id(1_u64).shard_count(NonZeroU64::MIN).build()
    }

    pub(crate) fn pool() -> Arc<Lavalink> {
        pool_with(LavalinkBuilder::new())
    }

    /// Adds a node whose connection is an open loopback.
    pub(crate) fn open_node(pool: &Lavalink, name: &str) -> (Arc<Node>, UnboundedReceiver<Command>) {
        let node = pool.add_node(name, "ws://127.0.0.1:1", "youshallnotpass", None).unwrap();
        let (_, rx) = node.connection().open_loopback();
        node.mark_open();

        (node, rx)
    }

    /// Drains the text frames sent so far.
    pub(crate) fn frames(rx: &mut UnboundedReceiver<Command>) -> Vec<Value> {
        let mut frames = vec![];

        while let Ok(command) = rx.try_recv() {
            if let Command::Text(text) = command {
                frames.push(serde_json::from_str(&text).unwrap());
            }
        }

        frames
    }

    fn server_update() -> VoiceServerUpdate {
        VoiceServerUpdate::new(1_u64, "eu.voice.example:443", "token")
    }

    #[derive(Default)]
    struct RecordingGateway {
        calls: parking_lot::Mutex<Vec<(GuildId, Option<ChannelId>, u64)>>,
        fail: bool,
    }

    impl VoiceGateway for RecordingGateway {
        fn connect(&self, guild_id: GuildId, channel_id: ChannelId, shard_id: u64) -> Result<(), GatewayError> {
            if self.fail {
                return Err(GatewayError::new("shard is down"));
            }

            self.calls.lock().push((guild_id, Some(channel_id), shard_id));

            Ok(())
        }

        fn disconnect(&self, guild_id: GuildId, shard_id: u64) -> Result<(), GatewayError> {
            if self.fail {
                return Err(GatewayError::new("shard is down"));
            }

            self.calls.lock().push((guild_id, None, shard_id));

            Ok(())
        }
    }

    struct Recorder(UnboundedSender<&'static str>);

    #[async_trait::async_trait]
    impl EventHandler for Recorder {
        async fn player_pause(&self, _link: Arc<Link>) {
            let _ = self.0.send("pause");
        }

        async fn player_resume(&self, _link: Arc<Link>) {
            let _ = self.0.send("resume");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_link_per_guild_under_concurrency() {
        let pool = pool();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let pool = Arc::clone(&pool);

                tokio::spawn(async move { pool.link(GuildId(7)) })
            })
            .collect();

        let mut links = vec![];
        for task in tasks {
            links.push(task.await.unwrap());
        }

        assert!(links.iter().all(|link| Arc::ptr_eq(link, &links[0])));
        assert_eq!(pool.links().len(), 1);
    }

    #[tokio::test]
    async fn node_names_are_unique() {
        let pool = pool();

        pool.add_node("a", "ws://127.0.0.1:1", "pw", None).unwrap();

        assert!(matches!(
            pool.add_node("a", "ws://127.0.0.1:2", "pw", None),
            Err(Error::Config(ConfigurationError::DuplicateNodeName(name))) if name == "a"
        ));
        assert_eq!(pool.nodes().len(), 1);
    }

    #[tokio::test]
    async fn unnamed_nodes_get_generated_names() {
        let pool = pool();

        let a = pool.add_node_unnamed("ws://127.0.0.1:1", "pw", None).unwrap();
        let b = pool.add_node_unnamed("ws://127.0.0.1:1", "pw", None).unwrap();

        assert!(a.name().starts_with(NODE_NAME_PREFIX));
        assert_ne!(a.name(), b.name());
    }

    #[tokio::test]
    async fn nodes_need_user_id_and_shard_count() {
        let mut settings = Settings::default();
        settings.auto_reconnect = false;
        let pool = Lavalink::builder().settings(settings).build();

        assert!(matches!(
            pool.add_node("a", "ws://127.0.0.1:1", "pw", None),
            Err(Error::Config(ConfigurationError::MissingUserId))
        ));

        pool.set_user_id(1_u64).unwrap();

        assert!(matches!(
            pool.add_node("a", "ws://127.0.0.1:1", "pw", None),
            Err(Error::Config(ConfigurationError::MissingShardCount))
        ));

        pool.set_shard_count(NonZeroU64::MIN).unwrap();
        pool.add_node("a", "ws://127.0.0.1:1", "pw", None).unwrap();

        assert!(matches!(pool.set_user_id(2_u64), Err(Error::Config(ConfigurationError::NodesRegistered))));
        assert_eq!(pool.user_id(), Some(UserId(1)));
    }

    #[tokio::test]
    async fn invalid_address() {
        let pool = pool();

        assert!(matches!(pool.add_node("a", "not a url", "pw", None), Err(Error::Url(_))));
        assert!(pool.nodes().is_empty());
    }

    #[tokio::test]
    async fn migration_rebinds_on_the_new_node_only() {
        let pool = pool();
        let (a, mut rx_a) = open_node(&pool, "a");
        let (b, mut rx_b) = open_node(&pool, "b");
        a.set_stats(stats_for_test(0.0, None));
        b.set_stats(stats_for_test(0.5, None));

        let link = pool.link(GuildId(1));
        link.on_voice_server_update("session", server_update()).unwrap();

        assert_eq!(link.state(), LinkState::Bound);
        assert!(link.is_on(&a));

        let sent = frames(&mut rx_a);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["op"], "bind");

        link.change_node(Arc::clone(&b));

        let sent = frames(&mut rx_b);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["op"], "bind");
        assert_eq!(sent[0]["sessionKey"], "1");
        assert_eq!(sent[0]["sessionId"], "session");
        assert_eq!(sent[0]["event"]["token"], "token");
        assert_eq!(sent[0]["event"]["endpoint"], "eu.voice.example:443");

        assert!(frames(&mut rx_a).is_empty());
        assert_eq!(link.state(), LinkState::Bound);
    }

    #[tokio::test]
    async fn new_credentials_rebind_on_the_current_node() {
        let pool = pool();
        let (a, mut rx_a) = open_node(&pool, "a");
        a.set_stats(stats_for_test(0.0, None));

        pool.on_voice_server_update(1_u64, "session", server_update()).unwrap();
        pool.on_voice_server_update(1_u64, "session", server_update()).unwrap();

        let sent = frames(&mut rx_a);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|frame| frame["op"] == "bind"));
        assert_eq!(pool.link(1_u64).state(), LinkState::Bound);
    }

    #[tokio::test]
    async fn binding_without_nodes_fails() {
        let pool = pool();
        let link = pool.link(GuildId(1));

        assert!(matches!(
            link.on_voice_server_update("session", server_update()),
            Err(Error::NoAvailableNode)
        ));
        assert!(link.node().is_none());
    }

    #[tokio::test]
    async fn sending_without_node_fails_fast() {
        let pool = pool();
        let link = pool.link(GuildId(1));

        assert!(matches!(
            link.send(&serde_json::json!({"op": "stop"})),
            Err(Error::State(IllegalStateError::NoNode))
        ));
    }

    #[tokio::test]
    async fn leaving_the_channel_releases_the_session() {
        let pool = pool();
        let (a, mut rx_a) = open_node(&pool, "a");
        a.set_stats(stats_for_test(0.0, None));

        let link = pool.link(GuildId(1));
        link.on_voice_server_update("session", server_update()).unwrap();
        pool.on_voice_state_update(1_u64, Some(ChannelId(5)));
        assert_eq!(link.channel(), Some(ChannelId(5)));
        frames(&mut rx_a);

        pool.on_voice_state_update(1_u64, None);

        let sent = frames(&mut rx_a);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["op"], "release");
        assert_eq!(link.state(), LinkState::Unbound);
        assert!(link.node().is_none());
        assert_eq!(link.channel(), None);
        assert_eq!(link.last_channel(), Some(ChannelId(5)));
    }

    #[tokio::test]
    async fn destroy_releases_and_unregisters() {
        let gateway = Arc::new(RecordingGateway::default());
        let pool = pool_with(LavalinkBuilder::new().voice_gateway::<RecordingGateway>(Arc::clone(&gateway)));
        let (a, mut rx_a) = open_node(&pool, "a");
        a.set_stats(stats_for_test(0.0, None));

        let link = pool.link(GuildId(1));
        link.on_voice_server_update("session", server_update()).unwrap();
        frames(&mut rx_a);

        link.destroy();

        let sent = frames(&mut rx_a);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["op"], "release");
        assert_eq!(gateway.calls.lock().as_slice(), &[(GuildId(1), None, 0)]);
        assert_eq!(link.state(), LinkState::Destroyed);
        assert!(pool.existing_link(GuildId(1)).is_none());

        // Destroyed links stay destroyed; the guild gets a fresh one.
        assert!(link.set_state(LinkState::Unbound).is_err());
        assert!(!Arc::ptr_eq(&pool.link(GuildId(1)), &link));

        link.destroy();
        assert!(frames(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn connect_asks_the_voice_gateway() {
        let gateway = Arc::new(RecordingGateway::default());
        let pool = pool_with(LavalinkBuilder::new().voice_gateway::<RecordingGateway>(Arc::clone(&gateway)));

        let link = pool.link(GuildId(1 << 22));
        link.connect(ChannelId(9)).unwrap();

        assert_eq!(link.state(), LinkState::Binding);
        assert_eq!(link.channel(), Some(ChannelId(9)));
        assert_eq!(gateway.calls.lock().as_slice(), &[(GuildId(1 << 22), Some(ChannelId(9)), 0)]);

        link.disconnect().unwrap();
        assert_eq!(link.state(), LinkState::Unbinding);
    }

    #[tokio::test]
    async fn failed_connect_reverts_the_state() {
        let gateway = Arc::new(RecordingGateway {
            fail: true,
            ..Default::default()
        });
        let pool = pool_with(LavalinkBuilder::new().voice_gateway::<RecordingGateway>(gateway));

        let link = pool.link(GuildId(1));

        assert!(matches!(link.connect(ChannelId(9)), Err(Error::Gateway(_))));
        assert_eq!(link.state(), LinkState::Unbound);
    }

    #[tokio::test]
    async fn failed_disconnect_reverts_the_state() {
        let gateway = Arc::new(RecordingGateway {
            fail: true,
            ..Default::default()
        });
        let pool = pool_with(LavalinkBuilder::new().voice_gateway::<RecordingGateway>(gateway));

        let link = pool.link(GuildId(1));
        link.set_state(LinkState::Bound).unwrap();

        assert!(matches!(link.disconnect(), Err(Error::Gateway(_))));
        assert_eq!(link.state(), LinkState::Bound);
    }

    #[tokio::test]
    async fn connect_without_voice_gateway() {
        let pool = pool();

        assert!(matches!(
            pool.link(GuildId(1)).connect(ChannelId(9)),
            Err(Error::Config(ConfigurationError::MissingVoiceGateway))
        ));
    }

    #[tokio::test]
    async fn removed_nodes_leave_links_unassigned() {
        let pool = pool();
        let (a, _rx) = open_node(&pool, "a");
        a.set_stats(stats_for_test(0.0, None));

        let link = pool.link(GuildId(1));
        link.node_or_select().unwrap();

        let removed = pool.remove_node("a").unwrap();
        assert!(Arc::ptr_eq(&removed, &a));
        assert!(pool.remove_node("a").is_none());
        assert!(pool.nodes().is_empty());

        drop((removed, a));
        assert!(link.node().is_none());
    }

    #[tokio::test]
    async fn pause_events_are_dispatched() {
        let (tx, mut rx) = unbounded_channel();
        let pool = pool_with(LavalinkBuilder::new().event_handler(Recorder(tx)));
        let (a, _rx) = open_node(&pool, "a");
        a.set_stats(stats_for_test(0.0, None));

        let player = pool.link(GuildId(1)).player();
        player.play_track(Track::new("abc")).unwrap();
        player.set_paused(true).unwrap();
        player.set_paused(true).unwrap();
        player.set_paused(false).unwrap();

        let wait = Duration::from_secs(1);
        let first = tokio::time::timeout(wait, rx.recv()).await.unwrap();
        let second = tokio::time::timeout(wait, rx.recv()).await.unwrap();

        let mut seen = vec![first.unwrap(), second.unwrap()];
        seen.sort_unstable();
        assert_eq!(seen, ["pause", "resume"]);
    }

    #[tokio::test]
    async fn shutdown_closes_every_node() {
        let pool = pool();
        let (_a, mut rx_a) = open_node(&pool, "a");
        let (_b, mut rx_b) = open_node(&pool, "b");

        pool.shutdown();
        pool.shutdown();

        assert!(pool.is_shut_down());
        assert!(matches!(rx_a.try_recv(), Ok(Command::Close(close_codes::NORMAL, _))));
        assert!(matches!(rx_b.try_recv(), Ok(Command::Close(close_codes::NORMAL, _))));
        assert!(rx_a.try_recv().is_err());
    }
}

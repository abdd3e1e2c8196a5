use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{ConnectionEvent, Node, TaggedEvent};
use crate::client::{FullEvent, Lavalink};
use crate::constants::close_codes;
use crate::link::Link;
use crate::model::event::{EventType, IncomingMessage, NodeEvent};
use crate::model::id::GuildId;

/// Consumes the events of one node's connection, outside of the connection's own task.
pub(crate) struct NodeRunner {
    node: Weak<Node>,
    pool: Weak<Lavalink>,
    events: mpsc::UnboundedReceiver<TaggedEvent>,
}

impl NodeRunner {
    pub(crate) fn new(
        node: &Arc<Node>,
        pool: Weak<Lavalink>,
        events: mpsc::UnboundedReceiver<TaggedEvent>,
    ) -> Self {
        Self {
            node: Arc::downgrade(node),
            pool,
            events,
        }
    }

    /// Runs until the node is removed from the pool or the pool goes away.
    #[cfg_attr(feature = "tracing_instrument", tracing::instrument(skip(self)))]
    pub(crate) async fn run(mut self) {
        while let Some(TaggedEvent {
            generation,
            event,
        }) = self.events.recv().await
        {
            let (Some(node), Some(pool)) = (self.node.upgrade(), self.pool.upgrade()) else {
                break;
            };

            if !pool.has_node(&node) {
                debug!("[Node {}] Removed from the pool, stopping runner", node.name());

                break;
            }

            if !node.connection().is_current(generation) {
                trace!("[Node {}] Late event from connection #{}", node.name(), generation);
            }

            handle_event(&pool, &node, event);
        }
    }
}

pub(crate) fn handle_event(pool: &Lavalink, node: &Arc<Node>, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Open => {
            node.mark_open();
            info!("[Node {}] Connected", node.name());

            pool.load_balancer().on_node_connect(node);
            pool.dispatch(&FullEvent::NodeConnect {
                node: Arc::clone(node),
            });
        },
        ConnectionEvent::Message(text) => handle_message(pool, node, &text),
        ConnectionEvent::Close {
            code,
            reason,
            remote,
        } => {
            node.mark_closed();

            if code == close_codes::NORMAL {
                info!("[Node {}] Connection closed: {} {} (by remote: {})", node.name(), code, reason, remote);
            } else {
                warn!("[Node {}] Connection closed: {} {} (by remote: {})", node.name(), code, reason, remote);
            }

            pool.load_balancer().on_node_disconnect(node);
            pool.dispatch(&FullEvent::NodeDisconnect {
                node: Arc::clone(node),
                code,
                reason,
                by_remote: remote,
            });
        },
        ConnectionEvent::Error(why) => {
            warn!("[Node {}] Connection error: {}", node.name(), why);
        },
    }
}

fn handle_message(pool: &Lavalink, node: &Arc<Node>, text: &str) {
    let message = match serde_json::from_str::<IncomingMessage>(text) {
        Ok(message) => message,
        Err(why) => {
            warn!("[Node {}] Err deserializing text: {:?}; text: {}", node.name(), why, text);

            return;
        },
    };

    match message {
        IncomingMessage::Stats(stats) => node.set_stats(stats),
        IncomingMessage::StateUpdate(update) => {
            if let Some(link) = routed_link(pool, node, update.guild_id) {
                link.player().provide_state(update.state);
            }
        },
        IncomingMessage::Event(event) => {
            if let Some(link) = routed_link(pool, node, event.guild_id) {
                handle_node_event(pool, link, event);
            }
        },
        IncomingMessage::Unknown(op) => {
            warn!("[Node {}] Unexpected op {}: {}", node.name(), op, text);
        },
    }
}

/// The link a session-scoped frame is meant for.
///
/// The wire carries no node identity, so frames are only applied to a link still pinned to the
/// node they came from.
fn routed_link(pool: &Lavalink, node: &Node, guild_id: GuildId) -> Option<Arc<Link>> {
    let Some(link) = pool.existing_link(guild_id) else {
        debug!("[Node {}] Frame for unknown link {}", node.name(), guild_id);

        return None;
    };

    if !link.is_on(node) {
        debug!("[Node {}] Ignoring stale frame for link {}", node.name(), guild_id);

        return None;
    }

    Some(link)
}

fn handle_node_event(pool: &Lavalink, link: Arc<Link>, event: NodeEvent) {
    let NodeEvent {
        track,
        kind,
        ..
    } = event;

    if !matches!(kind, EventType::Unknown(_) | EventType::WebSocketClosed { .. }) {
        link.player().handle_event(&kind);
    }

    let full = match kind {
        EventType::Unknown(kind) => {
            warn!("[Link {}] Unknown event type {}", link.guild_id(), kind);

            return;
        },
        EventType::WebSocketClosed {
            code,
            reason,
            by_remote,
        } => {
            info!("[Link {}] Voice socket closed: {} {} (by remote: {})", link.guild_id(), code, reason, by_remote);

            FullEvent::VoiceSocketClosed {
                link,
                code,
                reason,
                by_remote,
            }
        },
        EventType::TrackStart => FullEvent::TrackStart {
            link,
            track,
        },
        EventType::TrackEnd {
            reason,
        } => FullEvent::TrackEnd {
            link,
            track,
            reason,
        },
        EventType::TrackException {
            exception,
        } => {
            warn!("[Link {}] Track exception: {:?}", link.guild_id(), exception);

            FullEvent::TrackException {
                link,
                track,
                exception,
            }
        },
        EventType::TrackStuck {
            threshold_ms,
        } => FullEvent::TrackStuck {
            link,
            track,
            threshold: Duration::from_millis(threshold_ms),
        },
    };

    pool.dispatch(&full);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{open_node, pool};
    use crate::model::stats::stats_for_test;
    use crate::model::Track;

    fn message(text: &str) -> ConnectionEvent {
        ConnectionEvent::Message(text.to_owned())
    }

    #[tokio::test]
    async fn stats_update_the_node() {
        let pool = pool();
        let (a, _rx) = open_node(&pool, "a");

        handle_event(
            &pool,
            &a,
            message(
                r#"{"op":"stats","players":3,"playingPlayers":1,"uptime":1000,
                "memory":{"free":1,"used":2,"allocated":3,"reservable":4},
                "cpu":{"cores":4,"systemLoad":0.25,"lavalinkLoad":0.1}}"#,
            ),
        );

        let stats = a.stats().unwrap();
        assert_eq!(stats.playing_players, 1);
        assert!((stats.system_load() - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let pool = pool();
        let (a, _rx) = open_node(&pool, "a");

        handle_event(&pool, &a, message("{not json"));
        handle_event(&pool, &a, message(r#"{"op":"somethingNew"}"#));

        assert!(a.stats().is_none());
        assert!(a.is_available());
    }

    #[tokio::test]
    async fn frames_from_a_previous_node_are_ignored() {
        let pool = pool();
        let (a, _rx_a) = open_node(&pool, "a");
        let (b, _rx_b) = open_node(&pool, "b");

        let link = pool.link(GuildId(1));
        link.change_node(Arc::clone(&a));

        let update = |connected: bool| {
            message(&format!(
                r#"{{"op":"stateUpdate","sessionKey":"1","state":{{"time":1,"position":500,"connected":{connected}}}}}"#
            ))
        };

        handle_event(&pool, &a, update(true));
        assert!(link.player().is_connected());

        link.change_node(Arc::clone(&b));

        handle_event(&pool, &a, update(false));
        assert!(link.player().is_connected());

        handle_event(&pool, &b, update(false));
        assert!(!link.player().is_connected());
    }

    #[tokio::test]
    async fn track_end_clears_the_player() {
        let pool = pool();
        let (a, _rx) = open_node(&pool, "a");
        a.set_stats(stats_for_test(0.0, None));

        let link = pool.link(GuildId(1));
        link.player().play_track(Track::new("abc")).unwrap();

        handle_event(
            &pool,
            &a,
            message(r#"{"op":"event","type":"TrackEndEvent","sessionKey":"1","track":"abc","reason":"REPLACED"}"#),
        );
        assert!(link.player().playing_track().is_some());

        handle_event(
            &pool,
            &a,
            message(r#"{"op":"event","type":"TrackEndEvent","sessionKey":"1","track":"abc","reason":"FINISHED"}"#),
        );
        assert!(link.player().playing_track().is_none());
    }

    #[tokio::test]
    async fn close_migrates_links() {
        let pool = pool();
        let (a, _rx_a) = open_node(&pool, "a");
        let (b, _rx_b) = open_node(&pool, "b");
        a.set_stats(stats_for_test(0.0, None));
        b.set_stats(stats_for_test(0.0, None));

        let link = pool.link(GuildId(1));
        assert!(Arc::ptr_eq(&link.node_or_select().unwrap(), &a));

        a.connection().set_loopback_state(crate::node::ReadyState::Closed);
        handle_event(
            &pool,
            &a,
            ConnectionEvent::Close {
                code: close_codes::ABNORMAL,
                reason: "Connection lost".to_owned(),
                remote: false,
            },
        );

        assert!(!a.is_available());
        assert!(link.is_on(&b));
    }
}

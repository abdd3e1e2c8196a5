//! Penalty based selection of nodes for sessions.
//!
//! The balancer holds no state of its own besides the registered [`PenaltyProvider`]s. Every
//! decision is computed on demand from the pool's nodes and links.

mod penalties;

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, warn};

pub use self::penalties::{
    cpu_penalty,
    deficit_frame_penalty,
    null_frame_penalty,
    Penalties,
    PenaltyProvider,
};
use crate::client::Lavalink;
use crate::internal::prelude::*;
use crate::link::Link;
use crate::model::id::GuildId;
use crate::node::Node;

pub struct LoadBalancer {
    pool: Weak<Lavalink>,
    providers: RwLock<Vec<Arc<dyn PenaltyProvider>>>,
}

impl LoadBalancer {
    pub(crate) fn new(pool: Weak<Lavalink>, providers: Vec<Arc<dyn PenaltyProvider>>) -> Self {
        Self {
            pool,
            providers: RwLock::new(providers),
        }
    }

    /// Registers an extra scoring signal.
    pub fn add_penalty_provider(&self, provider: Arc<dyn PenaltyProvider>) {
        self.providers.write().push(provider);
    }

    /// Removes a provider previously registered, returning whether it was found.
    pub fn remove_penalty_provider(&self, provider: &Arc<dyn PenaltyProvider>) -> bool {
        let mut providers = self.providers.write();
        let before = providers.len();

        providers.retain(|p| !same_provider(p, provider));

        providers.len() != before
    }

    /// Scores `node` for the session of `guild_id`.
    #[must_use]
    pub fn penalties(&self, node: &Arc<Node>, guild_id: GuildId) -> Penalties {
        let links = self.pool.upgrade().map(|pool| pool.links()).unwrap_or_default();

        Penalties::new(node, guild_id, &links, &self.providers())
    }

    /// Picks the node with the lowest penalty for the session of `guild_id`.
    ///
    /// Ties go to the node registered first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAvailableNode`] if no node is registered or none is available.
    #[cfg_attr(feature = "tracing_instrument", tracing::instrument(skip(self)))]
    pub fn determine_best_node(&self, guild_id: GuildId) -> Result<Arc<Node>> {
        let pool = self.pool.upgrade().ok_or(Error::NoAvailableNode)?;
        let links = pool.links();
        let providers = self.providers();

        let mut best: Option<(Arc<Node>, i32)> = None;

        for node in pool.nodes() {
            let total = Penalties::new(&node, guild_id, &links, &providers).total();

            if best.as_ref().map_or(true, |(_, lowest)| total < *lowest) {
                best = Some((node, total));
            }
        }

        match best {
            Some((node, total)) if node.is_available() => {
                debug!("[Load Balancer] Picked node {} for {} with penalty {}", node.name(), guild_id, total);

                Ok(node)
            },
            _ => Err(Error::NoAvailableNode),
        }
    }

    /// Migrates every link pinned to `node`, which just went down.
    ///
    /// Links for which no node is available are left unassigned; they select one lazily on their
    /// next send.
    pub fn on_node_disconnect(&self, node: &Arc<Node>) {
        let Some(pool) = self.pool.upgrade() else { return };

        for link in pool.links().iter().filter(|link| link.is_on(node)) {
            match self.determine_best_node(link.guild_id()) {
                Ok(best) => link.change_node(best),
                Err(why) => {
                    warn!("[Load Balancer] Could not migrate link {} off {}: {}", link.guild_id(), node.name(), why);

                    // A concurrent move to another node wins over the reset.
                    link.reset_node_if_on(node);
                },
            }
        }
    }

    /// Lets `node` claim every unassigned link, if it is the only available node.
    pub fn on_node_connect(&self, node: &Arc<Node>) {
        let Some(pool) = self.pool.upgrade() else { return };

        if pool.nodes().iter().any(|other| !Arc::ptr_eq(other, node) && other.is_available()) {
            return;
        }

        let claimed = pool.links().iter().filter(|link| link.claim(node)).count();

        if claimed > 0 {
            debug!("[Load Balancer] Node {} claimed {} links", node.name(), claimed);
        }
    }

    fn providers(&self) -> Vec<Arc<dyn PenaltyProvider>> {
        self.providers.read().clone()
    }
}

fn same_provider(a: &Arc<dyn PenaltyProvider>, b: &Arc<dyn PenaltyProvider>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{open_node, pool};
    use crate::model::stats::stats_for_test;

    #[tokio::test]
    async fn picks_lowest_penalty() {
        let pool = pool();
        let (a, _rx_a) = open_node(&pool, "a");
        let (b, _rx_b) = open_node(&pool, "b");

        // cpu_penalty(0.5) is 105, cpu_penalty(0.0) is 0
        a.set_stats(stats_for_test(0.5, None));
        b.set_stats(stats_for_test(0.0, None));

        let best = pool.load_balancer().determine_best_node(GuildId(1)).unwrap();
        assert!(Arc::ptr_eq(&best, &b));
    }

    #[tokio::test]
    async fn ties_go_to_registration_order() {
        let pool = pool();
        let (a, _rx_a) = open_node(&pool, "a");
        let (b, _rx_b) = open_node(&pool, "b");

        a.set_stats(stats_for_test(0.0, None));
        b.set_stats(stats_for_test(0.0, None));

        let best = pool.load_balancer().determine_best_node(GuildId(1)).unwrap();
        assert!(Arc::ptr_eq(&best, &a));
    }

    #[tokio::test]
    async fn no_available_node() {
        let pool = pool();

        assert!(matches!(
            pool.load_balancer().determine_best_node(GuildId(1)),
            Err(Error::NoAvailableNode)
        ));

        // Registered, but never connected and without statistics.
        pool.add_node("a", "ws://127.0.0.1:1", "pw", None).unwrap();

        assert!(matches!(
            pool.load_balancer().determine_best_node(GuildId(1)),
            Err(Error::NoAvailableNode)
        ));
    }

    #[tokio::test]
    async fn nodes_without_stats_score_unavailable() {
        let pool = pool();
        let (a, _rx) = open_node(&pool, "a");

        let penalties = pool.load_balancer().penalties(&a, GuildId(1));
        assert_eq!(penalties.total(), crate::constants::UNAVAILABLE_PENALTY);

        a.set_stats(stats_for_test(0.0, None));
        assert_eq!(pool.load_balancer().penalties(&a, GuildId(1)).total(), 0);
    }

    #[tokio::test]
    async fn playing_links_add_one_each() {
        let pool = pool();
        let (a, _rx) = open_node(&pool, "a");
        a.set_stats(stats_for_test(0.0, Some((0, 0))));

        let before = pool.load_balancer().penalties(&a, GuildId(1)).total();

        let link = pool.link(GuildId(2));
        link.change_node(Arc::clone(&a));
        link.player().play_track(crate::model::Track::new("abc")).unwrap();

        let after = pool.load_balancer().penalties(&a, GuildId(1)).total();
        assert_eq!(after, before + 1);

        link.player().set_paused(true).unwrap();
        assert_eq!(pool.load_balancer().penalties(&a, GuildId(1)).total(), before);
    }

    #[tokio::test]
    async fn node_reported_players_score_from_stats() {
        let pool = pool();
        let (a, _rx) = open_node(&pool, "a");

        let mut stats = stats_for_test(0.0, None);
        stats.playing_players = 7;
        a.set_stats(stats);

        let penalties = Penalties::from_stats(&a, GuildId(1));
        assert_eq!(penalties.player_penalty, 7);
        assert_eq!(penalties.total(), 7);

        // The pool-based score only counts links playing on the node.
        assert_eq!(pool.load_balancer().penalties(&a, GuildId(1)).player_penalty, 0);
    }

    #[tokio::test]
    async fn penalty_providers() {
        let pool = pool();
        let (a, _rx_a) = open_node(&pool, "a");
        let (b, _rx_b) = open_node(&pool, "b");
        a.set_stats(stats_for_test(0.0, None));
        b.set_stats(stats_for_test(0.0, None));

        let provider: Arc<dyn PenaltyProvider> =
            Arc::new(|p: &Penalties| if p.node.name() == "a" { 50 } else { 0 });
        pool.load_balancer().add_penalty_provider(Arc::clone(&provider));

        let best = pool.load_balancer().determine_best_node(GuildId(1)).unwrap();
        assert!(Arc::ptr_eq(&best, &b));

        assert!(pool.load_balancer().remove_penalty_provider(&provider));
        assert!(!pool.load_balancer().remove_penalty_provider(&provider));

        let best = pool.load_balancer().determine_best_node(GuildId(1)).unwrap();
        assert!(Arc::ptr_eq(&best, &a));
    }

    #[tokio::test]
    async fn failover_moves_links_to_the_next_best_node() {
        let pool = pool();
        let (a, _rx_a) = open_node(&pool, "a");
        let (b, _rx_b) = open_node(&pool, "b");
        a.set_stats(stats_for_test(0.05, None));
        b.set_stats(stats_for_test(0.1, None));

        let link = pool.link(GuildId(1));
        assert!(Arc::ptr_eq(&link.node_or_select().unwrap(), &a));

        a.connection().set_loopback_state(crate::node::ReadyState::Closed);
        a.mark_closed();
        pool.load_balancer().on_node_disconnect(&a);

        assert!(Arc::ptr_eq(&link.node().unwrap(), &b));
    }

    #[tokio::test]
    async fn failover_without_nodes_leaves_links_unassigned() {
        let pool = pool();
        let (a, _rx_a) = open_node(&pool, "a");
        a.set_stats(stats_for_test(0.0, None));

        let link = pool.link(GuildId(1));
        link.node_or_select().unwrap();

        a.connection().set_loopback_state(crate::node::ReadyState::Closed);
        a.mark_closed();
        pool.load_balancer().on_node_disconnect(&a);

        assert!(link.node().is_none());
    }

    #[tokio::test]
    async fn first_node_claims_unassigned_links() {
        let pool = pool();
        let links: Vec<Arc<Link>> = (1..=3).map(|id| pool.link(GuildId(id))).collect();

        let (a, _rx_a) = open_node(&pool, "a");
        pool.load_balancer().on_node_connect(&a);

        for link in &links {
            assert!(Arc::ptr_eq(&link.node().unwrap(), &a));
        }

        let (b, _rx_b) = open_node(&pool, "b");
        pool.load_balancer().on_node_connect(&b);

        for link in &links {
            assert!(Arc::ptr_eq(&link.node().unwrap(), &a));
        }
    }
}

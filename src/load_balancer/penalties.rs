use std::fmt;
use std::sync::Arc;

use crate::constants::UNAVAILABLE_PENALTY;
use crate::link::Link;
use crate::model::id::GuildId;
use crate::model::stats::RemoteStats;
use crate::node::Node;

/// An extra scoring signal added to every node's penalty.
///
/// Any `Fn(&Penalties) -> i32` closure is a provider.
pub trait PenaltyProvider: Send + Sync {
    /// The penalty to add to the given node's score. Lower is better.
    fn penalty(&self, penalties: &Penalties) -> i32;
}

impl<F> PenaltyProvider for F
where
    F: Fn(&Penalties) -> i32 + Send + Sync,
{
    fn penalty(&self, penalties: &Penalties) -> i32 {
        self(penalties)
    }
}

/// CPU penalty: superlinear in the system load fraction.
#[must_use]
pub fn cpu_penalty(system_load: f64) -> i32 {
    (1.05_f64.powf(100.0 * system_load) * 10.0).round() as i32 - 10
}

/// Penalty for frames per minute that arrived late.
#[must_use]
pub fn deficit_frame_penalty(deficit_per_minute: i64) -> i32 {
    (1.03_f64.powf(500.0 * (deficit_per_minute as f64 / 3000.0)) * 600.0).round() as i32 - 600
}

/// Penalty for frames per minute that were never produced, weighted twice as heavily as late ones.
#[must_use]
pub fn null_frame_penalty(nulled_per_minute: i64) -> i32 {
    let base = (1.03_f64.powf(500.0 * (nulled_per_minute as f64 / 3000.0)) * 300.0).round() as i32 - 300;

    base.saturating_mul(2)
}

/// The score of one node for one session, lower is better.
#[derive(Clone)]
#[non_exhaustive]
pub struct Penalties {
    pub node: Arc<Node>,
    pub guild_id: GuildId,
    /// Whether the node was available when scored.
    pub available: bool,
    /// The statistics the score is based on.
    pub stats: Option<RemoteStats>,
    pub player_penalty: i32,
    pub cpu_penalty: i32,
    pub deficit_frame_penalty: i32,
    pub null_frame_penalty: i32,
    /// Sum of all [`PenaltyProvider`]s.
    pub extension_penalty: i32,
}

impl Penalties {
    /// Scores `node`, counting the links in `links` that are playing on it.
    pub(crate) fn new(
        node: &Arc<Node>,
        guild_id: GuildId,
        links: &[Arc<Link>],
        providers: &[Arc<dyn PenaltyProvider>],
    ) -> Self {
        let playing = links.iter().filter(|link| link.is_on(node) && link.is_playing()).count();

        let mut penalties = Self::with_playing(node, guild_id, playing);

        penalties.extension_penalty = providers
            .iter()
            .fold(0_i32, |sum, provider| sum.saturating_add(provider.penalty(&penalties)));

        penalties
    }

    /// Scores `node` from its own statistics alone, using the node-reported count of playing
    /// players instead of the pool's links.
    #[must_use]
    pub fn from_stats(node: &Arc<Node>, guild_id: GuildId) -> Self {
        let playing = node.stats().map_or(0, |stats| stats.playing_players as usize);

        Self::with_playing(node, guild_id, playing)
    }

    fn with_playing(node: &Arc<Node>, guild_id: GuildId, playing: usize) -> Self {
        let stats = node.stats();

        let mut penalties = Self {
            node: Arc::clone(node),
            guild_id,
            available: node.is_available(),
            stats: None,
            player_penalty: i32::try_from(playing).unwrap_or(i32::MAX),
            cpu_penalty: 0,
            deficit_frame_penalty: 0,
            null_frame_penalty: 0,
            extension_penalty: 0,
        };

        if let Some(stats) = stats {
            penalties.cpu_penalty = cpu_penalty(stats.system_load());

            // Absent until the node has been sending audio for a while.
            if let Some(deficit) = stats.avg_frames_deficit_per_minute().filter(|d| *d != -1) {
                penalties.deficit_frame_penalty = deficit_frame_penalty(deficit);
            }

            if let Some(nulled) = stats.avg_frames_nulled_per_minute().filter(|n| *n != -1) {
                penalties.null_frame_penalty = null_frame_penalty(nulled);
            }

            penalties.stats = Some(stats);
        }

        penalties
    }

    /// The total penalty.
    ///
    /// Nodes that are unavailable or have not reported statistics yet score
    /// [`UNAVAILABLE_PENALTY`], worse than any real score.
    #[must_use]
    pub fn total(&self) -> i32 {
        if !self.available || self.stats.is_none() {
            return UNAVAILABLE_PENALTY;
        }

        self.player_penalty
            .saturating_add(self.cpu_penalty)
            .saturating_add(self.deficit_frame_penalty)
            .saturating_add(self.null_frame_penalty)
            .saturating_add(self.extension_penalty)
    }
}

impl fmt::Debug for Penalties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Penalties")
            .field("node", &self.node.name())
            .field("guild_id", &self.guild_id)
            .field("available", &self.available)
            .field("player_penalty", &self.player_penalty)
            .field("cpu_penalty", &self.cpu_penalty)
            .field("deficit_frame_penalty", &self.deficit_frame_penalty)
            .field("null_frame_penalty", &self.null_frame_penalty)
            .field("extension_penalty", &self.extension_penalty)
            .field("total", &self.total())
            .finish()
    }
}

use std::num::NonZeroU64;
use std::time::Duration;

use crate::constants;
use crate::model::id::UserId;

/// Settings for the pool and the connections it opens.
///
/// # Examples
///
/// Create new settings, specifying a longer handshake timeout:
///
/// ```rust
/// use std::time::Duration;
///
/// use lavalink_client::client::Settings;
///
/// let mut settings = Settings::default();
/// settings.handshake_timeout = Duration::from_secs(10);
/// ```
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Settings {
    /// The bot's user id, sent to every node on handshake.
    ///
    /// Must be known before the first node is added. Defaults to none.
    pub user_id: Option<UserId>,
    /// The total number of gateway shards of the bot.
    ///
    /// Must be known before the first node is added. Defaults to none.
    pub shard_count: Option<NonZeroU64>,
    /// The name sent in the client name handshake header.
    ///
    /// Defaults to [`constants::CLIENT_NAME`].
    pub client_name: String,
    /// How often the reconnect scheduler sweeps the nodes.
    ///
    /// Defaults to [`constants::RECONNECT_INTERVAL`].
    pub reconnect_interval: Duration,
    /// The unit of the linear reconnect backoff.
    ///
    /// Defaults to [`constants::RECONNECT_BACKOFF`].
    pub reconnect_backoff: Duration,
    /// Defaults to [`constants::HANDSHAKE_TIMEOUT`].
    pub handshake_timeout: Duration,
    /// Silence after which a connection is treated as lost.
    ///
    /// Defaults to [`constants::CONNECTION_LOST_TIMEOUT`].
    pub connection_lost_timeout: Duration,
    /// Whether to run the reconnect scheduler at all.
    ///
    /// Defaults to true.
    pub auto_reconnect: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_id: None,
            shard_count: None,
            client_name: constants::CLIENT_NAME.to_owned(),
            reconnect_interval: constants::RECONNECT_INTERVAL,
            reconnect_backoff: constants::RECONNECT_BACKOFF,
            handshake_timeout: constants::HANDSHAKE_TIMEOUT,
            connection_lost_timeout: constants::CONNECTION_LOST_TIMEOUT,
            auto_reconnect: true,
        }
    }
}

//! A set of constants used by the library.

use std::time::Duration;

/// The name sent in the `Client-Name` header of every node handshake.
pub const CLIENT_NAME: &str = "Lavalink-Client";

/// Prefix of the names generated for nodes registered without one.
pub const NODE_NAME_PREFIX: &str = "Lavalink_Node_#";

/// How often the reconnect scheduler sweeps the registered nodes.
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(500);

/// The unit of the linear reconnect backoff.
///
/// The `n`th attempt of a node is made no sooner than `(n - 1)` units after the previous one.
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(2000);

/// Time a node handshake may take before the attempt is treated as failed.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Time without any inbound frame after which a node connection is considered lost.
pub const CONNECTION_LOST_TIMEOUT: Duration = Duration::from_secs(60);

/// The highest penalty a node can be scored at.
pub const MAX_PENALTY: i32 = i32::MAX;

/// Penalty given to nodes that are unavailable or have not reported statistics yet.
pub const UNAVAILABLE_PENALTY: i32 = MAX_PENALTY - 1;

/// Volume bounds accepted by nodes.
pub const MIN_VOLUME: u16 = 0;
pub const MAX_VOLUME: u16 = 1000;
pub const DEFAULT_VOLUME: u16 = 100;

/// Websocket close codes used when talking to nodes.
pub mod close_codes {
    /// The connection was closed on purpose.
    pub const NORMAL: u16 = 1000;
    /// The node is going away, for example because it is restarting.
    pub const GOING_AWAY: u16 = 1001;
    /// No close frame was received, or the connection was dropped locally.
    pub const ABNORMAL: u16 = 1006;
}

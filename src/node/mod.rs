//! Remote audio nodes and their control connections.
//!
//! A [`Node`] is owned by the [`Lavalink`] pool. Its [`NodeConnection`] hides the sequence of
//! physical websocket connections behind one logical channel, and the
//! [`ReconnectScheduler`] re-opens it whenever it goes down.
//!
//! [`Lavalink`]: crate::client::Lavalink

mod connection;
mod error;
mod ext;
mod reconnect;
mod runner;

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use url::Url;

#[cfg(test)]
pub(crate) use self::connection::Command;
pub use self::connection::{NodeConnection, ReadyState};
pub(crate) use self::connection::{ConnectOptions, ConnectionEvent, TaggedEvent};
pub use self::error::Error as NodeError;
pub use self::ext::NodeConnectionExt;
pub(crate) use self::reconnect::{should_attempt, ReconnectScheduler, ReconnectSchedulerMessage};
pub(crate) use self::runner::NodeRunner;
use crate::client::{ConfigurationError, Settings};
use crate::internal::prelude::*;
use crate::model::id::UserId;
use crate::model::stats::RemoteStats;

#[derive(Debug, Default)]
pub(crate) struct ReconnectState {
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
}

/// One remote audio-processing endpoint.
pub struct Node {
    name: Arc<str>,
    address: Url,
    password: SecretString,
    connection: NodeConnection,
    available: AtomicBool,
    stats: RwLock<Option<RemoteStats>>,
    reconnect: Mutex<ReconnectState>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: &str,
        address: Url,
        password: SecretString,
        resume_key: Option<&str>,
        user_id: UserId,
        shard_count: NonZeroU64,
        settings: &Settings,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TaggedEvent>)> {
        let header = |name: &'static str, value: &str| {
            HeaderValue::from_str(value).map_err(|_| ConfigurationError::InvalidHeader(name))
        };

        let mut authorization = header("authorization", password.expose_secret())?;
        authorization.set_sensitive(true);

        let mut headers = vec![
            ("authorization", authorization),
            ("num-shards", header("num-shards", &shard_count.to_string())?),
            ("user-id", header("user-id", &user_id.to_string())?),
            ("client-name", header("client-name", &settings.client_name)?),
        ];

        if let Some(key) = resume_key {
            headers.push(("resume-key", header("resume-key", key)?));
        }

        let options = ConnectOptions {
            url: address.clone(),
            headers,
            handshake_timeout: settings.handshake_timeout,
            connection_lost_timeout: settings.connection_lost_timeout,
        };
        // Surface a malformed address now rather than on every reconnect.
        options.request()?;

        let name: Arc<str> = name.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let node = Arc::new(Self {
            connection: NodeConnection::new(Arc::clone(&name), options, tx),
            name,
            address,
            password,
            available: AtomicBool::new(false),
            stats: RwLock::new(None),
            reconnect: Mutex::new(ReconnectState::default()),
        });

        Ok((node, rx))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn address(&self) -> &Url {
        &self.address
    }

    #[must_use]
    pub fn connection(&self) -> &NodeConnection {
        &self.connection
    }

    /// Whether the node can take sessions: its connection is open and not closing.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
            && self.connection.is_open()
            && !self.connection.is_closing()
    }

    /// The latest statistics reported by the node, absent until the first report after connecting.
    #[must_use]
    pub fn stats(&self) -> Option<RemoteStats> {
        self.stats.read().clone()
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect.lock().attempts
    }

    pub(crate) fn set_stats(&self, stats: RemoteStats) {
        *self.stats.write() = Some(stats);
    }

    pub(crate) fn mark_open(&self) {
        self.available.store(true, Ordering::Release);
        self.reconnect.lock().attempts = 0;
    }

    pub(crate) fn mark_closed(&self) {
        self.available.store(false, Ordering::Release);
    }

    /// Counts a reconnect attempt if the backoff allows one at `now`.
    pub(crate) fn try_begin_reconnect(&self, now: Instant, backoff: std::time::Duration) -> bool {
        if !self.connection.is_closed() || self.connection.is_connecting() {
            return false;
        }

        let mut reconnect = self.reconnect.lock();

        if !should_attempt(reconnect.attempts, reconnect.last_attempt, now, backoff) {
            return false;
        }

        reconnect.attempts += 1;
        reconnect.last_attempt = Some(now);

        true
    }

    #[cfg(test)]
    pub(crate) fn set_reconnect_state(&self, attempts: u32, last_attempt: Option<Instant>) {
        *self.reconnect.lock() = ReconnectState {
            attempts,
            last_attempt,
        };
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("address", &self.address.as_str())
            .field("password", &self.password)
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;

    pub(crate) fn node(name: &str) -> (Arc<Node>, mpsc::UnboundedReceiver<TaggedEvent>) {
        Node::new(
            name,
            Url::parse("ws://127.0.0.1:1").unwrap(),
            SecretString::new("youshallnotpass".into()),
            None,
            UserId(1),
            NonZeroU64::MIN,
            &Settings::default(),
        )
        .unwrap()
    }

    #[test]
    fn password_is_redacted() {
        let (node, _rx) = node("a");

        let debug = format!("{node:?}");

        assert!(!debug.contains("youshallnotpass"));
        assert_eq!(node.to_string(), "a (ws://127.0.0.1:1/)");
    }

    #[test]
    fn availability_needs_open_connection() {
        let (node, _rx) = node("a");

        node.mark_open();
        assert!(!node.is_available());

        let (_, _out) = node.connection().open_loopback();
        assert!(node.is_available());

        node.connection().set_loopback_state(ReadyState::Closing);
        assert!(!node.is_available());
    }

    #[test]
    fn reconnect_attempts_follow_backoff() {
        let (node, _rx) = node("a");
        let unit = Duration::from_secs(2);
        let start = Instant::now();

        assert!(node.try_begin_reconnect(start, unit));
        assert_eq!(node.reconnect_attempts(), 1);
        assert!(!node.try_begin_reconnect(start + Duration::from_millis(500), unit));
        assert!(node.try_begin_reconnect(start + unit, unit));
        assert_eq!(node.reconnect_attempts(), 2);

        node.mark_open();
        assert_eq!(node.reconnect_attempts(), 0);
    }

    #[test]
    fn invalid_header_is_a_configuration_error() {
        let result = Node::new(
            "a",
            Url::parse("ws://127.0.0.1:1").unwrap(),
            SecretString::new("bad\npassword".into()),
            None,
            UserId(1),
            NonZeroU64::MIN,
            &Settings::default(),
        );

        assert!(matches!(
            result,
            Err(Error::Config(ConfigurationError::InvalidHeader("authorization")))
        ));
    }
}

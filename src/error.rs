use std::error::Error as StdError;
use std::fmt;

use serde_json::Error as JsonError;
use tokio_tungstenite::tungstenite::Error as TungsteniteError;
use url::ParseError as UrlError;

use crate::client::{ConfigurationError, GatewayError};
use crate::link::IllegalStateError;
use crate::node::NodeError;

/// The common result type between most library functions.
///
/// The library exposes functions which, for a result type, exposes only one type, rather than the
/// usual 2 (`Result<T, Error>`). This is because all functions that return a result return
/// lavalink-client's [`Error`], so this is implied, and a "simpler" result is used.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A common error enum returned by most of the library's functionality within a custom [`Result`].
///
/// Errors that reflect a mistake by the caller ([`Self::Config`], [`Self::State`]) and errors that
/// reflect true unavailability ([`Self::NoAvailableNode`]) are surfaced synchronously. Connection
/// level failures are handled by the reconnect scheduler and only show up here when a caller
/// explicitly waits on a handshake.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A prerequisite setting is missing or a node registration collides with an existing one.
    Config(ConfigurationError),
    /// An operation was attempted in a state that does not allow it.
    State(IllegalStateError),
    /// The load balancer found no node able to take a session.
    NoAvailableNode,
    /// A node connection failed.
    Node(NodeError),
    /// The voice gateway collaborator failed to join or leave a channel.
    Gateway(GatewayError),
    /// An error from the [`serde_json`] crate.
    Json(JsonError),
    /// An error from the `tungstenite` crate.
    Tungstenite(Box<TungsteniteError>),
    /// An error from the [`url`] crate.
    Url(UrlError),
}

impl From<ConfigurationError> for Error {
    fn from(e: ConfigurationError) -> Error {
        Error::Config(e)
    }
}

impl From<IllegalStateError> for Error {
    fn from(e: IllegalStateError) -> Error {
        Error::State(e)
    }
}

impl From<NodeError> for Error {
    fn from(e: NodeError) -> Error {
        Error::Node(e)
    }
}

impl From<GatewayError> for Error {
    fn from(e: GatewayError) -> Error {
        Error::Gateway(e)
    }
}

impl From<JsonError> for Error {
    fn from(e: JsonError) -> Error {
        Error::Json(e)
    }
}

impl From<TungsteniteError> for Error {
    fn from(e: TungsteniteError) -> Error {
        Error::Tungstenite(Box::new(e))
    }
}

impl From<UrlError> for Error {
    fn from(e: UrlError) -> Error {
        Error::Url(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(inner) => fmt::Display::fmt(&inner, f),
            Self::State(inner) => fmt::Display::fmt(&inner, f),
            Self::NoAvailableNode => f.write_str("No available node"),
            Self::Node(inner) => fmt::Display::fmt(&inner, f),
            Self::Gateway(inner) => fmt::Display::fmt(&inner, f),
            Self::Json(inner) => fmt::Display::fmt(&inner, f),
            Self::Tungstenite(inner) => fmt::Display::fmt(&inner, f),
            Self::Url(inner) => fmt::Display::fmt(&inner, f),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Config(inner) => Some(inner),
            Self::State(inner) => Some(inner),
            Self::NoAvailableNode => None,
            Self::Node(inner) => Some(inner),
            Self::Gateway(inner) => Some(inner),
            Self::Json(inner) => Some(inner),
            Self::Tungstenite(inner) => Some(inner),
            Self::Url(inner) => Some(inner),
        }
    }
}

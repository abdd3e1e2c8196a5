use std::error::Error as StdError;
use std::fmt;

/// An error that occurred while establishing or holding a node connection.
///
/// Note that - from a user standpoint - there should be no situation in which you manually handle
/// these, unless you explicitly wait on a handshake with [`NodeConnection::connect_blocking`].
///
/// [`NodeConnection::connect_blocking`]: super::NodeConnection::connect_blocking
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The handshake did not complete in time.
    HandshakeTimeout,
    /// The handshake was rejected or the transport failed before the connection opened.
    HandshakeFailed(String),
    /// The connection was closed before it opened.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeTimeout => f.write_str("Node handshake timed out"),
            Self::HandshakeFailed(why) => write!(f, "Node handshake failed: {why}"),
            Self::Closed => f.write_str("Node connection closed"),
        }
    }
}

impl StdError for Error {}

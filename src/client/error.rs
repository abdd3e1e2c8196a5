use std::error::Error as StdError;
use std::fmt;

/// A prerequisite setting is missing or a node registration is invalid.
///
/// This is always wrapped within the library's generic [`Error::Config`] variant.
///
/// [`Error::Config`]: crate::Error::Config
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A node was added before the bot's user id was set.
    MissingUserId,
    /// A node was added, or a shard was computed, before the shard count was set.
    MissingShardCount,
    /// A node with this name is already registered.
    DuplicateNodeName(String),
    /// The user id or shard count was changed after nodes were registered.
    NodesRegistered,
    /// The named handshake header could not be built from the given value.
    InvalidHeader(&'static str),
    /// A link tried to join or leave a voice channel, but no voice gateway was configured.
    MissingVoiceGateway,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingUserId => f.write_str("User id must be set before adding nodes"),
            Self::MissingShardCount => f.write_str("Shard count must be set before adding nodes"),
            Self::DuplicateNodeName(name) => write!(f, "A node named {name} is already registered"),
            Self::NodesRegistered => {
                f.write_str("Cannot change the user id or shard count after nodes were added")
            },
            Self::InvalidHeader(name) => write!(f, "Invalid value for the {name} header"),
            Self::MissingVoiceGateway => f.write_str("No voice gateway configured"),
        }
    }
}

impl StdError for Error {}

use std::error::Error as StdError;
use std::fmt;

use super::LinkState;

/// An operation was attempted in a state that does not allow it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The link cannot move from one state to the other.
    Transition { from: LinkState, to: LinkState },
    /// A frame was sent while the link has no node assigned.
    NoNode,
    /// The link was destroyed or its pool is gone.
    Detached,
    /// Seeking requires a playing track.
    NotPlaying,
    /// The playing track does not support seeking.
    NotSeekable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transition {
                from,
                to,
            } => write!(f, "Illegal link state transition from {from} to {to}"),
            Self::NoNode => f.write_str("Link has no node assigned"),
            Self::Detached => f.write_str("Link no longer belongs to a pool"),
            Self::NotPlaying => f.write_str("Player is not playing a track"),
            Self::NotSeekable => f.write_str("Track is not seekable"),
        }
    }
}

impl StdError for Error {}

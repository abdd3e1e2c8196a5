use std::time::Duration;

/// A playable item in the node's opaque encoded form.
///
/// Encoding and decoding tracks is done by the node; the client only carries the string along
/// with the few properties it needs to resume playback elsewhere.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct Track {
    pub encoded: String,
    /// Total length of the track, absent for streams.
    pub length: Option<Duration>,
    pub seekable: bool,
    /// Position to start playing from.
    pub start_time: Duration,
    /// Position to stop playing at.
    pub end_time: Option<Duration>,
}

impl Track {
    #[must_use]
    pub fn new(encoded: impl Into<String>) -> Self {
        Self {
            encoded: encoded.into(),
            length: None,
            seekable: true,
            start_time: Duration::ZERO,
            end_time: None,
        }
    }

    #[must_use]
    pub fn length(mut self, length: Duration) -> Self {
        self.length = Some(length);
        self
    }

    #[must_use]
    pub fn seekable(mut self, seekable: bool) -> Self {
        self.seekable = seekable;
        self
    }

    #[must_use]
    pub fn start_time(mut self, start_time: Duration) -> Self {
        self.start_time = start_time;
        self
    }

    #[must_use]
    pub fn end_time(mut self, end_time: Duration) -> Self {
        self.end_time = Some(end_time);
        self
    }
}

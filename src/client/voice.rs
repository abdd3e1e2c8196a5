use std::error::Error as StdError;
use std::fmt;

use crate::model::id::{ChannelId, GuildId};

/// The bot's connection to the chat platform, used to join and leave voice channels.
///
/// The pool never talks to the platform itself. Implementors typically queue an opcode 4 voice
/// state update on the shard identified by `shard_id`, then feed the resulting voice state and
/// voice server updates back through [`Lavalink::on_voice_state_update`] and
/// [`Lavalink::on_voice_server_update`].
///
/// [`Lavalink::on_voice_state_update`]: super::Lavalink::on_voice_state_update
/// [`Lavalink::on_voice_server_update`]: super::Lavalink::on_voice_server_update
pub trait VoiceGateway: Send + Sync {
    /// Requests the bot to join `channel_id`.
    fn connect(&self, guild_id: GuildId, channel_id: ChannelId, shard_id: u64) -> Result<(), GatewayError>;

    /// Requests the bot to leave whatever voice channel it occupies in `guild_id`.
    fn disconnect(&self, guild_id: GuildId, shard_id: u64) -> Result<(), GatewayError>;
}

/// An error raised by a [`VoiceGateway`] implementation.
pub struct GatewayError(Box<dyn StdError + Send + Sync>);

impl GatewayError {
    pub fn new(inner: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self(inner.into())
    }
}

impl fmt::Debug for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GatewayError").field(&self.0).finish()
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Voice gateway error: {}", self.0)
    }
}

impl StdError for GatewayError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.0)
    }
}

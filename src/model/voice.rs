//! Voice gateway credentials forwarded to nodes.

use std::fmt;

use super::id::GuildId;

/// The `VOICE_SERVER_UPDATE` payload handed out by the voice gateway.
///
/// It is cached by the owning [`Link`] so the session can be re-bound to another node later.
///
/// [`Link`]: crate::link::Link
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
pub struct VoiceServerUpdate {
    pub guild_id: GuildId,
    /// May be absent while the voice server is being reallocated.
    pub endpoint: Option<String>,
    pub token: String,
}

impl VoiceServerUpdate {
    #[must_use]
    pub fn new(guild_id: impl Into<GuildId>, endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            endpoint: Some(endpoint.into()),
            token: token.into(),
        }
    }
}

impl fmt::Debug for VoiceServerUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceServerUpdate")
            .field("guild_id", &self.guild_id)
            .field("endpoint", &self.endpoint)
            .field("token", &"<secret>")
            .finish()
    }
}

/// Gateway credentials last supplied for a session: the voice session id plus the server update.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VoiceCredentials {
    pub session_id: String,
    pub server_update: VoiceServerUpdate,
}

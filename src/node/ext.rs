use std::time::Duration;

use serde_json::json;
use tracing::{debug, trace};

use super::NodeConnection;
use crate::internal::prelude::*;
use crate::model::id::GuildId;
use crate::model::track::Track;
use crate::model::voice::VoiceCredentials;

/// Session-addressed frames a client sends to a node.
///
/// Like every send on a [`NodeConnection`], these are dropped while the connection is not open.
pub trait NodeConnectionExt {
    /// Routes the session through this node using the given voice gateway credentials.
    fn send_bind(&self, guild_id: GuildId, credentials: &VoiceCredentials);

    /// Tears down the session's routing on this node.
    fn send_release(&self, guild_id: GuildId);

    fn send_play(&self, guild_id: GuildId, track: &Track, position: Duration, paused: bool, volume: u16);

    fn send_stop(&self, guild_id: GuildId);

    fn send_pause(&self, guild_id: GuildId, paused: bool);

    fn send_seek(&self, guild_id: GuildId, position: Duration);

    fn send_volume(&self, guild_id: GuildId, volume: u16);

    /// Sends the filters payload, merged into the frame's top level.
    fn send_filters(&self, guild_id: GuildId, filters: &Value);
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl NodeConnectionExt for NodeConnection {
    fn send_bind(&self, guild_id: GuildId, credentials: &VoiceCredentials) {
        debug!("[Link {}] Binding session", guild_id);

        self.send(&json!({
            "op": "bind",
            "sessionKey": guild_id,
            "sessionId": credentials.session_id,
            "event": credentials.server_update,
        }));
    }

    fn send_release(&self, guild_id: GuildId) {
        debug!("[Link {}] Releasing session", guild_id);

        self.send(&json!({
            "op": "release",
            "sessionKey": guild_id,
        }));
    }

    fn send_play(&self, guild_id: GuildId, track: &Track, position: Duration, paused: bool, volume: u16) {
        trace!("[Link {}] Playing from {:?}", guild_id, position);

        let mut frame = json!({
            "op": "play",
            "sessionKey": guild_id,
            "track": track.encoded,
            "startTime": millis(position),
            "pause": paused,
            "volume": volume,
        });

        if let Some(end_time) = track.end_time {
            frame["endTime"] = json!(millis(end_time));
        }

        self.send(&frame);
    }

    fn send_stop(&self, guild_id: GuildId) {
        self.send(&json!({
            "op": "stop",
            "sessionKey": guild_id,
        }));
    }

    fn send_pause(&self, guild_id: GuildId, paused: bool) {
        self.send(&json!({
            "op": "pause",
            "sessionKey": guild_id,
            "pause": paused,
        }));
    }

    fn send_seek(&self, guild_id: GuildId, position: Duration) {
        self.send(&json!({
            "op": "seek",
            "sessionKey": guild_id,
            "position": millis(position),
        }));
    }

    fn send_volume(&self, guild_id: GuildId, volume: u16) {
        self.send(&json!({
            "op": "volume",
            "sessionKey": guild_id,
            "volume": volume,
        }));
    }

    fn send_filters(&self, guild_id: GuildId, filters: &Value) {
        let mut frame = JsonMap::new();

        if let Value::Object(filters) = filters {
            frame.extend(filters.clone());
        }

        frame.insert("op".into(), json!("filters"));
        frame.insert("sessionKey".into(), json!(guild_id));

        self.send(&Value::Object(frame));
    }
}

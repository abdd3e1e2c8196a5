//! Frames received from a node, decoded once at the connection boundary.

use serde::de::{DeserializeOwned, Error as DeError};
use serde::{Deserialize, Deserializer};
use serde_json::Result as JsonResult;

use super::id::GuildId;
use super::stats::RemoteStats;
use crate::internal::prelude::*;

/// A frame sent by a node.
///
/// Unknown ops do not fail decoding; they are kept as [`Self::Unknown`] so the caller can log and
/// drop them.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum IncomingMessage {
    /// Periodic playback position report for one session.
    StateUpdate(StateUpdate),
    /// Node-wide load statistics.
    Stats(RemoteStats),
    /// Lifecycle event of one session's playback.
    Event(NodeEvent),
    /// A frame with an op this client does not know.
    Unknown(String),
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct StateUpdate {
    pub guild_id: GuildId,
    pub state: PlayerStateUpdate,
}

/// The `state` object of a `stateUpdate` frame.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[non_exhaustive]
pub struct PlayerStateUpdate {
    /// Node-side unix time of the report, in milliseconds.
    pub time: u64,
    /// Playback position in milliseconds.
    #[serde(default)]
    pub position: u64,
    /// Whether the node is connected to the voice server.
    #[serde(default = "default_true")]
    pub connected: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct NodeEvent {
    pub guild_id: GuildId,
    /// The encoded track the event refers to, if any.
    pub track: Option<String>,
    pub kind: EventType,
}

/// The closed set of playback events a node may report.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum EventType {
    TrackStart,
    TrackEnd { reason: TrackEndReason },
    TrackException { exception: TrackException },
    TrackStuck { threshold_ms: u64 },
    /// The node's connection to the voice server closed.
    WebSocketClosed { code: u16, reason: String, by_remote: bool },
    /// An event type this client does not know.
    Unknown(String),
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[non_exhaustive]
pub struct TrackException {
    pub message: Option<String>,
    pub severity: Option<String>,
    pub cause: Option<String>,
}

fn remove_field<T: DeserializeOwned>(map: &mut JsonMap, key: &'static str) -> JsonResult<T> {
    map.remove(key).ok_or_else(|| DeError::missing_field(key)).and_then(T::deserialize)
}

fn remove_optional<T: DeserializeOwned>(map: &mut JsonMap, key: &'static str) -> JsonResult<Option<T>> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => T::deserialize(v).map(Some),
    }
}

fn deserialize_event(mut map: JsonMap) -> JsonResult<NodeEvent> {
    let guild_id = remove_field(&mut map, "sessionKey")?;
    let track = remove_optional(&mut map, "track")?;
    let kind: String = remove_field(&mut map, "type")?;

    let kind = match kind.as_str() {
        "TrackStartEvent" => EventType::TrackStart,
        "TrackEndEvent" => EventType::TrackEnd {
            reason: remove_field(&mut map, "reason")?,
        },
        "TrackExceptionEvent" => {
            let exception = match remove_optional(&mut map, "exception")? {
                Some(exception) => exception,
                // Older nodes only send the message.
                None => TrackException {
                    message: remove_optional(&mut map, "error")?,
                    ..Default::default()
                },
            };

            EventType::TrackException {
                exception,
            }
        },
        "TrackStuckEvent" => EventType::TrackStuck {
            threshold_ms: remove_field(&mut map, "thresholdMs")?,
        },
        "WebSocketClosedEvent" => EventType::WebSocketClosed {
            code: remove_field(&mut map, "code")?,
            reason: remove_optional::<String>(&mut map, "reason")?.unwrap_or_default(),
            by_remote: remove_optional::<bool>(&mut map, "byRemote")?.unwrap_or(false),
        },
        _ => EventType::Unknown(kind),
    };

    Ok(NodeEvent {
        guild_id,
        track,
        kind,
    })
}

impl IncomingMessage {
    fn from_map(mut map: JsonMap) -> JsonResult<Self> {
        let op: String = remove_field(&mut map, "op")?;

        Ok(match op.as_str() {
            "stateUpdate" => IncomingMessage::StateUpdate(StateUpdate {
                guild_id: remove_field(&mut map, "sessionKey")?,
                state: remove_field(&mut map, "state")?,
            }),
            "stats" => IncomingMessage::Stats(RemoteStats::deserialize(Value::Object(map))?),
            "event" => IncomingMessage::Event(deserialize_event(map)?),
            _ => IncomingMessage::Unknown(op),
        })
    }
}

impl<'de> Deserialize<'de> for IncomingMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> StdResult<Self, D::Error> {
        let map = JsonMap::deserialize(deserializer)?;

        Self::from_map(map).map_err(DeError::custom)
    }
}

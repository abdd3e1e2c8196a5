//! Mappings of objects exchanged with nodes and the voice gateway.

pub mod event;
pub mod id;
pub mod stats;
pub mod track;
pub mod voice;

pub use self::event::{
    EventType,
    IncomingMessage,
    NodeEvent,
    PlayerStateUpdate,
    StateUpdate,
    TrackEndReason,
    TrackException,
};
pub use self::id::{ChannelId, GuildId, UserId};
pub use self::stats::{CpuStats, FrameStats, MemoryStats, RemoteStats};
pub use self::track::Track;
pub use self::voice::{VoiceCredentials, VoiceServerUpdate};

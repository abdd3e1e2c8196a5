//! Load statistics periodically reported by a node.

/// A node-wide statistics snapshot, as sent in a `stats` frame.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct RemoteStats {
    /// Players currently held by the node.
    pub players: u32,
    /// Players currently producing audio.
    pub playing_players: u32,
    /// Node uptime in milliseconds.
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    /// Absent when the node has not been sending audio for a full minute yet.
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

impl RemoteStats {
    /// Average frames per minute that arrived late, if the node reported them.
    #[must_use]
    pub fn avg_frames_deficit_per_minute(&self) -> Option<i64> {
        self.frame_stats.as_ref().map(|f| f.deficit)
    }

    /// Average frames per minute that could not be produced at all, if the node reported them.
    #[must_use]
    pub fn avg_frames_nulled_per_minute(&self) -> Option<i64> {
        self.frame_stats.as_ref().map(|f| f.nulled)
    }

    /// Fraction of the host CPU in use, in `0.0..=1.0`.
    #[must_use]
    pub fn system_load(&self) -> f64 {
        self.cpu.system_load
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[non_exhaustive]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[non_exhaustive]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

#[cfg(test)]
pub(crate) fn stats_for_test(system_load: f64, frames: Option<(i64, i64)>) -> RemoteStats {
    RemoteStats {
        players: 0,
        playing_players: 0,
        uptime: 0,
        memory: MemoryStats::default(),
        cpu: CpuStats {
            cores: 4,
            system_load,
            lavalink_load: system_load / 2.0,
        },
        frame_stats: frames.map(|(deficit, nulled)| FrameStats {
            sent: 3000,
            nulled,
            deficit,
        }),
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables of a playback [`Engine`](crate::Engine).
///
/// All fields have sensible defaults; deserialize a partial config and the
/// missing fields fill themselves in.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of decoder worker threads. Clips are assigned to the
    /// least-loaded worker once all of them are running.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How long a decoded frame may sit unpainted before its clip is paused.
    #[serde(default = "default_pause_grace_ms")]
    pub pause_grace_ms: u64,
    /// Path sources at or below this size are read fully into memory when
    /// the decoder opens.
    #[serde(default = "default_in_memory_limit")]
    pub in_memory_limit: u64,
    /// Assumed pixel footprint of a clip before its first frame is decoded,
    /// used for load balancing.
    #[serde(default = "default_average_clip_bytes")]
    pub average_clip_bytes: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            pause_grace_ms: default_pause_grace_ms(),
            in_memory_limit: default_in_memory_limit(),
            average_clip_bytes: default_average_clip_bytes(),
        }
    }
}

fn default_workers() -> usize {
    8
}

fn default_pause_grace_ms() -> u64 {
    200
}

fn default_in_memory_limit() -> u64 {
    10 * 1024 * 1024
}

fn default_average_clip_bytes() -> i64 {
    320 * 240
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.workers, 8);
        assert_eq!(config.pause_grace_ms, 200);
        assert_eq!(config.in_memory_limit, 10 * 1024 * 1024);
        assert_eq!(config.average_clip_bytes, 320 * 240);
    }
}

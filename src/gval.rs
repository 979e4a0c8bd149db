use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chord_util::{ChordError, ChordResult, IdSpace};

// 160 would be the width of a sha1 digest. 32 keeps debug output readable.
pub const DEFAULT_ID_SPACE_BITS: u32 = 32;
// successor list holds TOLERANCE + 1 entries
pub const DEFAULT_TOLERANCE: usize = 2;
pub const DEFAULT_STABILIZE_INTERVAL_MS: u64 = 100;
pub const DEFAULT_FIX_FINGERS_INTERVAL_MS: u64 = 50;
pub const DEFAULT_FAILURE_CHECK_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_FAILURE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Parameters shared by every node of one ring.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ChordConfig {
    pub id_space_bits: u32,
    pub tolerance: usize,
    pub stabilize_interval_ms: u64,
    pub fix_fingers_interval_ms: u64,
    pub failure_check_interval_ms: u64,
    /// a peer silent at least this long gets probed
    pub failure_timeout_ms: u64,
    /// consecutive misses before a peer is declared dead
    pub failure_threshold: u32,
    /// hop budget for a single lookup, `id_space_bits` when unset
    pub max_lookup_hops: Option<u32>,
}

impl Default for ChordConfig {
    fn default() -> Self {
        ChordConfig {
            id_space_bits: DEFAULT_ID_SPACE_BITS,
            tolerance: DEFAULT_TOLERANCE,
            stabilize_interval_ms: DEFAULT_STABILIZE_INTERVAL_MS,
            fix_fingers_interval_ms: DEFAULT_FIX_FINGERS_INTERVAL_MS,
            failure_check_interval_ms: DEFAULT_FAILURE_CHECK_INTERVAL_MS,
            failure_timeout_ms: DEFAULT_FAILURE_TIMEOUT_MS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            max_lookup_hops: None,
        }
    }
}

impl ChordConfig {
    pub fn with_bits(id_space_bits: u32) -> ChordConfig {
        ChordConfig {
            id_space_bits,
            ..ChordConfig::default()
        }
    }

    pub fn from_json_str(json: &str) -> ChordResult<ChordConfig> {
        let config: ChordConfig = serde_json::from_str(json)
            .map_err(|err| ChordError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> ChordResult<ChordConfig> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|err| {
            ChordError::InvalidConfig(format!("cannot read {}: {}", path.display(), err))
        })?;
        ChordConfig::from_json_str(&json)
    }

    pub fn validate(&self) -> ChordResult<()> {
        IdSpace::new(self.id_space_bits)?;
        if self.failure_threshold == 0 {
            return Err(ChordError::InvalidConfig(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.max_lookup_hops == Some(0) {
            return Err(ChordError::InvalidConfig(
                "max_lookup_hops must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn id_space(&self) -> ChordResult<IdSpace> {
        IdSpace::new(self.id_space_bits)
    }

    /// r: how many successors each node tracks.
    pub fn successor_list_len(&self) -> usize {
        self.tolerance + 1
    }

    /// Copies of a key kept besides the owner's.
    pub fn replica_count(&self) -> usize {
        self.tolerance
    }

    pub fn hop_budget(&self) -> u32 {
        self.max_lookup_hops.unwrap_or(self.id_space_bits)
    }

    pub fn stabilize_interval(&self) -> Duration {
        Duration::from_millis(self.stabilize_interval_ms)
    }

    pub fn fix_fingers_interval(&self) -> Duration {
        Duration::from_millis(self.fix_fingers_interval_ms)
    }

    pub fn failure_check_interval(&self) -> Duration {
        Duration::from_millis(self.failure_check_interval_ms)
    }

    pub fn failure_timeout(&self) -> Duration {
        Duration::from_millis(self.failure_timeout_ms)
    }
}

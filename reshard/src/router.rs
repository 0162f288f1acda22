use reshard_store::{ShardId, Source};
use std::{collections::HashMap, fmt, str::FromStr};

use crate::{
    config::ConfigError,
    error::{ReshardError, Result},
};

/// What to do with rows whose partition key is null or empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullKeyPolicy {
    #[default]
    Skip,
    Force(ShardId),
}

impl FromStr for NullKeyPolicy {
    type Err = ConfigError;

    /// Accepts `skip`, `force4`, `force-to-shard` (shard 4) and `force-to-shard-N`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let policy = s.trim().to_ascii_lowercase();

        let shard = match policy.as_str() {
            "skip" => return Ok(NullKeyPolicy::Skip),
            "force-to-shard" => Some("4"),
            _ => policy
                .strip_prefix("force-to-shard-")
                .or_else(|| policy.strip_prefix("force")),
        };

        shard
            .and_then(|shard| shard.parse::<ShardId>().ok())
            .map(NullKeyPolicy::Force)
            .ok_or_else(|| ConfigError::InvalidNullKeyPolicy(s.to_owned()))
    }
}

impl fmt::Display for NullKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NullKeyPolicy::Skip => f.write_str("skip"),
            NullKeyPolicy::Force(shard) => write!(f, "force-to-shard-{shard}"),
        }
    }
}

/// How a partition key was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Found in the shard map.
    Mapped(ShardId),
    /// Not in the shard map, placed by checksum.
    Fallback(ShardId),
    /// Null or empty key sent to the forced shard.
    Forced(ShardId),
    /// Null or empty key, skipped.
    Unroutable,
}

impl Route {
    pub fn shard(&self) -> Option<ShardId> {
        match self {
            Route::Mapped(shard) | Route::Fallback(shard) | Route::Forced(shard) => Some(*shard),
            Route::Unroutable => None,
        }
    }
}

/// Places keys missing from the shard map: `crc32(key) mod shard_count + 1`.
pub fn fallback_shard(key: &str, shard_count: ShardId) -> ShardId {
    let slot = crc32fast::hash(key.as_bytes()) % u32::from(shard_count.max(1));

    // slot < shard_count <= u8::MAX
    slot as ShardId + 1
}

/// Resolves partition keys to shards from an in-memory snapshot of the shard map.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    assignments: HashMap<String, ShardId>,
    shard_count: ShardId,
    null_key: NullKeyPolicy,
}

impl ShardRouter {
    pub fn new(
        assignments: HashMap<String, ShardId>,
        shard_count: ShardId,
        null_key: NullKeyPolicy,
    ) -> Result<Self> {
        if let Some((key, shard)) = assignments
            .iter()
            .find(|(_, shard)| !(1..=shard_count).contains(*shard))
        {
            return Err(ReshardError::AssignmentOutOfRange {
                key: key.to_owned(),
                shard: *shard,
                shard_count,
            });
        }

        if let NullKeyPolicy::Force(shard) = null_key {
            if !(1..=shard_count).contains(&shard) {
                return Err(ConfigError::ShardOutOfRange {
                    shard,
                    shard_count,
                }
                .into());
            }
        }

        Ok(Self {
            assignments,
            shard_count,
            null_key,
        })
    }

    /// Loads the whole shard map from the source.
    pub async fn load(
        source: &dyn Source,
        shard_count: ShardId,
        null_key: NullKeyPolicy,
    ) -> Result<Self> {
        let assignments = source.load_shard_map().await?;

        tracing::info!(entries = assignments.len(), shard_count, null_key = %null_key, "shard map loaded");

        Self::new(assignments, shard_count, null_key)
    }

    pub fn route(&self, key: Option<&str>) -> Route {
        let key = key.map(str::trim).unwrap_or_default();

        if key.is_empty() {
            return match self.null_key {
                NullKeyPolicy::Skip => Route::Unroutable,
                NullKeyPolicy::Force(shard) => Route::Forced(shard),
            };
        }

        match self.assignments.get(key) {
            Some(shard) => Route::Mapped(*shard),
            None => Route::Fallback(fallback_shard(key, self.shard_count)),
        }
    }

    pub fn resolve(&self, key: Option<&str>) -> Option<ShardId> {
        self.route(key).shard()
    }

    pub fn shard_count(&self) -> ShardId {
        self.shard_count
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

use reshard_store::{ShardId, StoreError};

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ReshardError {
    #[error("config `{0}`")]
    Config(#[from] ConfigError),

    #[error("store `{0}`")]
    Store(#[from] StoreError),

    #[error("shard map assigns `{key}` to shard {shard}, outside 1..={shard_count}")]
    AssignmentOutOfRange {
        key: String,
        shard: ShardId,
        shard_count: ShardId,
    },

    #[error("no connection configured for shard {0}")]
    MissingShard(ShardId),

    #[error("{0} table migration(s) failed")]
    TablesFailed(usize),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ReshardError>;

/// Failure to restore foreign key checks on a shard after a run. Reported next to the
/// run outcome, never in place of it.
#[derive(Debug, thiserror::Error)]
#[error("restoring foreign key checks on shard {shard} failed: {source}")]
pub struct CleanupWarning {
    pub shard: ShardId,
    #[source]
    pub source: StoreError,
}

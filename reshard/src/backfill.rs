use reshard_store::{validate_identifier, ShardId, Source, UuidBackfill, UuidFill};
use std::fmt;
use tracing::info;

use crate::{error::Result, migrate::ShardSet};

/// Tables carrying a nullable `uuid` column.
pub const DEFAULT_UUID_TABLES: [&str; 2] = ["local_store_cleaned", "institution_code"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Source,
    Shard(ShardId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Source => f.write_str("source"),
            Target::Shard(shard) => write!(f, "shard{shard}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub target: Target,
    pub table: String,
    pub fill: UuidFill,
}

/// Gives every row of `tables` without a uuid a fresh v4 uuid, on the source first and
/// then on each shard. Each store commits on its own.
pub async fn backfill_uuids(
    source: &dyn Source,
    shards: &ShardSet,
    tables: &[String],
) -> Result<Vec<BackfillReport>> {
    for table in tables {
        validate_identifier(table)?;
    }

    let mut reports = Vec::new();

    for table in tables {
        let fill = source.fill_missing_uuids(table).await?;
        reports.push(record(Target::Source, table, fill));

        for (shard, connection) in shards {
            let fill = connection.fill_missing_uuids(table).await?;
            reports.push(record(Target::Shard(*shard), table, fill));
        }
    }

    Ok(reports)
}

fn record(target: Target, table: &str, fill: UuidFill) -> BackfillReport {
    info!(store = %target, table, missing = fill.missing, updated = fill.updated, "uuids filled");

    BackfillReport {
        target,
        table: table.to_owned(),
        fill,
    }
}

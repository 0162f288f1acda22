use async_trait::async_trait;
use dyn_clone::DynClone;
use std::collections::HashMap;

use crate::{
    error::Result,
    row::{KeyCount, Rows, ShardId, Table, UuidFill},
};

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "mysql")]
mod mysql;

#[cfg(feature = "memory")]
pub use memory::*;
#[cfg(feature = "mysql")]
pub use mysql::*;

/// Stores carrying a nullable binary `uuid` column on some of their tables.
#[async_trait]
pub trait UuidBackfill: Send + Sync {
    /// Gives every row of `table` whose uuid is null a fresh v4 uuid and commits.
    async fn fill_missing_uuids(&self, table: &str) -> Result<UuidFill>;
}

/// The monolithic store rows are migrated out of. It also owns the `shard_map` table.
#[async_trait]
pub trait Source: UuidBackfill + DynClone {
    /// Up to `first` rows of `table` with a primary key strictly greater than `after`,
    /// ascending by primary key.
    async fn read(&self, table: Table, after: i64, first: u32) -> Result<Rows>;

    /// Row counts grouped by `column` of `table`, null and empty keys excluded.
    async fn key_counts(&self, table: &str, column: &str) -> Result<Vec<KeyCount>>;

    async fn ensure_shard_map(&self) -> Result<()>;

    async fn load_shard_map(&self) -> Result<HashMap<String, ShardId>>;

    /// Inserts or replaces the shard of every given key.
    async fn upsert_shard_map(&self, assignments: &[(String, ShardId)]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

dyn_clone::clone_trait_object!(Source);

/// One target shard, reached through a single dedicated connection.
#[async_trait]
pub trait Shard: UuidBackfill + DynClone {
    async fn set_foreign_key_checks(&self, enabled: bool) -> Result<()>;

    /// Inserts the rows, or updates them when their primary key already exists, then
    /// commits. Repeating the call with the same rows leaves the shard unchanged.
    async fn upsert(&self, rows: &Rows) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

dyn_clone::clone_trait_object!(Shard);

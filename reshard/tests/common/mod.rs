#![allow(dead_code)]

use reshard::{MigrateOptions, Migrator, NullKeyPolicy, ShardRouter};
use reshard_store::{
    Checkpoint, CleanedRow, CoordinateRow, MemoryEngine, ShardId, Source, StoreRow, Table,
};
use std::collections::{BTreeMap, HashMap};

pub fn cleaned(id: i64, code: Option<&str>, lon: Option<f64>, lat: Option<f64>) -> CleanedRow {
    CleanedRow {
        id,
        institution_code: code.map(str::to_owned),
        store_name: Some(format!("store-{id}")),
        region: Some("Seoul Mapo-gu".to_owned()),
        main_product: Some("coffee".to_owned()),
        longitude: lon,
        latitude: lat,
        ..Default::default()
    }
}

pub fn located(id: i64, code: &str) -> CleanedRow {
    cleaned(id, Some(code), Some(126.9), Some(37.55))
}

pub fn coordinate(id: i64, cleaned_id: i64, lon: f64, lat: f64) -> CoordinateRow {
    CoordinateRow {
        id,
        cleaned_id,
        lon: Some(lon),
        lat: Some(lat),
        institution_code: None,
    }
}

pub fn store(id: i64, code: Option<&str>) -> StoreRow {
    StoreRow {
        id,
        affiliate_name: Some(format!("affiliate-{id}")),
        sector_name: Some("food".to_owned()),
        instt_code: code.map(str::to_owned),
        instt_name: code.map(|code| format!("institution {code}")),
        ..Default::default()
    }
}

pub fn options(batch_size: u32, tables: &[Table]) -> MigrateOptions {
    MigrateOptions {
        batch_size,
        tables: tables.to_vec(),
        ..Default::default()
    }
}

pub fn router(
    assignments: &[(&str, ShardId)],
    shard_count: ShardId,
    null_key: NullKeyPolicy,
) -> ShardRouter {
    let assignments: HashMap<String, ShardId> = assignments
        .iter()
        .map(|(key, shard)| (key.to_string(), *shard))
        .collect();

    ShardRouter::new(assignments, shard_count, null_key).unwrap()
}

/// Rows held by one shard.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub cleaned: Vec<CleanedRow>,
    pub coordinates: Vec<CoordinateRow>,
    pub stores: Vec<StoreRow>,
}

/// A memory source and its memory shards.
pub struct Cluster {
    pub source: MemoryEngine,
    pub shards: BTreeMap<ShardId, MemoryEngine>,
}

impl Cluster {
    pub fn new(shard_count: ShardId) -> Self {
        Self {
            source: MemoryEngine::new(),
            shards: (1..=shard_count)
                .map(|shard| (shard, MemoryEngine::new()))
                .collect(),
        }
    }

    pub fn shard(&self, shard: ShardId) -> &MemoryEngine {
        &self.shards[&shard]
    }

    pub fn migrator<C: Checkpoint + 'static>(
        &self,
        router: ShardRouter,
        checkpoint: C,
        options: MigrateOptions,
    ) -> Migrator {
        self.shards.iter().fold(
            Migrator::new(self.source.clone(), router, checkpoint, options),
            |migrator, (shard, engine)| migrator.shard(*shard, engine.clone()),
        )
    }

    pub async fn router(&self, shard_count: ShardId, null_key: NullKeyPolicy) -> ShardRouter {
        ShardRouter::load(&self.source, shard_count, null_key)
            .await
            .unwrap()
    }

    pub fn snapshot(&self) -> BTreeMap<ShardId, Snapshot> {
        self.shards
            .iter()
            .map(|(shard, engine)| {
                (
                    *shard,
                    Snapshot {
                        cleaned: engine.cleaned(),
                        coordinates: engine.coordinates(),
                        stores: engine.stores(),
                    },
                )
            })
            .collect()
    }

    /// Shards holding each store row id.
    pub fn store_locations(&self) -> BTreeMap<i64, Vec<ShardId>> {
        let mut locations: BTreeMap<i64, Vec<ShardId>> = BTreeMap::new();

        for (shard, engine) in &self.shards {
            for row in engine.stores() {
                locations.entry(row.id).or_default().push(*shard);
            }
        }

        locations
    }

    pub fn foreign_key_checks(&self) -> Vec<bool> {
        self.shards
            .values()
            .map(|engine| engine.foreign_key_checks())
            .collect()
    }

    pub async fn seed_shard_map(&self, assignments: &[(&str, ShardId)]) {
        let assignments: Vec<(String, ShardId)> = assignments
            .iter()
            .map(|(key, shard)| (key.to_string(), *shard))
            .collect();

        self.source.upsert_shard_map(&assignments).await.unwrap();
    }
}

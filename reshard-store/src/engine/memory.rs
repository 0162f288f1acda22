use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use uuid::Uuid;

use crate::{
    engine::{Shard, Source, UuidBackfill},
    error::{Result, StoreError},
    row::{
        validate_identifier, CleanedRow, CoordinateRow, KeyCount, Record, Rows, ShardId,
        StoreRow, Table, UuidFill,
    },
};

#[derive(Debug)]
struct Database {
    cleaned: BTreeMap<i64, CleanedRow>,
    coordinates: BTreeMap<i64, CoordinateRow>,
    stores: BTreeMap<i64, StoreRow>,
    shard_map: BTreeMap<String, ShardId>,
    uuids: HashMap<String, BTreeMap<i64, Option<Uuid>>>,
    foreign_key_checks: bool,
    remaining_upserts: Option<usize>,
    closed: bool,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            cleaned: BTreeMap::new(),
            coordinates: BTreeMap::new(),
            stores: BTreeMap::new(),
            shard_map: BTreeMap::new(),
            uuids: HashMap::new(),
            foreign_key_checks: true,
            remaining_upserts: None,
            closed: false,
        }
    }
}

/// In-memory database usable both as the source and as a shard.
///
/// Clones share the same data. Coordinate rows referencing a missing cleaned row are
/// rejected while foreign key checks are on, like the MySQL schema does.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine(Arc<RwLock<Database>>);

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds rows, bypassing foreign key checks and failure injection.
    pub fn insert(&self, rows: impl Into<Rows>) {
        let mut db = self.0.write();
        db.apply(rows.into());
    }

    pub fn cleaned(&self) -> Vec<CleanedRow> {
        self.0.read().cleaned.values().cloned().collect()
    }

    /// Coordinate rows as stored, without the joined institution code.
    pub fn coordinates(&self) -> Vec<CoordinateRow> {
        self.0.read().coordinates.values().cloned().collect()
    }

    pub fn stores(&self) -> Vec<StoreRow> {
        self.0.read().stores.values().cloned().collect()
    }

    pub fn shard_map(&self) -> BTreeMap<String, ShardId> {
        self.0.read().shard_map.clone()
    }

    pub fn foreign_key_checks(&self) -> bool {
        self.0.read().foreign_key_checks
    }

    pub fn is_closed(&self) -> bool {
        self.0.read().closed
    }

    /// Registers ids of a table holding a nullable uuid column.
    pub fn insert_uuid_rows(&self, table: &str, ids: impl IntoIterator<Item = i64>) {
        let mut db = self.0.write();
        let uuids = db.uuids.entry(table.to_owned()).or_default();

        for id in ids {
            uuids.entry(id).or_insert(None);
        }
    }

    pub fn uuid_of(&self, table: &str, id: i64) -> Option<Uuid> {
        self.0
            .read()
            .uuids
            .get(table)
            .and_then(|uuids| uuids.get(&id).copied().flatten())
    }

    /// Lets `count` more upserts succeed, then fails every following one.
    pub fn fail_upserts_after(&self, count: usize) {
        self.0.write().remaining_upserts = Some(count);
    }

    pub fn heal(&self) {
        self.0.write().remaining_upserts = None;
    }
}

impl Database {
    fn apply(&mut self, rows: Rows) {
        match rows {
            Rows::Cleaned(rows) => {
                let uuids = self.uuids.entry(Table::Cleaned.name().to_owned()).or_default();

                for row in rows {
                    uuids.entry(row.id).or_insert(None);
                    self.cleaned.insert(row.id, row);
                }
            }
            Rows::Coordinate(rows) => {
                for row in rows {
                    self.coordinates.insert(
                        row.id,
                        CoordinateRow {
                            institution_code: None,
                            ..row
                        },
                    );
                }
            }
            Rows::Store(rows) => {
                for row in rows {
                    self.stores.insert(row.id, row);
                }
            }
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::Closed);
        }

        Ok(())
    }

    fn check_foreign_keys(&self, rows: &Rows) -> Result<()> {
        let Rows::Coordinate(rows) = rows else {
            return Ok(());
        };

        if !self.foreign_key_checks {
            return Ok(());
        }

        match rows
            .iter()
            .find(|row| !self.cleaned.contains_key(&row.cleaned_id))
        {
            Some(row) => Err(StoreError::ForeignKey(format!(
                "local_store_coordinate.cleaned_id={} has no parent",
                row.cleaned_id
            ))),
            None => Ok(()),
        }
    }

    fn take_upsert(&mut self) -> Result<()> {
        match self.remaining_upserts {
            Some(0) => Err(anyhow!("injected upsert failure").into()),
            Some(remaining) => {
                self.remaining_upserts = Some(remaining - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

fn page<R: Record>(rows: &BTreeMap<i64, R>, after: i64, first: u32) -> Vec<R> {
    rows.range(after.saturating_add(1)..)
        .take(first as usize)
        .map(|(_, row)| row.clone())
        .collect()
}

#[async_trait]
impl UuidBackfill for MemoryEngine {
    async fn fill_missing_uuids(&self, table: &str) -> Result<UuidFill> {
        validate_identifier(table)?;

        let mut db = self.0.write();
        db.check_open()?;

        let Some(uuids) = db.uuids.get_mut(table) else {
            return Ok(UuidFill::default());
        };

        let mut fill = UuidFill::default();

        for uuid in uuids.values_mut().filter(|uuid| uuid.is_none()) {
            fill.missing += 1;
            *uuid = Some(Uuid::new_v4());
            fill.updated += 1;
        }

        Ok(fill)
    }
}

#[async_trait]
impl Source for MemoryEngine {
    async fn read(&self, table: Table, after: i64, first: u32) -> Result<Rows> {
        let db = self.0.read();
        db.check_open()?;

        let rows: Rows = match table {
            Table::Cleaned => page(&db.cleaned, after, first).into(),
            Table::Store => page(&db.stores, after, first).into(),
            Table::Coordinate => db
                .coordinates
                .range(after.saturating_add(1)..)
                .filter_map(|(_, row)| {
                    db.cleaned.get(&row.cleaned_id).map(|parent| CoordinateRow {
                        institution_code: parent.institution_code.clone(),
                        ..row.clone()
                    })
                })
                .take(first as usize)
                .collect::<Vec<_>>()
                .into(),
        };

        Ok(rows)
    }

    async fn key_counts(&self, table: &str, column: &str) -> Result<Vec<KeyCount>> {
        validate_identifier(table)?;
        validate_identifier(column)?;

        let db = self.0.read();
        db.check_open()?;

        let keys: Vec<Option<&str>> = match (table, column) {
            ("local_store_cleaned", "institution_code") => {
                db.cleaned.values().map(Record::partition_key).collect()
            }
            ("local_store", "instt_code") => {
                db.stores.values().map(Record::partition_key).collect()
            }
            _ => return Err(StoreError::UnknownTable(format!("{table}.{column}"))),
        };

        let mut counts: BTreeMap<&str, i64> = BTreeMap::new();

        for key in keys.into_iter().flatten().filter(|key| !key.is_empty()) {
            *counts.entry(key).or_default() += 1;
        }

        Ok(counts
            .into_iter()
            .map(|(key, count)| KeyCount {
                key: key.to_owned(),
                count,
            })
            .collect())
    }

    async fn ensure_shard_map(&self) -> Result<()> {
        self.0.read().check_open()
    }

    async fn load_shard_map(&self) -> Result<HashMap<String, ShardId>> {
        let db = self.0.read();
        db.check_open()?;

        Ok(db
            .shard_map
            .iter()
            .map(|(key, shard)| (key.to_owned(), *shard))
            .collect())
    }

    async fn upsert_shard_map(&self, assignments: &[(String, ShardId)]) -> Result<()> {
        let mut db = self.0.write();
        db.check_open()?;

        for (key, shard) in assignments {
            db.shard_map.insert(key.to_owned(), *shard);
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.0.write().closed = true;

        Ok(())
    }
}

#[async_trait]
impl Shard for MemoryEngine {
    async fn set_foreign_key_checks(&self, enabled: bool) -> Result<()> {
        let mut db = self.0.write();
        db.check_open()?;
        db.foreign_key_checks = enabled;

        Ok(())
    }

    async fn upsert(&self, rows: &Rows) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut db = self.0.write();
        db.check_open()?;
        db.check_foreign_keys(rows)?;
        db.take_upsert()?;
        db.apply(rows.clone());

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.0.write().closed = true;

        Ok(())
    }
}

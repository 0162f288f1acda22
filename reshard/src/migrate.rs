use futures_util::future::try_join_all;
use reshard_store::{
    Checkpoint, CleanedRow, CoordinateRow, Record, Rows, Shard, ShardId, Source, StoreRow, Table,
};
use std::{
    collections::BTreeMap,
    future::{pending, Future},
    pin::{pin, Pin},
    time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::DEFAULT_BATCH_SIZE,
    coordinate::sanitize,
    error::{CleanupWarning, ReshardError, Result},
    router::ShardRouter,
};

/// Target shards by id.
pub type ShardSet = BTreeMap<ShardId, Box<dyn Shard>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateOptions {
    pub batch_size: u32,
    pub batch_interval: Duration,
    pub tables: Vec<Table>,
    /// Flush the buckets of a batch concurrently.
    pub parallel_flush: bool,
    /// Keep running the next tables after a table failed.
    pub continue_on_error: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval: Duration::ZERO,
            tables: Table::ALL.to_vec(),
            parallel_flush: false,
            continue_on_error: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub table: Table,
    pub batches: u64,
    pub read: u64,
    pub written: u64,
    pub skipped_unroutable: u64,
    pub skipped_invalid: u64,
    /// Rows whose swapped coordinates were put back in order.
    pub repaired: u64,
    /// Checkpoint when the table stopped.
    pub last_id: i64,
    pub interrupted: bool,
}

impl TableReport {
    fn new(table: Table, last_id: i64) -> Self {
        Self {
            table,
            batches: 0,
            read: 0,
            written: 0,
            skipped_unroutable: 0,
            skipped_invalid: 0,
            repaired: 0,
            last_id,
            interrupted: false,
        }
    }

    fn absorb(&mut self, batch: &Batch) {
        self.batches += 1;
        self.read += batch.read;
        self.written += batch.written;
        self.skipped_unroutable += batch.skipped_unroutable;
        self.skipped_invalid += batch.skipped_invalid;
        self.repaired += batch.repaired;
        self.last_id = batch.last_id;
    }

    pub fn skipped(&self) -> u64 {
        self.skipped_unroutable + self.skipped_invalid
    }
}

#[derive(Debug)]
pub struct MigrationReport {
    /// Tables that ran to completion or were interrupted, in run order.
    pub tables: Vec<TableReport>,
    pub interrupted: bool,
    pub warnings: Vec<CleanupWarning>,
}

impl MigrationReport {
    pub fn table(&self, table: Table) -> Option<&TableReport> {
        self.tables.iter().find(|report| report.table == table)
    }
}

#[derive(Debug, Default)]
struct Batch {
    read: u64,
    written: u64,
    skipped_unroutable: u64,
    skipped_invalid: u64,
    repaired: u64,
    last_id: i64,
}

enum Prepared<R> {
    Kept(R),
    Repaired(R),
    Invalid,
}

/// Per-shape row validation run before routing.
trait Prepare: Record + Sized {
    fn prepare(self) -> Prepared<Self>;
}

impl Prepare for CleanedRow {
    /// Rows without coordinates pass as they are.
    fn prepare(self) -> Prepared<Self> {
        if self.longitude.is_none() && self.latitude.is_none() {
            return Prepared::Kept(self);
        }

        match sanitize(self.longitude, self.latitude) {
            Some(point) => {
                let row = CleanedRow {
                    longitude: Some(point.lon),
                    latitude: Some(point.lat),
                    ..self
                };

                if point.swapped {
                    Prepared::Repaired(row)
                } else {
                    Prepared::Kept(row)
                }
            }
            None => Prepared::Invalid,
        }
    }
}

impl Prepare for CoordinateRow {
    fn prepare(self) -> Prepared<Self> {
        match sanitize(self.lon, self.lat) {
            Some(point) => {
                let row = CoordinateRow {
                    lon: Some(point.lon),
                    lat: Some(point.lat),
                    ..self
                };

                if point.swapped {
                    Prepared::Repaired(row)
                } else {
                    Prepared::Kept(row)
                }
            }
            None => Prepared::Invalid,
        }
    }
}

impl Prepare for StoreRow {
    fn prepare(self) -> Prepared<Self> {
        Prepared::Kept(self)
    }
}

fn bucket<R>(rows: Vec<R>, router: &ShardRouter, batch: &mut Batch) -> BTreeMap<ShardId, Rows>
where
    R: Prepare,
    Vec<R>: Into<Rows>,
{
    let mut buckets: BTreeMap<ShardId, Vec<R>> = BTreeMap::new();

    for row in rows {
        let id = row.id();

        let row = match row.prepare() {
            Prepared::Kept(row) => row,
            Prepared::Repaired(row) => {
                debug!(table = %R::TABLE, id, "swapped coordinates repaired");
                batch.repaired += 1;
                row
            }
            Prepared::Invalid => {
                debug!(table = %R::TABLE, id, "invalid coordinates, row skipped");
                batch.skipped_invalid += 1;
                continue;
            }
        };

        let Some(shard) = router.resolve(row.partition_key()) else {
            debug!(table = %R::TABLE, id, "no partition key, row skipped");
            batch.skipped_unroutable += 1;
            continue;
        };

        buckets.entry(shard).or_default().push(row);
    }

    buckets
        .into_iter()
        .map(|(shard, rows)| (shard, rows.into()))
        .collect()
}

/// Copies the source tables into the shards, batch by batch, resuming from the saved
/// checkpoints.
#[derive(Clone)]
pub struct Migrator {
    source: Box<dyn Source>,
    shards: ShardSet,
    router: ShardRouter,
    checkpoint: Box<dyn Checkpoint>,
    options: MigrateOptions,
}

impl Migrator {
    pub fn new<S, C>(source: S, router: ShardRouter, checkpoint: C, options: MigrateOptions) -> Self
    where
        S: Source + 'static,
        C: Checkpoint + 'static,
    {
        Self {
            source: Box::new(source),
            shards: ShardSet::new(),
            router,
            checkpoint: Box::new(checkpoint),
            options,
        }
    }

    pub fn shard<S: Shard + 'static>(mut self, id: ShardId, shard: S) -> Self {
        self.shards.insert(id, Box::new(shard));
        self
    }

    pub fn shards(mut self, shards: ShardSet) -> Self {
        self.shards.extend(shards);
        self
    }

    pub fn options(&self) -> &MigrateOptions {
        &self.options
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub async fn run(&self) -> Result<MigrationReport> {
        self.run_until(pending::<()>()).await
    }

    /// Migrates every configured table with foreign key checks disabled on all shards.
    ///
    /// Stops between batches once `shutdown` resolves. Foreign key checks are restored
    /// whatever the outcome; restore failures end up in the report on success and in the
    /// logs otherwise.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<MigrationReport>
    where
        F: Future<Output = ()>,
    {
        self.check_shards()?;

        let mut shutdown = pin!(shutdown);

        let outcome = match self.disable_foreign_keys().await {
            Ok(()) => self.migrate_tables(shutdown.as_mut()).await,
            Err(e) => Err(e),
        };

        let warnings = self.restore_foreign_keys().await;

        let (tables, interrupted) = outcome?;

        info!(
            tables = tables.len(),
            written = tables.iter().map(|report| report.written).sum::<u64>(),
            interrupted,
            warnings = warnings.len(),
            "migration finished"
        );

        Ok(MigrationReport {
            tables,
            interrupted,
            warnings,
        })
    }

    /// Migrates one table until the source has no row past its checkpoint. Foreign key
    /// checks are left as they are.
    pub async fn migrate(&self, table: Table) -> Result<TableReport> {
        let mut shutdown = pin!(pending::<()>());

        self.migrate_table(table, shutdown.as_mut()).await
    }

    /// Closes the source and every shard, returning the first error.
    pub async fn close(&self) -> Result<()> {
        let mut first_error = self.source.close().await.err();

        for (shard, connection) in &self.shards {
            if let Err(e) = connection.close().await {
                warn!(shard, error = %e, "closing shard failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn check_shards(&self) -> Result<()> {
        match (1..=self.router.shard_count()).find(|shard| !self.shards.contains_key(shard)) {
            Some(shard) => Err(ReshardError::MissingShard(shard)),
            None => Ok(()),
        }
    }

    async fn disable_foreign_keys(&self) -> Result<()> {
        for (shard, connection) in &self.shards {
            connection.set_foreign_key_checks(false).await?;
            debug!(shard, "foreign key checks disabled");
        }

        Ok(())
    }

    async fn restore_foreign_keys(&self) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();

        for (shard, connection) in &self.shards {
            match connection.set_foreign_key_checks(true).await {
                Ok(()) => debug!(shard, "foreign key checks restored"),
                Err(source) => {
                    warn!(shard, error = %source, "restoring foreign key checks failed");
                    warnings.push(CleanupWarning {
                        shard: *shard,
                        source,
                    });
                }
            }
        }

        warnings
    }

    async fn migrate_tables<F>(&self, mut shutdown: Pin<&mut F>) -> Result<(Vec<TableReport>, bool)>
    where
        F: Future<Output = ()>,
    {
        let mut reports = Vec::new();
        let mut failed = 0;

        for table in &self.options.tables {
            match self.migrate_table(*table, shutdown.as_mut()).await {
                Ok(report) if report.interrupted => {
                    reports.push(report);
                    return Ok((reports, true));
                }
                Ok(report) => reports.push(report),
                Err(e) if self.options.continue_on_error => {
                    warn!(table = %table, error = %e, "continuing with the next table");
                    failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if failed > 0 {
            return Err(ReshardError::TablesFailed(failed));
        }

        Ok((reports, false))
    }

    async fn migrate_table<F>(&self, table: Table, mut shutdown: Pin<&mut F>) -> Result<TableReport>
    where
        F: Future<Output = ()>,
    {
        let start = self.checkpoint.load(table.name()).await?;
        let mut report = TableReport::new(table, start);

        info!(table = %table, checkpoint = start, "table migration started");

        loop {
            let batch = tokio::select! {
                biased;

                _ = shutdown.as_mut() => {
                    report.interrupted = true;
                    break;
                }
                batch = self.batch(table, report.last_id) => batch,
            };

            let batch = match batch {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    error!(table = %table, checkpoint = report.last_id, error = %e, "table migration failed");
                    return Err(e);
                }
            };

            report.absorb(&batch);

            info!(
                table = %table,
                batch = report.batches,
                read = batch.read,
                written = batch.written,
                skipped = batch.skipped_unroutable + batch.skipped_invalid,
                checkpoint = report.last_id,
                "batch committed"
            );

            if !self.options.batch_interval.is_zero() {
                tokio::select! {
                    biased;

                    _ = shutdown.as_mut() => {
                        report.interrupted = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.options.batch_interval) => {}
                }
            }
        }

        if report.interrupted {
            info!(table = %table, checkpoint = report.last_id, "table migration interrupted");
        } else {
            info!(
                table = %table,
                batches = report.batches,
                read = report.read,
                written = report.written,
                skipped_unroutable = report.skipped_unroutable,
                skipped_invalid = report.skipped_invalid,
                repaired = report.repaired,
                checkpoint = report.last_id,
                "table migrated"
            );
        }

        if report.skipped() > 0 {
            warn!(
                table = %table,
                skipped_unroutable = report.skipped_unroutable,
                skipped_invalid = report.skipped_invalid,
                "rows skipped"
            );
        }

        Ok(report)
    }

    /// Reads, routes and flushes one batch after `after`, then saves the checkpoint.
    /// `None` once the table is exhausted.
    async fn batch(&self, table: Table, after: i64) -> Result<Option<Batch>> {
        let rows = self
            .source
            .read(table, after, self.options.batch_size)
            .await?;

        let Some(max_id) = rows.max_id() else {
            return Ok(None);
        };

        let mut batch = Batch {
            read: rows.len() as u64,
            ..Default::default()
        };

        let buckets = match rows {
            Rows::Cleaned(rows) => bucket(rows, &self.router, &mut batch),
            Rows::Coordinate(rows) => bucket(rows, &self.router, &mut batch),
            Rows::Store(rows) => bucket(rows, &self.router, &mut batch),
        };

        batch.written = self.flush(&buckets).await?;
        batch.last_id = self.checkpoint.save(table.name(), max_id).await?;

        Ok(Some(batch))
    }

    /// Upserts every bucket on its shard. The first failure aborts the batch; buckets
    /// already committed stay committed.
    async fn flush(&self, buckets: &BTreeMap<ShardId, Rows>) -> Result<u64> {
        if self.options.parallel_flush {
            let written = try_join_all(
                buckets
                    .iter()
                    .map(|(shard, rows)| self.flush_bucket(*shard, rows)),
            )
            .await?;

            return Ok(written.into_iter().sum());
        }

        let mut written = 0;

        for (shard, rows) in buckets {
            written += self.flush_bucket(*shard, rows).await?;
        }

        Ok(written)
    }

    async fn flush_bucket(&self, shard: ShardId, rows: &Rows) -> Result<u64> {
        let connection = self
            .shards
            .get(&shard)
            .ok_or(ReshardError::MissingShard(shard))?;

        if let Err(e) = connection.upsert(rows).await {
            error!(shard, table = %rows.table(), rows = rows.len(), error = %e, "bucket upsert failed");
            return Err(e.into());
        }

        debug!(shard, table = %rows.table(), rows = rows.len(), "bucket committed");

        Ok(rows.len() as u64)
    }
}

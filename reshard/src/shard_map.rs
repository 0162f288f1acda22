use reshard_store::{KeyCount, ShardId, Source};
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap},
};
use tracing::{info, warn};

use crate::{
    config::{ConfigError, MAX_SHARDS},
    error::Result,
};

/// Entries listed in the build log.
const SAMPLE_SIZE: usize = 20;

/// A computed assignment of partition keys to shards, with the row total per shard.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShardMap {
    pub assignments: BTreeMap<String, ShardId>,
    pub totals: BTreeMap<ShardId, u64>,
}

impl ShardMap {
    pub fn shard_of(&self, key: &str) -> Option<ShardId> {
        self.assignments.get(key).copied()
    }

    /// Highest per-shard total.
    pub fn max_total(&self) -> u64 {
        self.totals.values().copied().max().unwrap_or_default()
    }

    pub fn total(&self) -> u64 {
        self.totals.values().sum()
    }

    pub fn to_entries(&self) -> Vec<(String, ShardId)> {
        self.assignments
            .iter()
            .map(|(key, shard)| (key.to_owned(), *shard))
            .collect()
    }
}

/// Trims keys, drops null and empty ones (and non-numeric ones when asked), merges keys
/// equal after trimming, and sorts by count descending then key ascending.
pub fn normalize_counts(counts: Vec<KeyCount>, numeric_only: bool) -> Vec<(String, u64)> {
    let mut merged: BTreeMap<String, u64> = BTreeMap::new();

    for KeyCount { key, count } in counts {
        let key = key.trim();

        if key.is_empty() || (numeric_only && !key.chars().all(|c| c.is_ascii_digit())) {
            continue;
        }

        *merged.entry(key.to_owned()).or_default() += u64::try_from(count).unwrap_or(0);
    }

    let mut counts: Vec<(String, u64)> = merged.into_iter().collect();
    counts.sort_by(|(a_key, a_count), (b_key, b_count)| {
        b_count.cmp(a_count).then_with(|| a_key.cmp(b_key))
    });

    counts
}

/// Greedy longest-processing-time assignment.
///
/// Pinned keys seed their shard's total first, whether or not they appear in `counts`.
/// The remaining keys, taken in the given order, each go to the shard with the lowest
/// running total, the lowest shard id winning ties.
pub fn assign_balanced(
    counts: &[(String, u64)],
    shard_count: ShardId,
    pinned: &BTreeMap<String, ShardId>,
) -> Result<ShardMap> {
    if !(1..=MAX_SHARDS).contains(&shard_count) {
        return Err(ConfigError::InvalidShardCount(shard_count).into());
    }

    let mut map = ShardMap {
        assignments: BTreeMap::new(),
        totals: (1..=shard_count).map(|shard| (shard, 0)).collect(),
    };

    let row_counts: BTreeMap<&str, u64> = counts
        .iter()
        .map(|(key, count)| (key.as_str(), *count))
        .collect();

    for (key, shard) in pinned {
        let Some(total) = map.totals.get_mut(shard) else {
            return Err(ConfigError::ShardOutOfRange {
                shard: *shard,
                shard_count,
            }
            .into());
        };

        *total += row_counts.get(key.as_str()).copied().unwrap_or_default();
        map.assignments.insert(key.to_owned(), *shard);
    }

    let mut heap: BinaryHeap<Reverse<(u64, ShardId)>> = map
        .totals
        .iter()
        .map(|(shard, total)| Reverse((*total, *shard)))
        .collect();

    for (key, count) in counts {
        if pinned.contains_key(key) {
            continue;
        }

        let Some(Reverse((total, shard))) = heap.pop() else {
            break;
        };

        let total = total + count;
        map.assignments.insert(key.to_owned(), shard);
        map.totals.insert(shard, total);
        heap.push(Reverse((total, shard)));
    }

    Ok(map)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub shard_count: ShardId,
    pub pinned: BTreeMap<String, ShardId>,
    pub numeric_only: bool,
    /// Table and column the rows are counted on.
    pub source_table: String,
    pub source_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub map: ShardMap,
    pub distinct_keys: usize,
    pub total_rows: u64,
    /// `false` on a dry run.
    pub persisted: bool,
}

/// Computes the shard map from the source's row counts and stores it in `shard_map`.
#[derive(Clone)]
pub struct ShardMapBuilder {
    source: Box<dyn Source>,
    options: BuildOptions,
}

impl ShardMapBuilder {
    pub fn new<S: Source + 'static>(source: S, options: BuildOptions) -> Self {
        Self {
            source: Box::new(source),
            options,
        }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Computes the assignment without writing it.
    pub async fn compute(&self) -> Result<ShardMap> {
        let counts = self
            .source
            .key_counts(&self.options.source_table, &self.options.source_key)
            .await?;

        let counts = normalize_counts(counts, self.options.numeric_only);

        assign_balanced(&counts, self.options.shard_count, &self.options.pinned)
    }

    pub async fn build(&self) -> Result<BuildReport> {
        self.run(false).await
    }

    pub async fn dry_run(&self) -> Result<BuildReport> {
        self.run(true).await
    }

    async fn run(&self, dry_run: bool) -> Result<BuildReport> {
        let map = self.compute().await?;

        let report = BuildReport {
            distinct_keys: map.assignments.len(),
            total_rows: map.total(),
            persisted: !dry_run,
            map,
        };

        if report.distinct_keys == 0 {
            warn!(
                table = %self.options.source_table,
                column = %self.options.source_key,
                "no partition key found, shard map is empty"
            );
        }

        if !dry_run {
            self.source.ensure_shard_map().await?;
            self.source
                .upsert_shard_map(&report.map.to_entries())
                .await?;
        }

        self.log(&report);

        Ok(report)
    }

    fn log(&self, report: &BuildReport) {
        info!(
            distinct_keys = report.distinct_keys,
            total_rows = report.total_rows,
            shard_count = self.options.shard_count,
            persisted = report.persisted,
            "shard map built"
        );

        for (shard, total) in &report.map.totals {
            let percent = if report.total_rows == 0 {
                0.0
            } else {
                *total as f64 * 100.0 / report.total_rows as f64
            };

            info!(shard, rows = total, percent = %format!("{percent:.2}"), "shard total");
        }

        for (key, shard) in &self.options.pinned {
            info!(key = %key, shard, "pinned");
        }

        for (key, shard) in report.map.assignments.iter().take(SAMPLE_SIZE) {
            info!(key = %key, shard, "assignment");
        }
    }
}

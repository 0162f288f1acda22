//! reshard binary: builds the shard map, migrates the source into the shards and
//! backfills uuids.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reshard::{
    backfill_uuids, parse_tables, MigrationReport, Migrator, ReshardConfig, Route, ShardMapBuilder,
    ShardRouter, ShardSet, DEFAULT_UUID_TABLES,
};
use reshard_store::{FileCheckpoint, MySqlShard, MySqlSource, Shard, Source};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Balanced sharding and resumable migration of the store dataset
#[derive(Parser, Debug)]
#[command(name = "reshard")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the balanced shard map and persist it in `shard_map`
    BuildMap {
        /// Compute and log the assignment without writing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Copy the source tables into their shards, resuming from the checkpoints
    Migrate {
        /// Rows per batch
        #[arg(long)]
        batch_size: Option<u32>,

        /// Tables to run, e.g. `cleaned,store`
        #[arg(long)]
        tables: Option<String>,
    },
    /// Print the shard each institution code resolves to
    Route {
        #[arg(required = true)]
        codes: Vec<String>,
    },
    /// Fill missing uuids on the source and every shard
    BackfillUuid {
        /// Tables to fill, `local_store_cleaned` and `institution_code` when omitted
        tables: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reshard=info,reshard_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = ReshardConfig::from_env_file(env_file()).context("invalid configuration")?;

    if let Command::Migrate { batch_size, tables } = &args.command {
        if let Some(batch_size) = batch_size {
            config.batch_size = *batch_size;
        }

        if let Some(tables) = tables {
            config.tables = parse_tables(tables)?;
        }

        config.validate().context("invalid configuration")?;
    }

    let source = MySqlSource::connect(config.source.connect_options())
        .await
        .with_context(|| format!("connecting to source {}", config.source))?;

    tracing::info!(source = %config.source, shard_count = config.shard_count, "connected");

    let result = match args.command {
        Command::BuildMap { dry_run } => build_map(&config, source.clone(), dry_run).await,
        Command::Migrate { .. } => migrate(&config, source.clone()).await,
        Command::Route { codes } => route(&config, &source, &codes).await,
        Command::BackfillUuid { tables } => backfill(&config, &source, tables).await,
    };

    if let Err(e) = source.close().await {
        tracing::warn!(error = %e, "closing source failed");
    }

    result
}

async fn connect_shards(config: &ReshardConfig) -> Result<ShardSet> {
    let mut shards = ShardSet::new();

    for (shard, connection) in &config.shards {
        let conn = MySqlShard::connect(&connection.connect_options())
            .await
            .with_context(|| format!("connecting to shard {shard} at {connection}"))?;

        shards.insert(*shard, Box::new(conn));
    }

    Ok(shards)
}

async fn build_map(config: &ReshardConfig, source: MySqlSource, dry_run: bool) -> Result<()> {
    let builder = ShardMapBuilder::new(source, config.build_options());

    let report = if dry_run {
        builder.dry_run().await?
    } else {
        builder.build().await?
    };

    println!(
        "{} keys, {} rows{}",
        report.distinct_keys,
        report.total_rows,
        if report.persisted { "" } else { " (dry run)" }
    );

    for (shard, total) in &report.map.totals {
        println!("shard {shard}: {total} rows");
    }

    Ok(())
}

async fn migrate(config: &ReshardConfig, source: MySqlSource) -> Result<()> {
    let router = ShardRouter::load(&source, config.shard_count, config.null_key).await?;
    let checkpoint = FileCheckpoint::open(&config.checkpoint_dir).await?;
    let shards = connect_shards(config).await?;

    let migrator =
        Migrator::new(source, router, checkpoint, config.migrate_options()).shards(shards);

    let result = migrator.run_until(shutdown_signal()).await;

    if let Err(e) = migrator.close().await {
        tracing::warn!(error = %e, "closing connections failed");
    }

    let report: MigrationReport = result?;

    for table in &report.tables {
        println!(
            "{}: read {}, written {}, skipped {}, repaired {}, checkpoint {}{}",
            table.table,
            table.read,
            table.written,
            table.skipped(),
            table.repaired,
            table.last_id,
            if table.interrupted { " (interrupted)" } else { "" }
        );
    }

    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }

    Ok(())
}

async fn route(config: &ReshardConfig, source: &MySqlSource, codes: &[String]) -> Result<()> {
    let router = ShardRouter::load(source, config.shard_count, config.null_key).await?;

    for code in codes {
        match router.route(Some(code)) {
            Route::Mapped(shard) => println!("{code}\tshard {shard}\tmapped"),
            Route::Fallback(shard) => println!("{code}\tshard {shard}\tcrc32 fallback"),
            Route::Forced(shard) => println!("{code}\tshard {shard}\tnull key policy"),
            Route::Unroutable => println!("{code}\t-\tunroutable"),
        }
    }

    Ok(())
}

async fn backfill(config: &ReshardConfig, source: &MySqlSource, tables: Vec<String>) -> Result<()> {
    let tables = if tables.is_empty() {
        DEFAULT_UUID_TABLES.iter().map(|table| table.to_string()).collect()
    } else {
        tables
    };

    let shards = connect_shards(config).await?;
    let reports = backfill_uuids(source, &shards, &tables).await;

    for (shard, connection) in &shards {
        if let Err(e) = connection.close().await {
            tracing::warn!(shard, error = %e, "closing shard failed");
        }
    }

    for report in reports? {
        println!(
            "{}\t{}\tnull {}\tupdated {}",
            report.target, report.table, report.fill.missing, report.fill.updated
        );
    }

    Ok(())
}

/// Resolves on Ctrl-C. Never resolves when the handler cannot be installed.
/// Nearest `.env` walking up from the working directory.
fn env_file() -> PathBuf {
    std::env::current_dir()
        .ok()
        .and_then(|dir| {
            dir.ancestors()
                .map(|dir| dir.join(".env"))
                .find(|path| path.is_file())
        })
        .unwrap_or_else(|| PathBuf::from(".env"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }

    tracing::info!("interrupted, stopping the migration");
}

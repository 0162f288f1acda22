use async_trait::async_trait;
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlPoolOptions},
    Connection, MySql, MySqlConnection, MySqlPool, QueryBuilder,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    engine::{Shard, Source, UuidBackfill},
    error::{Result, StoreError},
    row::{
        validate_identifier, CleanedRow, CoordinateRow, KeyCount, Rows, ShardId, StoreRow, Table,
        UuidFill,
    },
};

/// Rows per INSERT statement; keeps every statement well under the placeholder limit.
const CHUNK_ROWS: usize = 500;

const SRID: i32 = 4326;

#[derive(Debug, Clone)]
pub struct MySqlSource {
    pool: MySqlPool,
}

impl MySqlSource {
    pub fn new(pool: &MySqlPool) -> Self {
        Self { pool: pool.clone() }
    }

    pub async fn connect(options: MySqlConnectOptions) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl UuidBackfill for MySqlSource {
    async fn fill_missing_uuids(&self, table: &str) -> Result<UuidFill> {
        let mut conn = self.pool.acquire().await?;

        fill_missing_uuids(&mut conn, table).await
    }
}

#[async_trait]
impl Source for MySqlSource {
    async fn read(&self, table: Table, after: i64, first: u32) -> Result<Rows> {
        let rows: Rows = match table {
            Table::Cleaned => sqlx::query_as::<_, CleanedRow>(
                r#"
                SELECT id, institution_code, store_name, region, address,
                       main_product, tel_number, created_at, latitude, longitude
                FROM local_store_cleaned
                WHERE id > ?
                ORDER BY id
                LIMIT ?
                "#,
            )
            .bind(after)
            .bind(first)
            .fetch_all(&self.pool)
            .await?
            .into(),
            Table::Coordinate => sqlx::query_as::<_, CoordinateRow>(
                r#"
                SELECT c.id, c.cleaned_id,
                       ST_X(c.location) AS lon,
                       ST_Y(c.location) AS lat,
                       cl.institution_code
                FROM local_store_coordinate c
                JOIN local_store_cleaned cl ON cl.id = c.cleaned_id
                WHERE c.id > ?
                ORDER BY c.id
                LIMIT ?
                "#,
            )
            .bind(after)
            .bind(first)
            .fetch_all(&self.pool)
            .await?
            .into(),
            Table::Store => sqlx::query_as::<_, StoreRow>(
                r#"
                SELECT id, affiliate_name, local_bill, ctpv_name, sgg_name,
                       road_addr, lotno_addr, sector_name, main_prd, telno,
                       instt_code, instt_name, crtr_ymd
                FROM local_store
                WHERE id > ?
                ORDER BY id
                LIMIT ?
                "#,
            )
            .bind(after)
            .bind(first)
            .fetch_all(&self.pool)
            .await?
            .into(),
        };

        Ok(rows)
    }

    async fn key_counts(&self, table: &str, column: &str) -> Result<Vec<KeyCount>> {
        validate_identifier(table)?;
        validate_identifier(column)?;

        let counts = sqlx::query_as::<_, KeyCount>(
            format!(
                r#"
                SELECT CAST({column} AS CHAR) AS `key`, COUNT(*) AS `count`
                FROM {table}
                WHERE {column} IS NOT NULL AND {column} <> ''
                GROUP BY {column}
                "#
            )
            .as_str(),
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(counts)
    }

    async fn ensure_shard_map(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS shard_map (
              institution_code VARCHAR(50) PRIMARY KEY,
              shard_id TINYINT NOT NULL,
              updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
              CHECK (shard_id BETWEEN 1 AND 16)
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_shard_map(&self) -> Result<HashMap<String, ShardId>> {
        let rows = sqlx::query_as::<_, (String, i8)>(
            "SELECT institution_code, shard_id FROM shard_map",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut map = HashMap::with_capacity(rows.len());

        for (key, shard) in rows {
            map.insert(key, ShardId::try_from(shard)?);
        }

        Ok(map)
    }

    async fn upsert_shard_map(&self, assignments: &[(String, ShardId)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for chunk in assignments.chunks(CHUNK_ROWS) {
            let mut query_builder: QueryBuilder<MySql> =
                QueryBuilder::new("INSERT INTO shard_map (institution_code, shard_id) ");

            query_builder.push_values(chunk, |mut b, (key, shard)| {
                b.push_bind(key.to_owned()).push_bind(i16::from(*shard));
            });

            query_builder.push(" ON DUPLICATE KEY UPDATE shard_id = VALUES(shard_id)");
            query_builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;

        Ok(())
    }
}

/// A shard behind one dedicated connection, so session settings such as
/// `FOREIGN_KEY_CHECKS` apply to every write made through it.
#[derive(Clone)]
pub struct MySqlShard {
    conn: Arc<Mutex<Option<MySqlConnection>>>,
}

impl MySqlShard {
    pub async fn connect(options: &MySqlConnectOptions) -> Result<Self> {
        let conn = MySqlConnection::connect_with(options).await?;

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }
}

#[async_trait]
impl UuidBackfill for MySqlShard {
    async fn fill_missing_uuids(&self, table: &str) -> Result<UuidFill> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;

        fill_missing_uuids(conn, table).await
    }
}

#[async_trait]
impl Shard for MySqlShard {
    async fn set_foreign_key_checks(&self, enabled: bool) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;

        let sql = if enabled {
            "SET FOREIGN_KEY_CHECKS=1"
        } else {
            "SET FOREIGN_KEY_CHECKS=0"
        };

        sqlx::query(sql).execute(&mut *conn).await?;

        Ok(())
    }

    async fn upsert(&self, rows: &Rows) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        let mut tx = conn.begin().await?;

        match rows {
            Rows::Cleaned(rows) => {
                for chunk in rows.chunks(CHUNK_ROWS) {
                    upsert_cleaned(chunk).build().execute(&mut *tx).await?;
                }
            }
            Rows::Coordinate(rows) => {
                for chunk in rows.chunks(CHUNK_ROWS) {
                    upsert_coordinates(chunk).build().execute(&mut *tx).await?;
                }
            }
            Rows::Store(rows) => {
                for chunk in rows.chunks(CHUNK_ROWS) {
                    upsert_stores(chunk).build().execute(&mut *tx).await?;
                }
            }
        }

        tx.commit().await?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close().await?;
        }

        Ok(())
    }
}

fn upsert_cleaned(rows: &[CleanedRow]) -> QueryBuilder<'static, MySql> {
    let mut query_builder: QueryBuilder<MySql> = QueryBuilder::new(
        r#"INSERT INTO local_store_cleaned
          (id, institution_code, store_name, region, address, main_product, tel_number,
           created_at, latitude, longitude, location) "#,
    );

    query_builder.push_values(rows, |mut b, row| {
        b.push_bind(row.id)
            .push_bind(row.institution_code.clone())
            .push_bind(row.store_name.clone())
            .push_bind(row.region.clone())
            .push_bind(row.address.clone())
            .push_bind(row.main_product.clone())
            .push_bind(row.tel_number.clone())
            .push_bind(row.created_at)
            .push_bind(row.latitude)
            .push_bind(row.longitude);

        b.push("ST_SRID(POINT(")
            .push_bind_unseparated(row.longitude)
            .push_unseparated(", ")
            .push_bind_unseparated(row.latitude)
            .push_unseparated(format!("), {SRID})"));
    });

    query_builder.push(
        r#" ON DUPLICATE KEY UPDATE
          institution_code = VALUES(institution_code),
          store_name = VALUES(store_name),
          region = VALUES(region),
          address = VALUES(address),
          main_product = VALUES(main_product),
          tel_number = VALUES(tel_number),
          created_at = VALUES(created_at),
          latitude = VALUES(latitude),
          longitude = VALUES(longitude),
          location = VALUES(location)"#,
    );

    query_builder
}

fn upsert_coordinates(rows: &[CoordinateRow]) -> QueryBuilder<'static, MySql> {
    let mut query_builder: QueryBuilder<MySql> =
        QueryBuilder::new("INSERT INTO local_store_coordinate (id, cleaned_id, location) ");

    query_builder.push_values(rows, |mut b, row| {
        b.push_bind(row.id).push_bind(row.cleaned_id);

        b.push("ST_SRID(POINT(")
            .push_bind_unseparated(row.lon)
            .push_unseparated(", ")
            .push_bind_unseparated(row.lat)
            .push_unseparated(format!("), {SRID})"));
    });

    query_builder.push(
        r#" ON DUPLICATE KEY UPDATE
          cleaned_id = VALUES(cleaned_id),
          location = VALUES(location)"#,
    );

    query_builder
}

fn upsert_stores(rows: &[StoreRow]) -> QueryBuilder<'static, MySql> {
    let mut query_builder: QueryBuilder<MySql> = QueryBuilder::new(
        r#"INSERT INTO local_store
          (id, affiliate_name, local_bill, ctpv_name, sgg_name, road_addr, lotno_addr,
           sector_name, main_prd, telno, instt_code, instt_name, crtr_ymd) "#,
    );

    query_builder.push_values(rows, |mut b, row| {
        b.push_bind(row.id)
            .push_bind(row.affiliate_name.clone())
            .push_bind(row.local_bill.clone())
            .push_bind(row.ctpv_name.clone())
            .push_bind(row.sgg_name.clone())
            .push_bind(row.road_addr.clone())
            .push_bind(row.lotno_addr.clone())
            .push_bind(row.sector_name.clone())
            .push_bind(row.main_prd.clone())
            .push_bind(row.telno.clone())
            .push_bind(row.instt_code.clone())
            .push_bind(row.instt_name.clone())
            .push_bind(row.crtr_ymd);
    });

    query_builder.push(
        r#" ON DUPLICATE KEY UPDATE
          affiliate_name = VALUES(affiliate_name),
          local_bill = VALUES(local_bill),
          ctpv_name = VALUES(ctpv_name),
          sgg_name = VALUES(sgg_name),
          road_addr = VALUES(road_addr),
          lotno_addr = VALUES(lotno_addr),
          sector_name = VALUES(sector_name),
          main_prd = VALUES(main_prd),
          telno = VALUES(telno),
          instt_code = VALUES(instt_code),
          instt_name = VALUES(instt_name),
          crtr_ymd = VALUES(crtr_ymd)"#,
    );

    query_builder
}

async fn fill_missing_uuids(conn: &mut MySqlConnection, table: &str) -> Result<UuidFill> {
    validate_identifier(table)?;

    let ids = sqlx::query_scalar::<_, i64>(
        format!("SELECT id FROM {table} WHERE uuid IS NULL").as_str(),
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut fill = UuidFill {
        missing: u64::try_from(ids.len())?,
        updated: 0,
    };

    if ids.is_empty() {
        return Ok(fill);
    }

    let update = format!("UPDATE {table} SET uuid = ? WHERE id = ?");
    let mut tx = conn.begin().await?;

    for id in ids {
        let result = sqlx::query(update.as_str())
            .bind(Uuid::new_v4().as_bytes().to_vec())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        fill.updated += result.rows_affected();
    }

    tx.commit().await?;

    Ok(fill)
}

use chrono::NaiveDate;
use std::{fmt, str::FromStr};

use crate::error::{Result, StoreError};

/// Shard identifier, `1..=shard_count`.
pub type ShardId = u8;

/// Logical tables moved from the source into the shards.
///
/// Ordering follows the run order: cleaned rows first so coordinate rows find their
/// parents, raw store rows last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Cleaned,
    Coordinate,
    Store,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Cleaned, Table::Coordinate, Table::Store];

    /// Physical table name, shared by the source and every shard.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Cleaned => "local_store_cleaned",
            Table::Coordinate => "local_store_coordinate",
            Table::Store => "local_store",
        }
    }

    pub fn alias(&self) -> &'static str {
        match self {
            Table::Cleaned => "cleaned",
            Table::Coordinate => "coordinate",
            Table::Store => "store",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Table {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        Table::ALL
            .into_iter()
            .find(|table| table.alias() == s || table.name() == s)
            .ok_or_else(|| StoreError::UnknownTable(s.to_owned()))
    }
}

/// Checks that `name` can be spliced into SQL as a bare identifier.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();

    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_owned()))
    }
}

/// A row that can be routed: it has an ordered primary key and an optional partition key.
pub trait Record: Clone + Send + Sync {
    const TABLE: Table;

    fn id(&self) -> i64;

    fn partition_key(&self) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "mysql", derive(sqlx::FromRow))]
pub struct CleanedRow {
    pub id: i64,
    pub institution_code: Option<String>,
    pub store_name: Option<String>,
    pub region: Option<String>,
    pub address: Option<String>,
    pub main_product: Option<String>,
    pub tel_number: Option<String>,
    pub created_at: Option<NaiveDate>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Record for CleanedRow {
    const TABLE: Table = Table::Cleaned;

    fn id(&self) -> i64 {
        self.id
    }

    fn partition_key(&self) -> Option<&str> {
        self.institution_code.as_deref()
    }
}

/// A coordinate row as read from the source: the point split into `lon`/`lat` and the
/// parent cleaned row's institution code joined in.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "mysql", derive(sqlx::FromRow))]
pub struct CoordinateRow {
    pub id: i64,
    pub cleaned_id: i64,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
    pub institution_code: Option<String>,
}

impl Record for CoordinateRow {
    const TABLE: Table = Table::Coordinate;

    fn id(&self) -> i64 {
        self.id
    }

    fn partition_key(&self) -> Option<&str> {
        self.institution_code.as_deref()
    }
}

/// Raw store row, copied verbatim.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "mysql", derive(sqlx::FromRow))]
pub struct StoreRow {
    pub id: i64,
    pub affiliate_name: Option<String>,
    pub local_bill: Option<String>,
    pub ctpv_name: Option<String>,
    pub sgg_name: Option<String>,
    pub road_addr: Option<String>,
    pub lotno_addr: Option<String>,
    pub sector_name: Option<String>,
    pub main_prd: Option<String>,
    pub telno: Option<String>,
    pub instt_code: Option<String>,
    pub instt_name: Option<String>,
    pub crtr_ymd: Option<NaiveDate>,
}

impl Record for StoreRow {
    const TABLE: Table = Table::Store;

    fn id(&self) -> i64 {
        self.id
    }

    fn partition_key(&self) -> Option<&str> {
        self.instt_code.as_deref()
    }
}

/// A batch of rows of a single table.
#[derive(Debug, Clone, PartialEq)]
pub enum Rows {
    Cleaned(Vec<CleanedRow>),
    Coordinate(Vec<CoordinateRow>),
    Store(Vec<StoreRow>),
}

impl Rows {
    pub fn empty(table: Table) -> Self {
        match table {
            Table::Cleaned => Rows::Cleaned(Vec::new()),
            Table::Coordinate => Rows::Coordinate(Vec::new()),
            Table::Store => Rows::Store(Vec::new()),
        }
    }

    pub fn table(&self) -> Table {
        match self {
            Rows::Cleaned(_) => Table::Cleaned,
            Rows::Coordinate(_) => Table::Coordinate,
            Rows::Store(_) => Table::Store,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Rows::Cleaned(rows) => rows.len(),
            Rows::Coordinate(rows) => rows.len(),
            Rows::Store(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest primary key in the batch, `None` when empty.
    pub fn max_id(&self) -> Option<i64> {
        match self {
            Rows::Cleaned(rows) => rows.iter().map(Record::id).max(),
            Rows::Coordinate(rows) => rows.iter().map(Record::id).max(),
            Rows::Store(rows) => rows.iter().map(Record::id).max(),
        }
    }

    pub fn ids(&self) -> Vec<i64> {
        match self {
            Rows::Cleaned(rows) => rows.iter().map(Record::id).collect(),
            Rows::Coordinate(rows) => rows.iter().map(Record::id).collect(),
            Rows::Store(rows) => rows.iter().map(Record::id).collect(),
        }
    }
}

impl From<Vec<CleanedRow>> for Rows {
    fn from(rows: Vec<CleanedRow>) -> Self {
        Rows::Cleaned(rows)
    }
}

impl From<Vec<CoordinateRow>> for Rows {
    fn from(rows: Vec<CoordinateRow>) -> Self {
        Rows::Coordinate(rows)
    }
}

impl From<Vec<StoreRow>> for Rows {
    fn from(rows: Vec<StoreRow>) -> Self {
        Rows::Store(rows)
    }
}

/// Row count of one partition key in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "mysql", derive(sqlx::FromRow))]
pub struct KeyCount {
    pub key: String,
    pub count: i64,
}

/// Outcome of filling missing uuids in one table of one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UuidFill {
    pub missing: u64,
    pub updated: u64,
}

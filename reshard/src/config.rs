//! Run configuration, read once from the environment at startup.
//!
//! Every component receives the values it needs from [`ReshardConfig`]; nothing reads
//! the environment after startup.

use reshard_store::{validate_identifier, ShardId, Table};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{migrate::MigrateOptions, router::NullKeyPolicy, shard_map::BuildOptions};

/// Upper bound enforced by the `shard_map.shard_id` check constraint.
pub const MAX_SHARDS: ShardId = 16;

pub const DEFAULT_SHARD_COUNT: ShardId = 4;

pub const DEFAULT_BATCH_SIZE: u32 = 10_000;

pub const DEFAULT_CHECKPOINT_DIR: &str = "./.shard_ckpt";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("shard count {0} outside 1..=16")]
    InvalidShardCount(ShardId),

    #[error("batch size must be positive")]
    InvalidBatchSize,

    #[error("`{var}` is not a valid value: `{value}`")]
    InvalidValue { var: String, value: String },

    #[error("unknown table `{0}`, expected cleaned, coordinate or store")]
    UnknownTable(String),

    #[error("no table selected")]
    NoTables,

    #[error("invalid pinned entry `{0}`, expected code:shard")]
    InvalidPin(String),

    #[error("shard {shard} outside 1..={shard_count}")]
    ShardOutOfRange { shard: ShardId, shard_count: ShardId },

    #[error("invalid null key policy `{0}`, expected skip, force4 or force-to-shard-N")]
    InvalidNullKeyPolicy(String),

    #[error("invalid sql identifier `{0}`")]
    InvalidIdentifier(String),

    #[error("missing connection settings for shard {0}")]
    MissingShard(ShardId),

    #[error("reading env file: {0}")]
    EnvFile(String),
}

/// MySQL connection settings of one database.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ConnectionConfig {
    pub fn source_default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 3307,
            user: "root".to_owned(),
            password: String::new(),
            database: "sparta".to_owned(),
        }
    }

    /// Shard `n` listens on `3307 + n` and holds `sparta_shard{n}` by default.
    pub fn shard_default(shard: ShardId) -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 3307 + u16::from(shard),
            user: "root".to_owned(),
            password: String::new(),
            database: format!("sparta_shard{shard}"),
        }
    }

    #[cfg(feature = "mysql")]
    pub fn connect_options(&self) -> sqlx::mysql::MySqlConnectOptions {
        sqlx::mysql::MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .charset("utf8mb4")
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .finish()
    }
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReshardConfig {
    pub source: ConnectionConfig,
    pub shards: BTreeMap<ShardId, ConnectionConfig>,
    pub shard_count: ShardId,
    pub batch_size: u32,
    /// Pause after every committed batch.
    pub batch_interval: Duration,
    pub checkpoint_dir: PathBuf,
    pub null_key: NullKeyPolicy,
    /// Leave keys that are not all digits out of the shard map.
    pub numeric_only: bool,
    /// Table and column the shard map counts rows of.
    pub source_table: String,
    pub source_key: String,
    pub pinned: BTreeMap<String, ShardId>,
    /// Tables to migrate, in run order.
    pub tables: Vec<Table>,
    pub parallel_flush: bool,
    pub continue_on_error: bool,
}

impl Default for ReshardConfig {
    fn default() -> Self {
        Self {
            source: ConnectionConfig::source_default(),
            shards: (1..=DEFAULT_SHARD_COUNT)
                .map(|shard| (shard, ConnectionConfig::shard_default(shard)))
                .collect(),
            shard_count: DEFAULT_SHARD_COUNT,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval: Duration::ZERO,
            checkpoint_dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            null_key: NullKeyPolicy::Skip,
            numeric_only: true,
            source_table: Table::Cleaned.name().to_owned(),
            source_key: "institution_code".to_owned(),
            pinned: BTreeMap::new(),
            tables: Table::ALL.to_vec(),
            parallel_flush: false,
            continue_on_error: false,
        }
    }
}

impl ReshardConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ReshardConfig::from_env`], falling back to the entries of the `.env` file at
    /// `path`. Process variables win and a missing file is ignored.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_lookup_and_file(|key| std::env::var(key).ok(), path.as_ref())
    }

    fn from_lookup_and_file<F>(lookup: F, path: &Path) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file: HashMap<String, String> = match dotenvy::from_path_iter(path) {
            Ok(entries) => entries
                .collect::<Result<_, _>>()
                .map_err(|e| ConfigError::EnvFile(e.to_string()))?,
            Err(e) if e.not_found() => HashMap::new(),
            Err(e) => return Err(ConfigError::EnvFile(e.to_string())),
        };

        Self::from_lookup(|key| lookup(key).or_else(|| file.get(key).cloned()))
    }

    /// Builds and validates the configuration from a variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let user = env.get(&["DB_USER"]).unwrap_or(defaults.source.user);
        let password = env.get(&["DB_PASSWORD"]).unwrap_or_default();

        let source = ConnectionConfig {
            host: env.get(&["DB_HOST"]).unwrap_or(defaults.source.host),
            port: env.parse(&["DB_PORT"], defaults.source.port)?,
            user: user.to_owned(),
            password: password.to_owned(),
            database: env.get(&["DB_NAME"]).unwrap_or(defaults.source.database),
        };

        let shard_count = env.parse(&["SHARD_COUNT"], DEFAULT_SHARD_COUNT)?;

        if !(1..=MAX_SHARDS).contains(&shard_count) {
            return Err(ConfigError::InvalidShardCount(shard_count));
        }

        let mut shards = BTreeMap::new();

        for shard in 1..=shard_count {
            let fallback = ConnectionConfig::shard_default(shard);
            let var = |name: &str, alias: &str| [format!("SHARD{shard}_DB_{name}"), format!("S{shard}_{alias}")];

            let [host, host_alias] = var("HOST", "HOST");
            let [port, port_alias] = var("PORT", "PORT");
            let [shard_user, user_alias] = var("USER", "USER");
            let [shard_password, password_alias] = var("PASSWORD", "PASSWORD");
            let [name, name_alias] = var("NAME", "DB");

            shards.insert(
                shard,
                ConnectionConfig {
                    host: env.get(&[host.as_str(), host_alias.as_str()]).unwrap_or(fallback.host),
                    port: env.parse(&[port.as_str(), port_alias.as_str()], fallback.port)?,
                    user: env
                        .get(&[shard_user.as_str(), user_alias.as_str()])
                        .unwrap_or_else(|| user.to_owned()),
                    password: env
                        .get(&[shard_password.as_str(), password_alias.as_str()])
                        .unwrap_or_else(|| password.to_owned()),
                    database: env.get(&[name.as_str(), name_alias.as_str()]).unwrap_or(fallback.database),
                },
            );
        }

        let batch_interval = match env.get(&["SLEEP_SEC"]) {
            Some(value) => match value.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs >= 0.0 => Duration::from_secs_f64(secs),
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "SLEEP_SEC".to_owned(),
                        value,
                    })
                }
            },
            None => defaults.batch_interval,
        };

        let config = Self {
            source,
            shards,
            shard_count,
            batch_size: env.parse(&["SHARD_BATCH_SIZE", "BATCH_SIZE"], defaults.batch_size)?,
            batch_interval,
            checkpoint_dir: env
                .get(&["CHECKPOINT_DIR"])
                .map(PathBuf::from)
                .unwrap_or(defaults.checkpoint_dir),
            null_key: match env.get(&["NULL_CODE_POLICY"]) {
                Some(value) => value.parse()?,
                None => defaults.null_key,
            },
            numeric_only: env.flag(&["SHARD_NUMERIC_ONLY"], defaults.numeric_only)?,
            source_table: env
                .get(&["SHARD_SOURCE_TABLE"])
                .unwrap_or(defaults.source_table),
            source_key: env.get(&["SHARD_SOURCE_KEY"]).unwrap_or(defaults.source_key),
            pinned: match env.get(&["SHARD_PINNED"]) {
                Some(value) => parse_pinned(&value)?,
                None => defaults.pinned,
            },
            tables: match env.get(&["RUN_TABLES"]) {
                Some(value) => parse_tables(&value)?,
                None => defaults.tables,
            },
            parallel_flush: env.flag(&["SHARD_PARALLEL_FLUSH"], defaults.parallel_flush)?,
            continue_on_error: env.flag(&["SHARD_CONTINUE_ON_ERROR"], defaults.continue_on_error)?,
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_SHARDS).contains(&self.shard_count) {
            return Err(ConfigError::InvalidShardCount(self.shard_count));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }

        if self.tables.is_empty() {
            return Err(ConfigError::NoTables);
        }

        if let Some(shard) = (1..=self.shard_count).find(|shard| !self.shards.contains_key(shard)) {
            return Err(ConfigError::MissingShard(shard));
        }

        let shard_count = self.shard_count;
        let check_shard = |shard: ShardId| {
            if (1..=shard_count).contains(&shard) {
                Ok(())
            } else {
                Err(ConfigError::ShardOutOfRange { shard, shard_count })
            }
        };

        for shard in self.pinned.values() {
            check_shard(*shard)?;
        }

        if let NullKeyPolicy::Force(shard) = self.null_key {
            check_shard(shard)?;
        }

        for identifier in [&self.source_table, &self.source_key] {
            validate_identifier(identifier)
                .map_err(|_| ConfigError::InvalidIdentifier(identifier.to_owned()))?;
        }

        Ok(())
    }

    pub fn migrate_options(&self) -> MigrateOptions {
        MigrateOptions {
            batch_size: self.batch_size,
            batch_interval: self.batch_interval,
            tables: self.tables.clone(),
            parallel_flush: self.parallel_flush,
            continue_on_error: self.continue_on_error,
        }
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            shard_count: self.shard_count,
            pinned: self.pinned.clone(),
            numeric_only: self.numeric_only,
            source_table: self.source_table.to_owned(),
            source_key: self.source_key.to_owned(),
        }
    }
}

/// Parses `code:shard,code:shard`.
pub fn parse_pinned(value: &str) -> Result<BTreeMap<String, ShardId>, ConfigError> {
    let mut pinned = BTreeMap::new();

    for entry in value.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let parsed = entry.split_once(':').and_then(|(code, shard)| {
            let code = code.trim();
            let shard = shard.trim().parse::<ShardId>().ok()?;

            (!code.is_empty()).then(|| (code.to_owned(), shard))
        });

        let Some((code, shard)) = parsed else {
            return Err(ConfigError::InvalidPin(entry.to_owned()));
        };

        pinned.insert(code, shard);
    }

    Ok(pinned)
}

/// Parses a comma separated table list into run order, duplicates removed.
pub fn parse_tables(value: &str) -> Result<Vec<Table>, ConfigError> {
    let mut tables = value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            Table::from_str(name).map_err(|_| ConfigError::UnknownTable(name.to_owned()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    tables.sort();
    tables.dedup();

    Ok(tables)
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// First non-empty value among `keys`.
    fn get(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|key| (self.0)(key))
            .find(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, keys: &[&str], default: T) -> Result<T, ConfigError> {
        match self.get(keys) {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: keys.first().copied().unwrap_or_default().to_owned(),
                value,
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, keys: &[&str], default: bool) -> Result<bool, ConfigError> {
        let Some(value) = self.get(keys) else {
            return Ok(default);
        };

        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                var: keys.first().copied().unwrap_or_default().to_owned(),
                value,
            }),
        }
    }
}

/// Builder for configurations assembled in code rather than read from the environment.
#[derive(Debug)]
pub struct ConfigBuilder {
    config: ReshardConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ReshardConfig::default(),
        }
    }

    /// Sets the shard count; shards without explicit settings get the defaults.
    pub fn shard_count(mut self, shard_count: ShardId) -> Self {
        self.config.shard_count = shard_count;
        self.config.shards.retain(|shard, _| *shard <= shard_count);

        for shard in 1..=shard_count {
            self.config
                .shards
                .entry(shard)
                .or_insert_with(|| ConnectionConfig::shard_default(shard));
        }

        self
    }

    pub fn source(mut self, source: ConnectionConfig) -> Self {
        self.config.source = source;
        self
    }

    pub fn shard(mut self, shard: ShardId, connection: ConnectionConfig) -> Self {
        self.config.shards.insert(shard, connection);
        self
    }

    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn batch_interval(mut self, interval: Duration) -> Self {
        self.config.batch_interval = interval;
        self
    }

    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_dir = dir.into();
        self
    }

    pub fn null_key(mut self, policy: NullKeyPolicy) -> Self {
        self.config.null_key = policy;
        self
    }

    pub fn numeric_only(mut self, numeric_only: bool) -> Self {
        self.config.numeric_only = numeric_only;
        self
    }

    pub fn pin(mut self, code: impl Into<String>, shard: ShardId) -> Self {
        self.config.pinned.insert(code.into(), shard);
        self
    }

    pub fn tables(mut self, tables: impl IntoIterator<Item = Table>) -> Self {
        let mut tables: Vec<Table> = tables.into_iter().collect();
        tables.sort();
        tables.dedup();

        self.config.tables = tables;
        self
    }

    pub fn parallel_flush(mut self, enabled: bool) -> Self {
        self.config.parallel_flush = enabled;
        self
    }

    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.config.continue_on_error = enabled;
        self
    }

    pub fn build(self) -> Result<ReshardConfig, ConfigError> {
        self.config.validate()?;

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        move |key| vars.get(key).cloned()
    }

    #[test]
    fn env_file_fills_unset_variables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "SHARD_COUNT=2\nDB_HOST=file.internal\nRUN_TABLES=store\n").unwrap();

        let config =
            ReshardConfig::from_lookup_and_file(lookup(&[("DB_HOST", "process.internal")]), &path)
                .unwrap();

        assert_eq!(config.shard_count, 2);
        assert_eq!(config.shards.len(), 2);
        assert_eq!(config.source.host, "process.internal");
        assert_eq!(config.tables, vec![Table::Store]);

        let missing =
            ReshardConfig::from_lookup_and_file(lookup(&[]), &dir.path().join("absent.env"))
                .unwrap();
        assert_eq!(missing, ReshardConfig::default());

        std::fs::write(&path, "SHARD_COUNT='2\n").unwrap();
        assert!(matches!(
            ReshardConfig::from_lookup_and_file(lookup(&[]), &path),
            Err(ConfigError::EnvFile(_))
        ));
    }

    #[test]
    fn defaults() {
        let config = ReshardConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config, ReshardConfig::default());
        assert_eq!(config.shards.len(), 4);
        assert_eq!(config.shards[&1].port, 3308);
        assert_eq!(config.shards[&4].database, "sparta_shard4");
        assert_eq!(config.tables, Table::ALL.to_vec());
        assert!(config.numeric_only);
        assert_eq!(config.null_key, NullKeyPolicy::Skip);
    }

    #[test]
    fn shard_settings_and_aliases() {
        let config = ReshardConfig::from_lookup(lookup(&[
            ("DB_USER", "app"),
            ("DB_PASSWORD", "secret"),
            ("SHARD_COUNT", "2"),
            ("SHARD1_DB_HOST", "shard1.internal"),
            ("S1_HOST", "ignored"),
            ("S2_HOST", "shard2.internal"),
            ("S2_PORT", "4406"),
            ("S2_DB", "stores_2"),
            ("SHARD2_DB_USER", "shard_user"),
        ]))
        .unwrap();

        assert_eq!(config.shards.len(), 2);

        let first = &config.shards[&1];
        assert_eq!(first.host, "shard1.internal");
        assert_eq!(first.user, "app");
        assert_eq!(first.password, "secret");

        let second = &config.shards[&2];
        assert_eq!(second.to_string(), "shard_user@shard2.internal:4406/stores_2");
        assert_eq!(second.password, "secret");
        assert!(!format!("{second:?}").contains("secret"));
    }

    #[test]
    fn run_settings() {
        let config = ReshardConfig::from_lookup(lookup(&[
            ("BATCH_SIZE", "500"),
            ("SLEEP_SEC", "0.25"),
            ("NULL_CODE_POLICY", "force4"),
            ("SHARD_NUMERIC_ONLY", "false"),
            ("SHARD_PINNED", "6260000:2, 6280000:3"),
            ("RUN_TABLES", "store,cleaned,store"),
            ("SHARD_PARALLEL_FLUSH", "yes"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 500);
        assert_eq!(config.batch_interval, Duration::from_millis(250));
        assert_eq!(config.null_key, NullKeyPolicy::Force(4));
        assert!(!config.numeric_only);
        assert_eq!(
            config.pinned,
            BTreeMap::from([("6260000".to_owned(), 2), ("6280000".to_owned(), 3)])
        );
        assert_eq!(config.tables, vec![Table::Cleaned, Table::Store]);
        assert!(config.parallel_flush);
        assert!(!config.continue_on_error);

        let preferred = ReshardConfig::from_lookup(lookup(&[
            ("SHARD_BATCH_SIZE", "100"),
            ("BATCH_SIZE", "500"),
        ]))
        .unwrap();
        assert_eq!(preferred.batch_size, 100);
    }

    #[test]
    fn invalid_settings() {
        let err = |vars: &[(&str, &str)]| ReshardConfig::from_lookup(lookup(vars)).unwrap_err();

        assert_eq!(err(&[("SHARD_COUNT", "0")]), ConfigError::InvalidShardCount(0));
        assert_eq!(err(&[("SHARD_COUNT", "17")]), ConfigError::InvalidShardCount(17));
        assert!(matches!(
            err(&[("SHARD_COUNT", "four")]),
            ConfigError::InvalidValue { var, .. } if var == "SHARD_COUNT"
        ));
        assert_eq!(err(&[("BATCH_SIZE", "0")]), ConfigError::InvalidBatchSize);
        assert!(matches!(err(&[("SLEEP_SEC", "-1")]), ConfigError::InvalidValue { .. }));
        assert_eq!(
            err(&[("RUN_TABLES", "cleaned,orders")]),
            ConfigError::UnknownTable("orders".to_owned())
        );
        assert_eq!(
            err(&[("SHARD_PINNED", "6260000")]),
            ConfigError::InvalidPin("6260000".to_owned())
        );
        assert_eq!(
            err(&[("SHARD_PINNED", "6260000:9")]),
            ConfigError::ShardOutOfRange {
                shard: 9,
                shard_count: 4
            }
        );
        assert_eq!(
            err(&[("SHARD_COUNT", "2"), ("NULL_CODE_POLICY", "force4")]),
            ConfigError::ShardOutOfRange {
                shard: 4,
                shard_count: 2
            }
        );
        assert_eq!(
            err(&[("NULL_CODE_POLICY", "drop")]),
            ConfigError::InvalidNullKeyPolicy("drop".to_owned())
        );
        assert_eq!(
            err(&[("SHARD_SOURCE_KEY", "code;")]),
            ConfigError::InvalidIdentifier("code;".to_owned())
        );
        assert!(matches!(
            err(&[("SHARD_NUMERIC_ONLY", "maybe")]),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn builder() {
        let config = ConfigBuilder::new()
            .shard_count(2)
            .batch_size(3)
            .pin("6260000", 2)
            .tables([Table::Store, Table::Cleaned])
            .build()
            .unwrap();

        assert_eq!(config.shards.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(config.tables, vec![Table::Cleaned, Table::Store]);
        assert_eq!(config.migrate_options().batch_size, 3);
        assert_eq!(config.build_options().pinned["6260000"], 2);

        assert_eq!(
            ConfigBuilder::new().tables([]).build().unwrap_err(),
            ConfigError::NoTables
        );
        assert_eq!(
            ConfigBuilder::new().pin("6260000", 5).build().unwrap_err(),
            ConfigError::ShardOutOfRange {
                shard: 5,
                shard_count: 4
            }
        );
    }
}

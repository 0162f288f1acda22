use async_trait::async_trait;
use dyn_clone::DynClone;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;

use crate::error::Result;

/// Durable per-table migration cursor: the highest primary key fully migrated.
#[async_trait]
pub trait Checkpoint: DynClone + Send + Sync {
    /// Last saved id of `table`, `0` when nothing was saved yet.
    async fn load(&self, table: &str) -> Result<i64>;

    /// Persists `last_id` unless it is lower than the stored value, and returns the value
    /// now stored. The cursor never moves backwards.
    async fn save(&self, table: &str, last_id: i64) -> Result<i64>;
}

dyn_clone::clone_trait_object!(Checkpoint);

/// One `<table>.ckpt` file per table holding the id as decimal text.
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    dir: PathBuf,
}

impl FileCheckpoint {
    /// Opens the checkpoint directory, creating it when missing.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        Ok(Self { dir })
    }

    pub fn path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.ckpt"))
    }
}

#[async_trait]
impl Checkpoint for FileCheckpoint {
    async fn load(&self, table: &str) -> Result<i64> {
        let path = self.path(table);

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let parsed = std::str::from_utf8(&content)
            .map_err(|e| e.to_string())
            .and_then(|content| content.trim().parse::<i64>().map_err(|e| e.to_string()));

        match parsed {
            Ok(last_id) => Ok(last_id),
            Err(error) => {
                warn!(table, path = %path.display(), %error, "corrupt checkpoint, starting from 0");
                Ok(0)
            }
        }
    }

    async fn save(&self, table: &str, last_id: i64) -> Result<i64> {
        let current = self.load(table).await?;

        if last_id < current {
            warn!(table, current, last_id, "refusing to move checkpoint backwards");
            return Ok(current);
        }

        let path = self.path(table);
        let temp_path = self.dir.join(format!(".{table}.ckpt.tmp"));

        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(last_id.to_string().as_bytes()).await?;
            file.sync_all().await?;
        }

        fs::rename(&temp_path, &path).await?;

        // the rename is durable once the directory entry is synced
        #[cfg(unix)]
        fs::File::open(&self.dir).await?.sync_all().await?;

        Ok(last_id)
    }
}

#[cfg(feature = "memory")]
mod memory {
    use async_trait::async_trait;
    use parking_lot::RwLock;
    use std::{collections::HashMap, sync::Arc};

    use super::Checkpoint;
    use crate::error::Result;

    #[derive(Debug, Clone, Default)]
    pub struct MemoryCheckpoint(Arc<RwLock<HashMap<String, i64>>>);

    impl MemoryCheckpoint {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Checkpoint for MemoryCheckpoint {
        async fn load(&self, table: &str) -> Result<i64> {
            Ok(self.0.read().get(table).copied().unwrap_or(0))
        }

        async fn save(&self, table: &str, last_id: i64) -> Result<i64> {
            let mut checkpoints = self.0.write();
            let stored = checkpoints.entry(table.to_owned()).or_insert(0);
            *stored = (*stored).max(last_id);

            Ok(*stored)
        }
    }
}

#[cfg(feature = "memory")]
pub use memory::MemoryCheckpoint;

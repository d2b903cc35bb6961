//! Checkpointing between supersteps
//!
//! A checkpoint captures the memory snapshot, every vertex's data and the
//! messages delivered for the next superstep, right after a barrier. The
//! topology is not stored; it never changes during a run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::BspError;
use crate::graph::VertexData;
use crate::memory::MemorySnapshot;
use crate::value::VertexId;

const EXTENSION: &str = "json.zst";

/// Messages per recipient, each message as JSON
pub type EncodedInboxes = Vec<(VertexId, Vec<serde_json::Value>)>;

/// State of a run after one superstep's barrier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub superstep: usize,
    pub memory: MemorySnapshot,
    pub vertices: Vec<VertexData>,
    /// Messages in flight to each recipient, in vertex order
    #[serde(default)]
    pub inboxes: EncodedInboxes,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Encode delivered inboxes for storage
    pub fn encode_inboxes<'a, M, I>(inboxes: I) -> Result<EncodedInboxes, BspError>
    where
        M: Serialize + 'a,
        I: IntoIterator<Item = (&'a VertexId, &'a Vec<M>)>,
    {
        let mut encoded = inboxes
            .into_iter()
            .map(|(id, messages)| {
                let messages = messages
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((*id, messages))
            })
            .collect::<Result<Vec<_>, BspError>>()?;
        encoded.sort_by_key(|(id, _)| *id);
        Ok(encoded)
    }

    /// Decode the in-flight messages as the program's message type
    pub fn messages<M: DeserializeOwned>(&self) -> Result<Vec<(VertexId, Vec<M>)>, BspError> {
        self.inboxes
            .iter()
            .map(|(id, messages)| {
                let messages = messages
                    .iter()
                    .cloned()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<M>, _>>()?;
                Ok((*id, messages))
            })
            .collect()
    }
}

/// Persistence for checkpoints
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), BspError>;

    /// The checkpoint taken after `superstep`, if one was saved
    async fn load(&self, run_id: Uuid, superstep: usize) -> Result<Option<Checkpoint>, BspError>;

    /// The checkpoint with the highest superstep for `run_id`
    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>, BspError>;

    /// Supersteps checkpointed for `run_id`, ascending
    async fn list(&self, run_id: Uuid) -> Result<Vec<usize>, BspError>;
}

/// Keeps checkpoints in process memory
#[derive(Debug, Default)]
pub struct MemoryCheckpointer {
    runs: RwLock<HashMap<Uuid, BTreeMap<usize, Checkpoint>>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), BspError> {
        self.runs
            .write()
            .await
            .entry(checkpoint.run_id)
            .or_default()
            .insert(checkpoint.superstep, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid, superstep: usize) -> Result<Option<Checkpoint>, BspError> {
        Ok(self
            .runs
            .read()
            .await
            .get(&run_id)
            .and_then(|run| run.get(&superstep).cloned()))
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>, BspError> {
        Ok(self
            .runs
            .read()
            .await
            .get(&run_id)
            .and_then(|run| run.values().next_back().cloned()))
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<usize>, BspError> {
        Ok(self
            .runs
            .read()
            .await
            .get(&run_id)
            .map(|run| run.keys().copied().collect())
            .unwrap_or_default())
    }
}

/// Writes zstd-compressed JSON files, one directory per run
#[derive(Debug, Clone)]
pub struct FileCheckpointer {
    root: PathBuf,
    level: i32,
}

impl FileCheckpointer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn file_name(superstep: usize) -> String {
        format!("superstep_{superstep:06}.{EXTENSION}")
    }

    fn parse_superstep(path: &Path) -> Option<usize> {
        path.file_name()?
            .to_str()?
            .strip_prefix("superstep_")?
            .strip_suffix(&format!(".{EXTENSION}"))?
            .parse()
            .ok()
    }
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), BspError> {
        let dir = self.run_dir(checkpoint.run_id);
        tokio::fs::create_dir_all(&dir).await?;

        let json = serde_json::to_vec(checkpoint)?;
        let compressed = zstd::encode_all(json.as_slice(), self.level)
            .map_err(|e| BspError::Checkpoint(format!("compression failed: {e}")))?;

        let path = dir.join(Self::file_name(checkpoint.superstep));
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, compressed).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn load(&self, run_id: Uuid, superstep: usize) -> Result<Option<Checkpoint>, BspError> {
        let path = self.run_dir(run_id).join(Self::file_name(superstep));
        let compressed = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let json = zstd::decode_all(compressed.as_slice()).map_err(|e| {
            BspError::Checkpoint(format!("corrupt checkpoint {}: {e}", path.display()))
        })?;
        Ok(Some(serde_json::from_slice(&json)?))
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>, BspError> {
        match self.list(run_id).await?.pop() {
            Some(superstep) => self.load(run_id, superstep).await,
            None => Ok(None),
        }
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<usize>, BspError> {
        let dir = self.run_dir(run_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut supersteps = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(superstep) = Self::parse_superstep(&entry.path()) {
                supersteps.push(superstep);
            }
        }
        supersteps.sort_unstable();
        Ok(supersteps)
    }
}

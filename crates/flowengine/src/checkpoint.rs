use crate::{FlowConfig, FlowContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const CHECKPOINT_EXTENSION: &str = "json";

/// Snapshot of a suspended run: the flow definition plus the full context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub flow_config: FlowConfig,
    pub context: FlowContext,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub config_digest: Option<String>,
}

impl Checkpoint {
    pub fn new(flow_config: FlowConfig, context: FlowContext) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            flow_config,
            context,
            created_at: Utc::now(),
            config_digest: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.config_digest = Some(digest.into());
        self
    }

    pub fn to_json(&self) -> CheckpointStoreResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|error| CheckpointStoreError::Serialization(error.to_string()))
    }

    pub fn from_json(source: &str) -> CheckpointStoreResult<Self> {
        serde_json::from_str(source)
            .map_err(|error| CheckpointStoreError::Serialization(error.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointStoreError {
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    #[error("invalid checkpoint id: {0}")]
    InvalidId(String),

    #[error("checkpoint serialization failed: {0}")]
    Serialization(String),

    #[error("checkpoint backend failure: {0}")]
    Backend(String),
}

pub type CheckpointStoreResult<T> = Result<T, CheckpointStoreError>;

#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: Checkpoint) -> CheckpointStoreResult<String>;

    async fn load(&self, checkpoint_id: &str) -> CheckpointStoreResult<Option<Checkpoint>>;

    /// Removing an unknown id is not an error.
    async fn delete(&self, checkpoint_id: &str) -> CheckpointStoreResult<()>;
}

pub type SharedCheckpointStore = Arc<dyn CheckpointStore>;

#[derive(Clone, Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<BTreeMap<String, Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|state| state.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> CheckpointStoreResult<std::sync::MutexGuard<'_, BTreeMap<String, Checkpoint>>> {
        self.inner
            .lock()
            .map_err(|_| CheckpointStoreError::Backend("checkpoint store lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> CheckpointStoreResult<String> {
        let checkpoint_id = checkpoint.checkpoint_id.clone();
        self.lock()?.insert(checkpoint_id.clone(), checkpoint);
        Ok(checkpoint_id)
    }

    async fn load(&self, checkpoint_id: &str) -> CheckpointStoreResult<Option<Checkpoint>> {
        Ok(self.lock()?.get(checkpoint_id).cloned())
    }

    async fn delete(&self, checkpoint_id: &str) -> CheckpointStoreResult<()> {
        self.lock()?.remove(checkpoint_id);
        Ok(())
    }
}

/// One JSON file per checkpoint under a root directory.
#[derive(Clone, Debug)]
pub struct FsCheckpointStore {
    root: PathBuf,
}

impl FsCheckpointStore {
    pub fn new<P: AsRef<Path>>(root: P) -> CheckpointStoreResult<Self> {
        fs::create_dir_all(root.as_ref()).map_err(|err| {
            CheckpointStoreError::Backend(format!("create checkpoint root failed: {err}"))
        })?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint_path(&self, checkpoint_id: &str) -> CheckpointStoreResult<PathBuf> {
        validate_checkpoint_id(checkpoint_id)?;
        Ok(self
            .root
            .join(checkpoint_id)
            .with_extension(CHECKPOINT_EXTENSION))
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> CheckpointStoreResult<String> {
        let path = self.checkpoint_path(&checkpoint.checkpoint_id)?;
        let raw = checkpoint.to_json()?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw).map_err(|err| {
            CheckpointStoreError::Backend(format!("write checkpoint file failed: {err}"))
        })?;
        fs::rename(&tmp, &path).map_err(|err| {
            CheckpointStoreError::Backend(format!("rename checkpoint file failed: {err}"))
        })?;
        Ok(checkpoint.checkpoint_id)
    }

    async fn load(&self, checkpoint_id: &str) -> CheckpointStoreResult<Option<Checkpoint>> {
        let path = self.checkpoint_path(checkpoint_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|err| {
            CheckpointStoreError::Backend(format!("read checkpoint file failed: {err}"))
        })?;
        Checkpoint::from_json(&raw).map(Some)
    }

    async fn delete(&self, checkpoint_id: &str) -> CheckpointStoreResult<()> {
        let path = self.checkpoint_path(checkpoint_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CheckpointStoreError::Backend(format!(
                "remove checkpoint file failed: {err}"
            ))),
        }
    }
}

fn validate_checkpoint_id(checkpoint_id: &str) -> CheckpointStoreResult<()> {
    let valid = !checkpoint_id.is_empty()
        && checkpoint_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CheckpointStoreError::InvalidId(checkpoint_id.to_string()))
    }
}

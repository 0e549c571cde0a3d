//! Parameter checkpointing
//!
//! Saves the full parameter vector (and the moving average, when one is
//! kept) as a CBOR container with a small metadata header. Checkpoints are
//! written by the training driver between synchronization rounds, never
//! from inside the sync core, so no shard lock is ever held across disk IO.

use crate::errors::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Metadata header of one checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Unique id of this checkpoint
    pub checkpoint_id: Uuid,
    /// Training step at which it was taken
    pub step: u64,
    /// Number of parameters
    pub elements: usize,
    /// Unix timestamp of creation
    pub created_at: u64,
}

/// A saved parameter state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    /// The full parameter vector
    pub params: Vec<f32>,
    /// Moving average of the parameters, when maintained
    pub moving_average: Option<Vec<f32>>,
}

impl Checkpoint {
    pub fn new(step: u64, params: Vec<f32>, moving_average: Option<Vec<f32>>) -> Self {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            metadata: CheckpointMetadata {
                checkpoint_id: Uuid::new_v4(),
                step,
                elements: params.len(),
                created_at,
            },
            params,
            moving_average,
        }
    }

    fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    fn from_cbor(data: &[u8]) -> Result<Self> {
        ciborium::from_reader(data).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

/// Writes and restores checkpoints under one directory, retaining only the
/// most recent few.
pub struct CheckpointManager {
    dir: PathBuf,
    keep_last: usize,
}

impl CheckpointManager {
    /// Create a manager rooted at `dir`, keeping the latest `keep_last`
    /// checkpoints on disk (0 keeps everything).
    pub fn new(dir: impl Into<PathBuf>, keep_last: usize) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, keep_last })
    }

    /// Checkpoint directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save a checkpoint and prune old ones
    pub fn save(
        &self,
        step: u64,
        params: &[f32],
        moving_average: Option<&[f32]>,
    ) -> Result<CheckpointMetadata> {
        let checkpoint = Checkpoint::new(
            step,
            params.to_vec(),
            moving_average.map(|avg| avg.to_vec()),
        );
        let data = checkpoint.to_cbor()?;
        let path = self.dir.join(format!("step-{step:012}.{CHECKPOINT_EXTENSION}"));
        std::fs::write(&path, &data)?;
        info!(
            step,
            checkpoint_id = %checkpoint.metadata.checkpoint_id,
            elements = checkpoint.metadata.elements,
            size_bytes = data.len(),
            "Checkpoint saved"
        );
        self.prune()?;
        Ok(checkpoint.metadata)
    }

    /// Load the checkpoint with the highest step, if any exists
    pub fn load_latest(&self) -> Result<Option<Checkpoint>> {
        let mut latest: Option<Checkpoint> = None;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == CHECKPOINT_EXTENSION) != Some(true) {
                continue;
            }
            match std::fs::read(&path).map_err(SyncError::from).and_then(|d| {
                Checkpoint::from_cbor(&d)
            }) {
                Ok(checkpoint) => {
                    if latest
                        .as_ref()
                        .map(|l| checkpoint.metadata.step >= l.metadata.step)
                        .unwrap_or(true)
                    {
                        latest = Some(checkpoint);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to load checkpoint");
                }
            }
        }
        if let Some(checkpoint) = &latest {
            debug!(
                step = checkpoint.metadata.step,
                elements = checkpoint.metadata.elements,
                "Checkpoint loaded"
            );
        }
        Ok(latest)
    }

    fn prune(&self) -> Result<()> {
        if self.keep_last == 0 {
            return Ok(());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == CHECKPOINT_EXTENSION) == Some(true))
            .collect();
        // Step-padded file names sort chronologically
        files.sort();
        while files.len() > self.keep_last {
            let victim = files.remove(0);
            debug!(path = %victim.display(), "Pruning old checkpoint");
            std::fs::remove_file(&victim)?;
        }
        Ok(())
    }
}

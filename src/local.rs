//! Intra-process synchronization against the shard store
//!
//! Workers on one node push gradients into the store and pull parameters
//! back out, one shard at a time under that shard's lock. The dense path
//! copies whole shards; the sparse path compresses per-shard slices and
//! tracks, per (worker, shard), the last version each worker has seen so a
//! fetch only carries the delta since then.
//!
//! Optionally maintains an exponential moving average of the full parameter
//! region with a warm-up schedule on the decay.

use crate::config::SyncConfig;
use crate::errors::{Result, SyncError};
use crate::shard::ShardRange;
use crate::sparse::{scatter_add, GradientDropper};
use crate::store::VersionedShardStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Exponential moving average of a parameter region.
///
/// The effective decay ramps up over the first batches,
/// `min(decay, (batches + 1) / (batches + 10))`, so early averages are not
/// dominated by the random initialization.
pub struct MovingAverage {
    values: Vec<f32>,
    decay: f32,
}

impl MovingAverage {
    pub fn new(initial: &[f32], decay: f32) -> Self {
        Self {
            values: initial.to_vec(),
            decay,
        }
    }

    /// Fold the current parameters into the average after `batches` batches
    pub fn update(&mut self, params: &[f32], batches: u64) {
        let warmup = (batches as f32 + 1.0) / (batches as f32 + 10.0);
        let decay = self.decay.min(warmup);
        for (avg, p) in self.values.iter_mut().zip(params.iter()) {
            *avg = decay * *avg + (1.0 - decay) * p;
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

/// Push/pull coordinator for the workers of one node.
///
/// All buffers handed to its methods cover the node's contiguous parameter
/// region; shard offsets are translated internally.
pub struct LocalSyncCoordinator {
    store: Arc<VersionedShardStore>,
    region: ShardRange,
    /// One dropper per shard when compression is on
    droppers: Option<Vec<GradientDropper>>,
    /// Last version each (worker, shard) pair has incorporated
    seen: Mutex<HashMap<(usize, usize), u64>>,
    average: Option<Mutex<MovingAverage>>,
}

impl LocalSyncCoordinator {
    pub fn new(
        store: Arc<VersionedShardStore>,
        config: &SyncConfig,
        initial_region: &[f32],
    ) -> Result<Self> {
        if store.num_shards() == 0 {
            return Err(SyncError::Config("store has no shards".to_string()));
        }
        let first = store.range(0);
        let last = store.range(store.num_shards() - 1);
        let region = ShardRange {
            offset: first.offset,
            size: last.end() - first.offset,
        };
        if initial_region.len() != region.size {
            return Err(SyncError::Shard(format!(
                "initial buffer of length {} does not cover region of size {}",
                initial_region.len(),
                region.size
            )));
        }

        let droppers = if config.compression_enabled() {
            Some(
                (0..store.num_shards())
                    .map(|s| GradientDropper::new(store.range(s).size, config.drop_rate))
                    .collect(),
            )
        } else {
            None
        };

        let average = if config.moving_average {
            Some(Mutex::new(MovingAverage::new(
                initial_region,
                config.moving_decay,
            )))
        } else {
            None
        };

        Ok(Self {
            store,
            region,
            droppers,
            seen: Mutex::new(HashMap::new()),
            average,
        })
    }

    /// The contiguous global range this coordinator covers
    pub fn region(&self) -> ShardRange {
        self.region
    }

    fn shard_slice<'a>(&self, buffer: &'a [f32], shard: usize) -> &'a [f32] {
        let range = self.store.range(shard);
        let start = range.offset - self.region.offset;
        &buffer[start..start + range.size]
    }

    /// Push a dense gradient covering the whole region, shard by shard.
    /// When compression is configured the per-shard slices are compressed
    /// first and applied as sparse deltas.
    pub fn push_gradients(&self, grad: &[f32], scale: f32) -> Result<()> {
        if grad.len() != self.region.size {
            return Err(SyncError::Shard(format!(
                "gradient of length {} does not cover region of size {}",
                grad.len(),
                self.region.size
            )));
        }
        for shard in 0..self.store.num_shards() {
            let slice = self.shard_slice(grad, shard);
            let version = match &self.droppers {
                Some(droppers) => {
                    let delta = droppers[shard].compress(slice, shard)?;
                    self.store.apply_sparse_update(shard, &delta, 0, scale)?
                }
                None => self.store.apply_update(shard, slice, scale)?,
            };
            trace!(shard, version, "pushed gradient");
        }
        Ok(())
    }

    /// Copy the latest parameters of every shard into `params`
    pub fn fetch_params(&self, params: &mut [f32]) -> Result<()> {
        if params.len() != self.region.size {
            return Err(SyncError::Shard(format!(
                "buffer of length {} does not cover region of size {}",
                params.len(),
                self.region.size
            )));
        }
        for shard in 0..self.store.num_shards() {
            let range = self.store.range(shard);
            let (snapshot, _) = self.store.latest(shard)?;
            let start = range.offset - self.region.offset;
            params[start..start + range.size].copy_from_slice(&snapshot);
        }
        Ok(())
    }

    /// Dense fetch on behalf of `worker`: copy the latest parameters and
    /// record the served versions in the worker's staleness table, so a
    /// later sparse fetch only carries changes made after this point.
    pub fn fetch_params_for(&self, worker: usize, params: &mut [f32]) -> Result<()> {
        if params.len() != self.region.size {
            return Err(SyncError::Shard(format!(
                "buffer of length {} does not cover region of size {}",
                params.len(),
                self.region.size
            )));
        }
        for shard in 0..self.store.num_shards() {
            let range = self.store.range(shard);
            let (snapshot, version) = self.store.latest(shard)?;
            let start = range.offset - self.region.offset;
            params[start..start + range.size].copy_from_slice(&snapshot);
            self.seen.lock().unwrap().insert((worker, shard), version);
        }
        Ok(())
    }

    /// Refresh `params` for `worker` via compressed deltas: for each shard,
    /// take the parameter change since the version this worker last saw,
    /// compress it, and scatter-add it onto the worker's copy. Updates the
    /// worker's staleness record to the version served.
    pub fn sparse_fetch_params(&self, worker: usize, params: &mut [f32]) -> Result<()> {
        let droppers = self.droppers.as_ref().ok_or_else(|| {
            SyncError::Config("sparse fetch requires a configured drop rate".to_string())
        })?;
        if params.len() != self.region.size {
            return Err(SyncError::Shard(format!(
                "buffer of length {} does not cover region of size {}",
                params.len(),
                self.region.size
            )));
        }
        let mut updated = 0usize;
        for shard in 0..self.store.num_shards() {
            let known = {
                let seen = self.seen.lock().unwrap();
                seen.get(&(worker, shard)).copied().unwrap_or(0)
            };
            let Some((dense_delta, latest)) = self.store.delta_since(shard, known)? else {
                continue;
            };
            let delta = droppers[shard].compress(&dense_delta, shard)?;
            let range = self.store.range(shard);
            let start = range.offset - self.region.offset;
            scatter_add(&delta, &mut params[start..start + range.size], 0);
            self.seen.lock().unwrap().insert((worker, shard), latest);
            updated += 1;
        }
        debug!(worker, shards_refreshed = updated, "sparse parameter fetch");
        Ok(())
    }

    /// Fold `params` into the moving average, if one is configured
    pub fn update_moving_average(&self, params: &[f32], batches: u64) {
        if let Some(average) = &self.average {
            average.lock().unwrap().update(params, batches);
        }
    }

    /// Snapshot of the moving average, if one is configured
    pub fn moving_average(&self) -> Option<Vec<f32>> {
        self.average
            .as_ref()
            .map(|avg| avg.lock().unwrap().values().to_vec())
    }
}

//! Versioned parameter shard storage
//!
//! Each shard owns a small ring of historical parameter versions plus a
//! monotonically increasing version counter. `apply_update` is the only
//! mutator: it takes the shard's lock, copies the previous version forward
//! into the next ring slot, runs the optimizer on that slot in place, and
//! bumps the counter. Every read hands out a snapshot copy, never an alias
//! into the ring, so an in-flight reader can never observe a slot mid-update.
//!
//! Staleness is resolved by policy, not by error: a reader asking for a
//! version that has been evicted from the ring is served the oldest retained
//! version instead, and is told which version it actually got.

use crate::errors::{Result, SyncError};
use crate::optimizer::{Optimizer, OptimizerFactory};
use crate::shard::{ShardId, ShardRange};
use crate::sparse::{scatter_add, SparseDelta};
use std::sync::Mutex;
use tracing::debug;

struct SlotState {
    /// `history` parameter buffers; version `v` lives in slot `v % history`
    ring: Vec<Vec<f32>>,
    /// Monotonically increasing, bumped once per completed update
    version: u64,
    optimizer: Box<dyn Optimizer>,
}

struct ShardSlot {
    range: ShardRange,
    state: Mutex<SlotState>,
}

/// Per-shard parameter storage with bounded version history.
pub struct VersionedShardStore {
    slots: Vec<ShardSlot>,
    history: usize,
}

impl VersionedShardStore {
    /// Create storage for the given shard ranges, seeding every ring slot
    /// from `initial` (the full parameter vector, indexed by each range's
    /// global offset).
    pub fn new(
        ranges: &[ShardRange],
        initial: &[f32],
        history: usize,
        make_optimizer: &OptimizerFactory,
    ) -> Result<Self> {
        if history == 0 {
            return Err(SyncError::Config(
                "shard history depth must be > 0".to_string(),
            ));
        }
        let mut slots = Vec::with_capacity(ranges.len());
        for range in ranges {
            if range.end() > initial.len() {
                return Err(SyncError::Shard(format!(
                    "shard range [{}, {}) exceeds parameter vector of size {}",
                    range.offset,
                    range.end(),
                    initial.len()
                )));
            }
            let seed = initial[range.offset..range.end()].to_vec();
            let ring = vec![seed; history];
            slots.push(ShardSlot {
                range: *range,
                state: Mutex::new(SlotState {
                    ring,
                    version: 0,
                    optimizer: make_optimizer(),
                }),
            });
        }
        Ok(Self { slots, history })
    }

    /// Number of shards managed by this store
    pub fn num_shards(&self) -> usize {
        self.slots.len()
    }

    /// Retained version depth per shard
    pub fn history_size(&self) -> usize {
        self.history
    }

    /// The global range covered by a shard
    pub fn range(&self, shard: ShardId) -> ShardRange {
        self.slots[shard].range
    }

    fn slot(&self, shard: ShardId) -> Result<&ShardSlot> {
        self.slots
            .get(shard)
            .ok_or_else(|| SyncError::Shard(format!("unknown shard id {shard}")))
    }

    /// Current version of a shard
    pub fn version(&self, shard: ShardId) -> Result<u64> {
        let slot = self.slot(shard)?;
        let state = slot.state.lock().unwrap();
        Ok(state.version)
    }

    /// Read the parameters of `shard` at `known_version`, clamped into the
    /// retained window. Returns the snapshot and the version actually
    /// served: if `known_version` was evicted the oldest retained version is
    /// substituted, and a future version request is served the latest.
    pub fn read(&self, shard: ShardId, known_version: u64) -> Result<(Vec<f32>, u64)> {
        let slot = self.slot(shard)?;
        let state = slot.state.lock().unwrap();
        let oldest = state.version.saturating_sub(self.history as u64 - 1);
        let served = known_version.clamp(oldest, state.version);
        if served != known_version {
            debug!(
                shard,
                requested = known_version,
                served,
                "stale read clamped into retained window"
            );
        }
        let buffer = state.ring[(served % self.history as u64) as usize].clone();
        Ok((buffer, served))
    }

    /// Snapshot of the latest version
    pub fn latest(&self, shard: ShardId) -> Result<(Vec<f32>, u64)> {
        self.read(shard, u64::MAX)
    }

    /// Apply a dense gradient to a shard under its exclusive lock: copy the
    /// previous version forward, run the optimizer in place, bump the
    /// version. Returns the new version.
    pub fn apply_update(&self, shard: ShardId, grad: &[f32], scale: f32) -> Result<u64> {
        let slot = self.slot(shard)?;
        if grad.len() != slot.range.size {
            return Err(SyncError::Shard(format!(
                "gradient of length {} does not match shard {} of size {}",
                grad.len(),
                shard,
                slot.range.size
            )));
        }
        let mut state = slot.state.lock().unwrap();
        let past = (state.version % self.history as u64) as usize;
        let next = ((state.version + 1) % self.history as u64) as usize;
        if next != past {
            let (a, b) = ring_pair(&mut state.ring, past, next);
            b.copy_from_slice(a);
        }
        let SlotState {
            ring, optimizer, ..
        } = &mut *state;
        optimizer.apply(&mut ring[next], grad, scale);
        state.version += 1;
        Ok(state.version)
    }

    /// Apply a sparse delta to a shard: densify at `index_offset` into a
    /// zeroed gradient buffer, then update as in [`apply_update`].
    pub fn apply_sparse_update(
        &self,
        shard: ShardId,
        delta: &SparseDelta,
        index_offset: isize,
        scale: f32,
    ) -> Result<u64> {
        let size = self.slot(shard)?.range.size;
        let mut dense = vec![0.0f32; size];
        scatter_add(delta, &mut dense, index_offset);
        self.apply_update(shard, &dense, scale)
    }

    /// The dense difference between the latest version and the version a
    /// reader last observed (clamped into the retained window), or `None`
    /// when the reader is already current. Returns the delta together with
    /// the latest version so the reader can update its staleness record.
    pub fn delta_since(
        &self,
        shard: ShardId,
        known_version: u64,
    ) -> Result<Option<(Vec<f32>, u64)>> {
        let slot = self.slot(shard)?;
        let state = slot.state.lock().unwrap();
        if known_version >= state.version {
            return Ok(None);
        }
        let oldest = state.version.saturating_sub(self.history as u64 - 1);
        let base = known_version.max(oldest);
        let latest = &state.ring[(state.version % self.history as u64) as usize];
        let previous = &state.ring[(base % self.history as u64) as usize];
        let delta = latest
            .iter()
            .zip(previous.iter())
            .map(|(l, p)| l - p)
            .collect();
        Ok(Some((delta, state.version)))
    }

    /// Overwrite a shard's parameters (all retained versions) without
    /// touching the version counter. Used when restoring from a checkpoint.
    pub fn set_params(&self, shard: ShardId, params: &[f32]) -> Result<()> {
        let slot = self.slot(shard)?;
        if params.len() != slot.range.size {
            return Err(SyncError::Shard(format!(
                "buffer of length {} does not match shard {} of size {}",
                params.len(),
                shard,
                slot.range.size
            )));
        }
        let mut state = slot.state.lock().unwrap();
        for buffer in state.ring.iter_mut() {
            buffer.copy_from_slice(params);
        }
        Ok(())
    }
}

/// Disjoint mutable borrows of two ring slots
fn ring_pair(ring: &mut [Vec<f32>], a: usize, b: usize) -> (&[f32], &mut [f32]) {
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = ring.split_at_mut(b);
        (lo[a].as_slice(), hi[0].as_mut_slice())
    } else {
        let (lo, hi) = ring.split_at_mut(a);
        (hi[0].as_slice(), lo[b].as_mut_slice())
    }
}

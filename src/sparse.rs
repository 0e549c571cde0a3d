//! Gradient compression into sparse deltas
//!
//! A dense gradient is compressed by keeping only the `(1 - drop_rate)`
//! fraction of entries with the largest absolute magnitude; everything else
//! is dropped for this round. The result is an (indices, values) pair with
//! strictly ascending indices, which consumers rely on to route entries to
//! sub-shards with a binary search instead of a scan.
//!
//! No residual is carried between calls: an entry dropped this round is
//! simply gone. Decompression is additive (scatter-add), never an overwrite,
//! so a delta can be applied on top of a stale parameter copy.

use crate::errors::{Result, SyncError};
use crate::shard::ShardId;
use serde::{Deserialize, Serialize};

/// Compressed (index, value) representation of a gradient or parameter
/// delta. Indices are ascending and local to whatever coordinate frame the
/// producer used (a full vector, a node range, or a single shard).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseDelta {
    /// Ascending element indices
    pub indices: Vec<u32>,
    /// Values at those indices, same length as `indices`
    pub values: Vec<f32>,
}

impl SparseDelta {
    /// An empty delta
    pub fn empty() -> Self {
        Self {
            indices: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether no entries were retained
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Extract the entries whose indices fall in `[start, end)`, re-based so
    /// the result's indices start at zero. Relies on ascending index order.
    pub fn sub_range(&self, start: usize, end: usize) -> SparseDelta {
        let lo = self.indices.partition_point(|&i| (i as usize) < start);
        let hi = self.indices.partition_point(|&i| (i as usize) < end);
        SparseDelta {
            indices: self.indices[lo..hi]
                .iter()
                .map(|&i| i - start as u32)
                .collect(),
            values: self.values[lo..hi].to_vec(),
        }
    }

    /// Shift every index by `offset` (used to lift shard-local deltas back
    /// into a node-local coordinate frame).
    pub fn shifted(&self, offset: usize) -> SparseDelta {
        SparseDelta {
            indices: self.indices.iter().map(|&i| i + offset as u32).collect(),
            values: self.values.clone(),
        }
    }

    /// Concatenate deltas that are already in one coordinate frame with
    /// ascending, non-overlapping index ranges.
    pub fn concat(parts: Vec<SparseDelta>) -> SparseDelta {
        let mut indices = Vec::new();
        let mut values = Vec::new();
        for part in parts {
            indices.extend(part.indices);
            values.extend(part.values);
        }
        SparseDelta { indices, values }
    }
}

/// Preallocated sparse capacity for a dense buffer of `size` elements under
/// `drop_rate`: a 1.2x statistical headroom over the expected kept count.
pub fn sparse_capacity(size: usize, drop_rate: f64) -> usize {
    (size as f64 * 1.2 * (1.0 - drop_rate)).ceil() as usize
}

/// How many entries `compress` keeps for a buffer of `len` elements
pub fn keep_count(len: usize, drop_rate: f64) -> usize {
    ((len as f64) * (1.0 - drop_rate)).round() as usize
}

/// Compresses dense gradients into sparse deltas under a fixed capacity
/// budget.
#[derive(Debug, Clone)]
pub struct GradientDropper {
    drop_rate: f64,
    capacity: usize,
}

impl GradientDropper {
    /// Create a dropper for dense buffers of up to `dense_size` elements
    pub fn new(dense_size: usize, drop_rate: f64) -> Self {
        Self {
            drop_rate,
            capacity: sparse_capacity(dense_size, drop_rate),
        }
    }

    /// The capacity budget of this dropper
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Compress `dense`, keeping the top `(1 - drop_rate)` fraction of
    /// entries by absolute magnitude. Ties break toward the lower index, and
    /// result indices are ascending.
    ///
    /// Fails loudly with a capacity error (naming `shard`) if the selection
    /// exceeds the preallocated budget; truncating instead would silently
    /// corrupt training.
    pub fn compress(&self, dense: &[f32], shard: ShardId) -> Result<SparseDelta> {
        let keep = keep_count(dense.len(), self.drop_rate).min(dense.len());
        if keep > self.capacity {
            return Err(SyncError::Capacity {
                shard,
                selected: keep,
                capacity: self.capacity,
            });
        }
        if keep == 0 {
            return Ok(SparseDelta::empty());
        }

        let mut order: Vec<u32> = (0..dense.len() as u32).collect();
        // Partial selection: the top `keep` by |magnitude|, lower index wins ties
        order.select_nth_unstable_by(keep - 1, |&a, &b| {
            let ma = dense[a as usize].abs();
            let mb = dense[b as usize].abs();
            mb.total_cmp(&ma).then(a.cmp(&b))
        });
        let mut kept = order[..keep].to_vec();
        kept.sort_unstable();

        let values = kept.iter().map(|&i| dense[i as usize]).collect();
        Ok(SparseDelta {
            indices: kept,
            values,
        })
    }
}

/// Scatter-add `delta` into `target` at `index + index_offset`, leaving
/// untouched entries unmodified. Entries whose shifted index falls outside
/// `target` are skipped, which is what lets a full-vector delta be applied
/// to one shard with a negative offset.
pub fn scatter_add(delta: &SparseDelta, target: &mut [f32], index_offset: isize) {
    for (&index, &value) in delta.indices.iter().zip(delta.values.iter()) {
        let shifted = index as isize + index_offset;
        if shifted >= 0 && (shifted as usize) < target.len() {
            target[shifted as usize] += value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_keeps_largest_magnitude() {
        // Drop rate 0.9 over 10 entries keeps exactly the single largest
        let dense = [1.0, 5.0, 2.0, 9.0, 0.0, 0.0, 3.0, 7.0, 4.0, 6.0];
        let dropper = GradientDropper::new(dense.len(), 0.9);
        let delta = dropper.compress(&dense, 0).unwrap();
        assert_eq!(delta.indices, vec![3]);
        assert_eq!(delta.values, vec![9.0]);
    }

    #[test]
    fn test_compress_uses_absolute_magnitude() {
        let dense = [1.0, -9.0, 2.0, 3.0];
        let dropper = GradientDropper::new(dense.len(), 0.75);
        let delta = dropper.compress(&dense, 0).unwrap();
        assert_eq!(delta.indices, vec![1]);
        assert_eq!(delta.values, vec![-9.0]);
    }

    #[test]
    fn test_compress_ties_break_low_index() {
        let dense = [2.0, 5.0, 5.0, 1.0];
        let dropper = GradientDropper::new(dense.len(), 0.75);
        let delta = dropper.compress(&dense, 0).unwrap();
        assert_eq!(delta.indices, vec![1]);
    }

    #[test]
    fn test_compress_indices_ascending() {
        let dense = [0.1, 9.0, 0.2, 8.0, 0.3, 7.0, 0.4, 6.0];
        let dropper = GradientDropper::new(dense.len(), 0.5);
        let delta = dropper.compress(&dense, 0).unwrap();
        assert_eq!(delta.indices, vec![1, 3, 5, 7]);
        assert!(delta.indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_roundtrip_reproduces_top_entries() {
        let dense = [1.0, 5.0, 2.0, 9.0, 0.5, 0.25, 3.0, 7.0, 4.0, 6.0];
        let dropper = GradientDropper::new(dense.len(), 0.5);
        let delta = dropper.compress(&dense, 0).unwrap();

        let mut restored = vec![0.0f32; dense.len()];
        scatter_add(&delta, &mut restored, 0);

        // Top half by magnitude: 9, 7, 6, 5, 4
        assert_eq!(
            restored,
            vec![0.0, 5.0, 0.0, 9.0, 0.0, 0.0, 0.0, 7.0, 4.0, 6.0]
        );
    }

    #[test]
    fn test_scatter_add_is_additive() {
        let delta = SparseDelta {
            indices: vec![0, 2],
            values: vec![1.5, -0.5],
        };
        let mut target = vec![10.0, 20.0, 30.0];
        scatter_add(&delta, &mut target, 0);
        assert_eq!(target, vec![11.5, 20.0, 29.5]);
    }

    #[test]
    fn test_scatter_add_negative_offset_skips_out_of_range() {
        // A full-vector delta applied to the shard covering [2, 5)
        let delta = SparseDelta {
            indices: vec![0, 2, 4, 6],
            values: vec![1.0, 2.0, 3.0, 4.0],
        };
        let mut shard = vec![0.0f32; 3];
        scatter_add(&delta, &mut shard, -2);
        assert_eq!(shard, vec![2.0, 0.0, 3.0]);
    }

    #[test]
    fn test_sub_range_rebases_indices() {
        let delta = SparseDelta {
            indices: vec![1, 4, 6, 9],
            values: vec![1.0, 2.0, 3.0, 4.0],
        };
        let sub = delta.sub_range(4, 9);
        assert_eq!(sub.indices, vec![0, 2]);
        assert_eq!(sub.values, vec![2.0, 3.0]);
    }

    #[test]
    fn test_capacity_error_is_loud() {
        let dropper = GradientDropper {
            drop_rate: 0.0,
            capacity: 3,
        };
        let dense = [1.0; 10];
        let err = dropper.compress(&dense, 7).unwrap_err();
        match err {
            SyncError::Capacity {
                shard,
                selected,
                capacity,
            } => {
                assert_eq!(shard, 7);
                assert_eq!(selected, 10);
                assert_eq!(capacity, 3);
            }
            other => panic!("expected capacity error, got {other}"),
        }
    }

    #[test]
    fn test_keep_count_rounding() {
        assert_eq!(keep_count(10, 0.9), 1);
        assert_eq!(keep_count(10, 0.0), 10);
        assert_eq!(keep_count(100, 0.99), 1);
        assert_eq!(keep_count(3, 0.5), 2);
    }

    #[test]
    fn test_shift_and_concat() {
        let a = SparseDelta {
            indices: vec![0, 1],
            values: vec![1.0, 2.0],
        };
        let b = SparseDelta {
            indices: vec![0],
            values: vec![3.0],
        };
        let merged = SparseDelta::concat(vec![a.shifted(0), b.shifted(5)]);
        assert_eq!(merged.indices, vec![0, 1, 5]);
        assert_eq!(merged.values, vec![1.0, 2.0, 3.0]);
    }
}

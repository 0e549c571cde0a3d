//! Parameter shard layout
//!
//! A flat parameter vector of `total` floats is partitioned into contiguous
//! shards: first across nodes, then across each node's devices. The layout is
//! pure arithmetic, computed identically on every node at startup, so no
//! coordination is needed to agree on who owns what.
//!
//! Each level uses the same scheme: a ceiling share `ceil(len / n)` consumed
//! left to right from a running remainder, clamped so the shards still to
//! come always keep room for their own minimum. Early shards get the full
//! share, trailing shards may come up short, and no shard ever comes up
//! empty as long as the level has enough elements to feed every part.

use crate::errors::{Result, SyncError};
use serde::{Deserialize, Serialize};

/// Identifies a device shard within its node (0-indexed)
pub type ShardId = usize;

/// A contiguous half-open range `[offset, offset + size)` of the parameter
/// vector, in global coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    /// First element covered by this shard
    pub offset: usize,
    /// Number of elements
    pub size: usize,
}

impl ShardRange {
    /// One past the last element covered
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    /// Whether a global index falls inside this range
    pub fn contains(&self, index: usize) -> bool {
        index >= self.offset && index < self.end()
    }
}

/// Split a length into `parts` contiguous ranges starting at `base`.
/// Each part takes the ceiling share, clamped so every later part keeps at
/// least `min_size` elements. Requires `len >= parts * min_size`.
fn split_range(base: usize, len: usize, parts: usize, min_size: usize) -> Vec<ShardRange> {
    let share = len.div_ceil(parts);
    let mut ranges = Vec::with_capacity(parts);
    let mut offset = base;
    let mut remaining = len;
    for part in 0..parts {
        let parts_left = parts - part - 1;
        let size = share.min(remaining - parts_left * min_size);
        ranges.push(ShardRange { offset, size });
        offset += size;
        remaining -= size;
    }
    ranges
}

/// The complete shard layout: per-node ranges and, within each node, the
/// per-device ranges. Shards partition `[0, total)` exactly: no gaps, no
/// overlaps, ascending offsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMap {
    total: usize,
    nodes: usize,
    devices_per_node: usize,
    node_ranges: Vec<ShardRange>,
    device_ranges: Vec<Vec<ShardRange>>,
}

impl ShardMap {
    /// Build the shard layout for `total` parameters over `nodes` machines
    /// with `devices_per_node` devices each.
    ///
    /// Every shard is non-empty whenever `total >= nodes * devices_per_node`:
    /// the node split reserves `devices_per_node` elements for each node
    /// still to come, the device split reserves one. Anything smaller cannot
    /// feed every device and is rejected; that is a configuration error and
    /// fatal at startup.
    pub fn build(total: usize, nodes: usize, devices_per_node: usize) -> Result<Self> {
        if nodes == 0 || devices_per_node == 0 {
            return Err(SyncError::Config(
                "shard map requires at least one node and one device".to_string(),
            ));
        }
        if total < nodes * devices_per_node {
            return Err(SyncError::Config(format!(
                "parameter vector of size {} cannot be split into {} node(s) x {} device(s)",
                total, nodes, devices_per_node
            )));
        }

        let node_ranges = split_range(0, total, nodes, devices_per_node);
        let device_ranges = node_ranges
            .iter()
            .map(|range| split_range(range.offset, range.size, devices_per_node, 1))
            .collect();

        Ok(Self {
            total,
            nodes,
            devices_per_node,
            node_ranges,
            device_ranges,
        })
    }

    /// Total parameter count
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of nodes
    pub fn nodes(&self) -> usize {
        self.nodes
    }

    /// Devices per node
    pub fn devices_per_node(&self) -> usize {
        self.devices_per_node
    }

    /// Total number of device shards across all nodes
    pub fn num_shards(&self) -> usize {
        self.nodes * self.devices_per_node
    }

    /// The contiguous range owned by a node
    pub fn node_range(&self, node: usize) -> ShardRange {
        self.node_ranges[node]
    }

    /// The device shard ranges of one node, in global coordinates
    pub fn device_ranges(&self, node: usize) -> &[ShardRange] {
        &self.device_ranges[node]
    }

    /// All device shard ranges across nodes, in layout order
    pub fn flat_ranges(&self) -> Vec<ShardRange> {
        self.device_ranges.iter().flatten().copied().collect()
    }

    /// The (node, device) owner of a global parameter index
    pub fn owner_of(&self, index: usize) -> Option<(usize, usize)> {
        let node = self.node_ranges.iter().position(|r| r.contains(index))?;
        let device = self.device_ranges[node]
            .iter()
            .position(|r| r.contains(index))?;
        Some((node, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exact_partition(map: &ShardMap) {
        let ranges = map.flat_ranges();
        assert_eq!(ranges.len(), map.num_shards());
        let mut expected_offset = 0;
        for range in &ranges {
            assert_eq!(range.offset, expected_offset, "gap or overlap in layout");
            assert!(range.size > 0, "zero-size shard");
            expected_offset = range.end();
        }
        assert_eq!(expected_offset, map.total());
    }

    #[test]
    fn test_even_split() {
        let map = ShardMap::build(100, 1, 4).unwrap();
        let sizes: Vec<usize> = map.device_ranges(0).iter().map(|r| r.size).collect();
        assert_eq!(sizes, vec![25, 25, 25, 25]);
        assert_exact_partition(&map);
    }

    #[test]
    fn test_uneven_split_short_last_shard() {
        let map = ShardMap::build(10, 1, 3).unwrap();
        let sizes: Vec<usize> = map.device_ranges(0).iter().map(|r| r.size).collect();
        // ceil(10/3) = 4, remainder shrinks: 4, 4, 2
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_exact_partition(&map);
    }

    #[test]
    fn test_multi_node_layout() {
        let map = ShardMap::build(100, 3, 2).unwrap();
        let node_sizes: Vec<usize> = (0..3).map(|n| map.node_range(n).size).collect();
        // ceil(100/3) = 34: 34, 34, 32
        assert_eq!(node_sizes, vec![34, 34, 32]);
        assert_exact_partition(&map);

        // Node ranges are themselves contiguous
        assert_eq!(map.node_range(1).offset, 34);
        assert_eq!(map.node_range(2).offset, 68);
    }

    #[test]
    fn test_partition_property_many_shapes() {
        // Every layout with enough elements per device must build, exactly
        for total in [6, 7, 16, 100, 101, 1000, 4096] {
            for nodes in 1..=4 {
                for devices in 1..=4 {
                    if total >= nodes * devices {
                        let map = ShardMap::build(total, nodes, devices).unwrap();
                        assert_exact_partition(&map);
                    } else {
                        assert!(ShardMap::build(total, nodes, devices).is_err());
                    }
                }
            }
        }
    }

    #[test]
    fn test_too_small_vector_rejected() {
        assert!(ShardMap::build(3, 2, 2).is_err());
        assert!(ShardMap::build(0, 1, 1).is_err());
    }

    #[test]
    fn test_clamped_share_never_starves_a_device() {
        // Plain ceil would give node 0 of 7-over-2 four elements, and four
        // over three devices would starve the last one. The clamp trims the
        // early shares instead.
        let map = ShardMap::build(7, 2, 3).unwrap();
        let node_sizes: Vec<usize> = (0..2).map(|n| map.node_range(n).size).collect();
        assert_eq!(node_sizes, vec![4, 3]);
        let sizes0: Vec<usize> = map.device_ranges(0).iter().map(|r| r.size).collect();
        assert_eq!(sizes0, vec![2, 1, 1]);
        let sizes1: Vec<usize> = map.device_ranges(1).iter().map(|r| r.size).collect();
        assert_eq!(sizes1, vec![1, 1, 1]);
        assert_exact_partition(&map);
    }

    #[test]
    fn test_tight_layout_feeds_every_device() {
        // 10 over 3x3: the node split reserves three elements per node
        // still to come, so no node ends up too short for its devices
        let map = ShardMap::build(10, 3, 3).unwrap();
        let node_sizes: Vec<usize> = (0..3).map(|n| map.node_range(n).size).collect();
        assert_eq!(node_sizes, vec![4, 3, 3]);
        assert_exact_partition(&map);
    }

    #[test]
    fn test_owner_lookup() {
        let map = ShardMap::build(100, 2, 2).unwrap();
        assert_eq!(map.owner_of(0), Some((0, 0)));
        assert_eq!(map.owner_of(49), Some((0, 1)));
        assert_eq!(map.owner_of(50), Some((1, 0)));
        assert_eq!(map.owner_of(99), Some((1, 1)));
        assert_eq!(map.owner_of(100), None);
    }
}

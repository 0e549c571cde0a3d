//! shardsync: multi-device, multi-node parameter synchronization for
//! data-parallel training.
//!
//! A flat `f32` parameter vector is partitioned across (node, device) pairs
//! by [`shard::ShardMap`]. Each shard lives in a [`store::VersionedShardStore`]
//! with a bounded version history; workers push gradients and pull
//! parameters through the [`local::LocalSyncCoordinator`] within a node and
//! the [`remote::RemoteSyncCoordinator`] across nodes, optionally
//! compressing traffic with [`sparse::GradientDropper`] and overlapping
//! communication with computation via [`overlap::OverlapPipeline`].
//!
//! Forward/backward math and the update rule stay outside the engine: the
//! compute closure and the [`optimizer::Optimizer`] trait are injected.

pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod local;
pub mod logging;
pub mod optimizer;
pub mod overlap;
pub mod remote;
pub mod shard;
pub mod sparse;
pub mod store;
pub mod transport;
pub mod worker;

pub use checkpoint::{Checkpoint, CheckpointManager};
pub use config::SyncConfig;
pub use errors::{Result, SyncError};
pub use local::LocalSyncCoordinator;
pub use optimizer::{AdamW, AdamWConfig, Optimizer, OptimizerFactory, Sgd};
pub use overlap::OverlapPipeline;
pub use remote::RemoteSyncCoordinator;
pub use shard::{ShardId, ShardMap, ShardRange};
pub use sparse::{GradientDropper, SparseDelta};
pub use store::VersionedShardStore;
pub use transport::{ChannelTransport, SyncMessage, Tag, Transport};
pub use worker::{BatchResult, LocalWorker, OverlapWorker, SchedulerHooks, WorkerContext};

//! Cross-node synchronization
//!
//! Every node runs one shard server task that owns the node's slice of the
//! parameter vector. Workers anywhere in the mesh synchronize by sending
//! each server the gradient slice for its range and waiting for the
//! refreshed parameters in return. One request and its reply form a single
//! round trip; a node-wide communication lock keeps round trips from this
//! node from interleaving on the shared endpoint.
//!
//! With compression enabled both directions are sparse. The server then
//! remembers, per (node, client) pair, the parameters it last sent to that
//! client and replies with the compressed difference against that snapshot,
//! so each client receives exactly the changes it has not seen.
//!
//! Round trips carry a timeout and a bounded retry budget with exponential
//! backoff; exhausting it is a fatal error rather than an indefinite hang.

use crate::config::SyncConfig;
use crate::errors::{Result, SyncError};
use crate::shard::ShardMap;
use crate::sparse::{scatter_add, GradientDropper, SparseDelta};
use crate::store::VersionedShardStore;
use crate::transport::{SyncMessage, Tag, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Client and server sides of cross-node synchronization for one node.
pub struct RemoteSyncCoordinator {
    transport: Arc<dyn Transport>,
    shard_map: ShardMap,
    store: Arc<VersionedShardStore>,
    config: SyncConfig,
    /// Serializes round trips from this node so at most one is
    /// outstanding on the shared endpoint at a time.
    comm: tokio::sync::Mutex<()>,
    /// Client-side compression, one dropper per peer node range
    droppers: Option<Vec<GradientDropper>>,
}

impl RemoteSyncCoordinator {
    /// Create the coordinator for this node. `store` must hold exactly the
    /// device shards of `transport.node_id()` in the given map.
    pub fn new(
        transport: Arc<dyn Transport>,
        shard_map: ShardMap,
        store: Arc<VersionedShardStore>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let node = transport.node_id();
        if node >= shard_map.nodes() || shard_map.nodes() != transport.num_nodes() {
            return Err(SyncError::Config(format!(
                "transport mesh of {} node(s) does not match layout of {} node(s)",
                transport.num_nodes(),
                shard_map.nodes()
            )));
        }
        let expected = shard_map.device_ranges(node);
        if store.num_shards() != expected.len()
            || (0..store.num_shards()).any(|s| store.range(s) != expected[s])
        {
            return Err(SyncError::Config(format!(
                "store shards do not match the layout of node {node}"
            )));
        }

        let droppers = if config.compression_enabled() {
            Some(
                (0..shard_map.nodes())
                    .map(|n| GradientDropper::new(shard_map.node_range(n).size, config.drop_rate))
                    .collect(),
            )
        } else {
            None
        };

        Ok(Self {
            transport,
            shard_map,
            store,
            config: config.clone(),
            comm: tokio::sync::Mutex::new(()),
            droppers,
        })
    }

    /// Spawn this node's shard server task.
    ///
    /// The loop serves gradient pushes until it has received one stop
    /// sentinel per node in the mesh, then drains out.
    pub fn spawn_server(&self) -> JoinHandle<Result<()>> {
        let transport = self.transport.clone();
        let store = self.store.clone();
        let node = self.transport.node_id();
        let node_range = self.shard_map.node_range(node);
        let num_nodes = self.shard_map.nodes();
        let devices = self.shard_map.devices_per_node();

        let reply_droppers: Option<Vec<GradientDropper>> = self.droppers.as_ref().map(|_| {
            (0..store.num_shards())
                .map(|s| GradientDropper::new(store.range(s).size, self.config.drop_rate))
                .collect()
        });

        // Last parameters sent to each (node, client) pair, seeded with the
        // startup values so the first sparse reply carries everything that
        // changed since then.
        let mut last_sent: HashMap<(usize, usize), Vec<Vec<f32>>> = HashMap::new();
        if reply_droppers.is_some() {
            let initial: Vec<Vec<f32>> = (0..store.num_shards())
                .map(|s| store.latest(s).map(|(buf, _)| buf))
                .collect::<Result<_>>()
                .unwrap_or_default();
            for peer in 0..num_nodes {
                for client in 0..devices {
                    last_sent.insert((peer, client), initial.clone());
                }
            }
        }

        tokio::spawn(async move {
            info!(node, offset = node_range.offset, size = node_range.size, "shard server started");
            let mut stops = 0usize;
            loop {
                let message = transport.recv(Tag::GradPush).await?;
                match message {
                    SyncMessage::Stop => {
                        stops += 1;
                        debug!(node, stops, "stop sentinel received");
                        if stops >= num_nodes {
                            break;
                        }
                    }
                    SyncMessage::DenseGrad {
                        request,
                        from,
                        scale,
                        data,
                    } => {
                        if data.len() != node_range.size {
                            warn!(
                                node,
                                from,
                                got = data.len(),
                                want = node_range.size,
                                "dense gradient with wrong size dropped"
                            );
                            continue;
                        }
                        for shard in 0..store.num_shards() {
                            let range = store.range(shard);
                            let start = range.offset - node_range.offset;
                            store.apply_update(shard, &data[start..start + range.size], scale)?;
                        }
                        let mut reply = vec![0.0f32; node_range.size];
                        for shard in 0..store.num_shards() {
                            let range = store.range(shard);
                            let (snapshot, _) = store.latest(shard)?;
                            let start = range.offset - node_range.offset;
                            reply[start..start + range.size].copy_from_slice(&snapshot);
                        }
                        transport
                            .send(
                                from,
                                Tag::ParamPush,
                                SyncMessage::DenseParams {
                                    request,
                                    data: reply,
                                },
                            )
                            .await?;
                    }
                    SyncMessage::SparseGrad {
                        request,
                        from,
                        client,
                        scale,
                        delta,
                    } => {
                        // Indices are ascending; the last one bounds them all
                        if delta
                            .indices
                            .last()
                            .is_some_and(|&i| i as usize >= node_range.size)
                        {
                            warn!(
                                node,
                                from,
                                want = node_range.size,
                                "sparse gradient with out-of-range indices dropped"
                            );
                            continue;
                        }
                        let droppers = reply_droppers.as_ref().ok_or_else(|| {
                            SyncError::Config(
                                "sparse gradient received without a configured drop rate"
                                    .to_string(),
                            )
                        })?;
                        // Route delta entries to shards by local index range
                        for shard in 0..store.num_shards() {
                            let range = store.range(shard);
                            let start = range.offset - node_range.offset;
                            let sub = delta.sub_range(start, start + range.size);
                            if !sub.is_empty() {
                                store.apply_sparse_update(shard, &sub, 0, scale)?;
                            }
                        }

                        let snapshots =
                            last_sent.entry((from, client)).or_insert_with(Vec::new);
                        let mut parts = Vec::with_capacity(store.num_shards());
                        for shard in 0..store.num_shards() {
                            let range = store.range(shard);
                            let start = range.offset - node_range.offset;
                            let (latest, _) = store.latest(shard)?;
                            let dense_delta: Vec<f32> = match snapshots.get(shard) {
                                Some(previous) => latest
                                    .iter()
                                    .zip(previous.iter())
                                    .map(|(l, p)| l - p)
                                    .collect(),
                                None => latest.clone(),
                            };
                            let sparse = droppers[shard].compress(&dense_delta, shard)?;
                            parts.push(sparse.shifted(start));
                            if shard < snapshots.len() {
                                snapshots[shard] = latest;
                            } else {
                                snapshots.push(latest);
                            }
                        }
                        transport
                            .send(
                                from,
                                Tag::ParamPush,
                                SyncMessage::SparseParams {
                                    request,
                                    delta: SparseDelta::concat(parts),
                                },
                            )
                            .await?;
                    }
                    other => {
                        warn!(node, message = ?other, "unexpected message on gradient channel");
                    }
                }
            }
            info!(node, "shard server stopped");
            Ok(())
        })
    }

    /// One full synchronization round for a worker: push `grad` to every
    /// node's server and fold the refreshed parameters back into `params`.
    /// Both buffers cover the full parameter vector. `client` is the
    /// worker's device index on this node.
    pub async fn synchronize(
        &self,
        client: usize,
        grad: &[f32],
        params: &mut [f32],
        scale: f32,
    ) -> Result<()> {
        let total = self.shard_map.total();
        if grad.len() != total || params.len() != total {
            return Err(SyncError::Shard(format!(
                "synchronization buffers must cover all {total} parameters"
            )));
        }
        for peer in 0..self.shard_map.nodes() {
            let range = self.shard_map.node_range(peer);
            let grad_slice = &grad[range.offset..range.end()];
            match &self.droppers {
                Some(droppers) => {
                    let delta = droppers[peer].compress(grad_slice, peer)?;
                    let request = SyncMessage::SparseGrad {
                        request: Uuid::nil(),
                        from: self.transport.node_id(),
                        client,
                        scale,
                        delta,
                    };
                    match self.round_trip(peer, request).await? {
                        SyncMessage::SparseParams { delta, .. } => {
                            scatter_add(&delta, &mut params[range.offset..range.end()], 0);
                        }
                        other => {
                            return Err(SyncError::Transport(format!(
                                "expected sparse parameters from peer {peer}, got {other:?}"
                            )))
                        }
                    }
                }
                None => {
                    let request = SyncMessage::DenseGrad {
                        request: Uuid::nil(),
                        from: self.transport.node_id(),
                        scale,
                        data: grad_slice.to_vec(),
                    };
                    match self.round_trip(peer, request).await? {
                        SyncMessage::DenseParams { data, .. } if data.len() == range.size => {
                            params[range.offset..range.end()].copy_from_slice(&data);
                        }
                        other => {
                            return Err(SyncError::Transport(format!(
                                "expected dense parameters from peer {peer}, got {other:?}"
                            )))
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Send the stop sentinel to every server in the mesh. Each server
    /// exits after collecting one sentinel per node.
    pub async fn shutdown(&self) -> Result<()> {
        for peer in 0..self.shard_map.nodes() {
            self.transport.send(peer, Tag::GradPush, SyncMessage::Stop).await?;
        }
        Ok(())
    }

    /// One send-and-await-reply exchange with a peer's server.
    ///
    /// Each attempt is stamped with a fresh id and only the matching reply
    /// is accepted. A reply left over from an abandoned attempt (its id no
    /// longer outstanding) is discarded, never consumed by a later round
    /// trip to a different peer.
    async fn round_trip(&self, peer: usize, mut request: SyncMessage) -> Result<SyncMessage> {
        let _guard = self.comm.lock().await;
        let attempts = self.config.max_retries.max(1);
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=attempts {
            let id = Uuid::new_v4();
            match &mut request {
                SyncMessage::DenseGrad { request, .. }
                | SyncMessage::SparseGrad { request, .. } => *request = id,
                other => {
                    return Err(SyncError::Transport(format!(
                        "not a request message: {other:?}"
                    )))
                }
            }
            self.transport.send(peer, Tag::GradPush, request.clone()).await?;
            let matching_reply = async {
                loop {
                    let reply = self.transport.recv(Tag::ParamPush).await?;
                    if reply.request_id() == Some(id) {
                        return Ok(reply);
                    }
                    warn!(peer, reply = ?reply.request_id(), "stale reply discarded");
                }
            };
            match tokio::time::timeout(self.config.request_timeout(), matching_reply).await {
                Ok(reply) => return reply,
                Err(_) => {
                    warn!(peer, attempt, "round trip timed out");
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(SyncError::Timeout { peer, attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{factory, Sgd};
    use crate::transport::ChannelTransport;

    fn coordinators(config: &SyncConfig, total: usize) -> Vec<Arc<RemoteSyncCoordinator>> {
        let map = ShardMap::build(total, config.nodes, config.devices_per_node).unwrap();
        let initial = vec![0.0f32; total];
        ChannelTransport::mesh(config.nodes)
            .into_iter()
            .map(|endpoint| {
                let node = endpoint.node_id();
                let store = Arc::new(
                    VersionedShardStore::new(
                        map.device_ranges(node),
                        &initial,
                        config.effective_history_size(),
                        &factory(|| Sgd::new(1.0)),
                    )
                    .unwrap(),
                );
                Arc::new(
                    RemoteSyncCoordinator::new(Arc::new(endpoint), map.clone(), store, config)
                        .unwrap(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_dense_round_trip_updates_all_nodes() {
        let config = SyncConfig {
            nodes: 2,
            devices_per_node: 2,
            ..Default::default()
        };
        let coords = coordinators(&config, 8);
        let servers: Vec<_> = coords.iter().map(|c| c.spawn_server()).collect();

        let grad = vec![1.0f32; 8];
        let mut params = vec![0.0f32; 8];
        coords[0].synchronize(0, &grad, &mut params, 0.5).await.unwrap();
        // SGD lr 1.0, scale 0.5 over every shard of both nodes
        assert_eq!(params, vec![-0.5; 8]);

        for coord in &coords {
            coord.shutdown().await.unwrap();
        }
        for server in servers {
            server.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_sparse_round_trip_delivers_unseen_delta() {
        let config = SyncConfig {
            nodes: 1,
            devices_per_node: 2,
            drop_rate: 0.5,
            ..Default::default()
        };
        let coords = coordinators(&config, 8);
        let server = coords[0].spawn_server();

        // Client 0 pushes; the top half per node range survives compression
        let grad = vec![4.0, 3.0, 2.0, 1.0, 4.0, 3.0, 2.0, 1.0];
        let mut params = vec![0.0f32; 8];
        coords[0].synchronize(0, &grad, &mut params, 1.0).await.unwrap();
        assert!(params[0] < 0.0);

        // Client 1 never synced; its first reply carries the same changes
        let mut other = vec![0.0f32; 8];
        coords[0]
            .synchronize(1, &[0.0; 8], &mut other, 1.0)
            .await
            .unwrap();
        assert!(other[0] < 0.0);

        // Client 0 again with a zero gradient: nothing new to receive
        let before = params.clone();
        coords[0].synchronize(0, &[0.0; 8], &mut params, 1.0).await.unwrap();
        assert_eq!(params, before);

        coords[0].shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_times_out_without_server() {
        let config = SyncConfig {
            nodes: 1,
            devices_per_node: 1,
            request_timeout_ms: 20,
            max_retries: 2,
            ..Default::default()
        };
        let coords = coordinators(&config, 4);
        // No server spawned; the round trip must fail after its retries
        let err = coords[0]
            .synchronize(0, &[1.0; 4], &mut [0.0; 4].to_vec(), 1.0)
            .await
            .unwrap_err();
        match err {
            SyncError::Timeout { peer, attempts } => {
                assert_eq!(peer, 0);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_stale_reply_is_discarded() {
        let config = SyncConfig {
            nodes: 1,
            devices_per_node: 1,
            ..Default::default()
        };
        let map = ShardMap::build(4, 1, 1).unwrap();
        let mut endpoints = ChannelTransport::mesh(1);
        let endpoint = Arc::new(endpoints.pop().unwrap());
        let store = Arc::new(
            VersionedShardStore::new(
                map.device_ranges(0),
                &vec![0.0; 4],
                1,
                &factory(|| Sgd::new(1.0)),
            )
            .unwrap(),
        );
        let coord =
            RemoteSyncCoordinator::new(endpoint.clone(), map, store, &config).unwrap();
        let server = coord.spawn_server();

        // A reply from an abandoned earlier attempt is already queued when
        // the next round trip starts
        endpoint
            .send(
                0,
                Tag::ParamPush,
                SyncMessage::DenseParams {
                    request: Uuid::new_v4(),
                    data: vec![9.0; 4],
                },
            )
            .await
            .unwrap();

        let mut params = vec![0.0f32; 4];
        coord.synchronize(0, &[1.0; 4], &mut params, 1.0).await.unwrap();
        // The leftover payload is skipped; only the matching reply lands
        assert_eq!(params, vec![-1.0; 4]);

        coord.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_store_rejected() {
        let config = SyncConfig {
            nodes: 2,
            devices_per_node: 1,
            ..Default::default()
        };
        let map = ShardMap::build(8, 2, 1).unwrap();
        let mut endpoints = ChannelTransport::mesh(2);
        let endpoint = endpoints.remove(1);
        // Store built with node 0's shards handed to node 1's endpoint
        let store = Arc::new(
            VersionedShardStore::new(
                map.device_ranges(0),
                &vec![0.0; 8],
                1,
                &factory(|| Sgd::new(1.0)),
            )
            .unwrap(),
        );
        assert!(RemoteSyncCoordinator::new(Arc::new(endpoint), map, store, &config).is_err());
    }
}

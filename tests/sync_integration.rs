//! End-to-end synchronization tests: sharding, compression, versioned
//! storage, local and remote coordination, and overlap working together.

use shardsync::config::SyncConfig;
use shardsync::local::LocalSyncCoordinator;
use shardsync::optimizer::{factory, Optimizer, Sgd};
use shardsync::remote::RemoteSyncCoordinator;
use shardsync::shard::ShardMap;
use shardsync::sparse::{scatter_add, GradientDropper};
use shardsync::store::VersionedShardStore;
use shardsync::transport::{ChannelTransport, Transport};
use shardsync::worker::{BatchResult, LocalWorker, NoopHooks, OverlapWorker};
use std::sync::Arc;

fn local_setup(config: &SyncConfig, total: usize) -> Arc<LocalSyncCoordinator> {
    let map = ShardMap::build(total, 1, config.devices_per_node).unwrap();
    let initial = vec![0.0f32; total];
    let store = Arc::new(
        VersionedShardStore::new(
            &map.flat_ranges(),
            &initial,
            config.effective_history_size(),
            &factory(|| Sgd::new(1.0)),
        )
        .unwrap(),
    );
    Arc::new(LocalSyncCoordinator::new(store, config, &initial).unwrap())
}

#[test]
fn four_device_layout_and_targeted_update() {
    // 100 parameters over one node with four devices: four shards of 25
    let map = ShardMap::build(100, 1, 4).unwrap();
    let sizes: Vec<usize> = map.device_ranges(0).iter().map(|r| r.size).collect();
    assert_eq!(sizes, vec![25, 25, 25, 25]);

    let initial = vec![0.0f32; 100];
    let store = VersionedShardStore::new(
        &map.flat_ranges(),
        &initial,
        1,
        &factory(|| Sgd::new(1.0)),
    )
    .unwrap();

    // An all-ones gradient scaled by 0.1 applied to shard 0 alone moves
    // exactly that shard's 25 parameters by -0.1
    store.apply_update(0, &vec![1.0; 25], 0.1).unwrap();
    let (shard0, version) = store.latest(0).unwrap();
    assert_eq!(version, 1);
    assert!(shard0.iter().all(|&p| (p + 0.1).abs() < 1e-6));
    for shard in 1..4 {
        let (params, version) = store.latest(shard).unwrap();
        assert_eq!(version, 0);
        assert!(params.iter().all(|&p| p == 0.0));
    }
}

#[test]
fn aggressive_compression_keeps_single_peak() {
    // Drop rate 0.9 over ten entries keeps only the peak at index 3
    let dense = [1.0, 5.0, 2.0, 9.0, 0.0, 0.0, 3.0, 7.0, 4.0, 6.0];
    let dropper = GradientDropper::new(dense.len(), 0.9);
    let delta = dropper.compress(&dense, 0).unwrap();
    assert_eq!(delta.indices, vec![3]);
    assert_eq!(delta.values, vec![9.0]);

    let mut restored = vec![0.0f32; dense.len()];
    scatter_add(&delta, &mut restored, 0);
    assert_eq!(restored[3], 9.0);
    assert_eq!(restored.iter().filter(|&&v| v != 0.0).count(), 1);
}

#[test]
fn training_loop_converges_on_quadratic() {
    let config = SyncConfig::single_node(2);
    let coord = local_setup(&config, 8);
    let target = vec![3.0f32; 8];

    let mut workers: Vec<LocalWorker> = (0..2)
        .map(|w| {
            LocalWorker::new(coord.clone(), &config, w, w, Box::new(NoopHooks), None).unwrap()
        })
        .collect();

    // Minimize 0.5 * ||p - target||^2 with gradient (p - target), taking
    // damped steps so two workers alternating stay stable
    for _ in 0..60 {
        for worker in workers.iter_mut() {
            let target = target.clone();
            worker
                .step(move |params| {
                    let grad: Vec<f32> =
                        params.iter().zip(&target).map(|(p, t)| 0.3 * (p - t)).collect();
                    let cost = params
                        .iter()
                        .zip(&target)
                        .map(|(p, t)| 0.5 * (p - t) * (p - t))
                        .sum();
                    BatchResult {
                        grad,
                        cost,
                        weight: 1.0,
                    }
                })
                .unwrap();
        }
    }

    let mut params = vec![0.0f32; 8];
    coord.fetch_params(&mut params).unwrap();
    for (p, t) in params.iter().zip(&target) {
        assert!((p - t).abs() < 0.05, "did not converge: {p} vs {t}");
    }
}

#[test]
fn compressed_training_still_converges() {
    let config = SyncConfig {
        devices_per_node: 2,
        drop_rate: 0.5,
        ..Default::default()
    };
    let coord = local_setup(&config, 8);
    let target = vec![2.0f32; 8];

    let mut worker =
        LocalWorker::new(coord.clone(), &config, 0, 0, Box::new(NoopHooks), None).unwrap();
    for _ in 0..200 {
        let target = target.clone();
        worker
            .step(move |params| {
                let grad: Vec<f32> =
                    params.iter().zip(&target).map(|(p, t)| 0.2 * (p - t)).collect();
                BatchResult {
                    grad,
                    cost: 0.0,
                    weight: 1.0,
                }
            })
            .unwrap();
    }

    let mut params = vec![0.0f32; 8];
    coord.fetch_params(&mut params).unwrap();
    // Half the entries are dropped every round, but over many rounds every
    // coordinate gets its turn at being largest
    for (p, t) in params.iter().zip(&target) {
        assert!((p - t).abs() < 0.2, "did not converge: {p} vs {t}");
    }
}

#[test]
fn stale_reads_stay_inside_retained_window() {
    let history = 3;
    let map = ShardMap::build(12, 1, 2).unwrap();
    let store = VersionedShardStore::new(
        &map.flat_ranges(),
        &vec![0.0; 12],
        history,
        &factory(|| Sgd::new(1.0)),
    )
    .unwrap();

    for round in 0..10u64 {
        store.apply_update(0, &vec![1.0; 6], 1.0).unwrap();
        // However stale the request, the served version stays within
        // history of the latest
        let (_, served) = store.read(0, 0).unwrap();
        let latest = store.version(0).unwrap();
        assert!(latest - served < history as u64);
        assert!(served <= latest);
        assert_eq!(latest, round + 1);
    }
}

fn remote_setup(config: &SyncConfig, total: usize) -> Vec<Arc<RemoteSyncCoordinator>> {
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
async fn two_node_mesh_sees_each_others_updates() {
    let config = SyncConfig {
        nodes: 2,
        devices_per_node: 2,
        ..Default::default()
    };
    let coords = remote_setup(&config, 16);
    let servers: Vec<_> = coords.iter().map(|c| c.spawn_server()).collect();

    // A worker on node 0 pushes an all-ones gradient everywhere
    let mut params = vec![0.0f32; 16];
    coords[0]
        .synchronize(0, &vec![1.0; 16], &mut params, 1.0)
        .await
        .unwrap();
    assert_eq!(params, vec![-1.0; 16]);

    // A worker on node 1 pushes nothing and still receives the state
    let mut observed = vec![0.0f32; 16];
    coords[1]
        .synchronize(0, &vec![0.0; 16], &mut observed, 1.0)
        .await
        .unwrap();
    assert_eq!(observed, vec![-1.0; 16]);

    for coord in &coords {
        coord.shutdown().await.unwrap();
    }
    for server in servers {
        server.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn sparse_mesh_round_trips_per_client_deltas() {
    let config = SyncConfig {
        nodes: 2,
        devices_per_node: 1,
        drop_rate: 0.5,
        ..Default::default()
    };
    let coords = remote_setup(&config, 8);
    let servers: Vec<_> = coords.iter().map(|c| c.spawn_server()).collect();

    let grad = vec![4.0, 3.0, 2.0, 1.0, 4.0, 3.0, 2.0, 1.0];
    let mut params = vec![0.0f32; 8];
    coords[0].synchronize(0, &grad, &mut params, 1.0).await.unwrap();
    // The surviving half of each node range arrived
    assert!(params[0] < 0.0);
    assert!(params[4] < 0.0);

    // The same client syncing again with zero gradient gets no new delta
    let before = params.clone();
    coords[0]
        .synchronize(0, &vec![0.0; 8], &mut params, 1.0)
        .await
        .unwrap();
    assert_eq!(params, before);

    // A client on the other node receives the full change on first contact
    let mut fresh = vec![0.0f32; 8];
    coords[1]
        .synchronize(0, &vec![0.0; 8], &mut fresh, 1.0)
        .await
        .unwrap();
    assert!(fresh[0] < 0.0);

    for coord in &coords {
        coord.shutdown().await.unwrap();
    }
    for server in servers {
        server.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn overlap_workers_share_progress_through_store() {
    let config = SyncConfig {
        devices_per_node: 2,
        overlap: true,
        ..Default::default()
    };
    let coord = local_setup(&config, 8);

    let mut worker = OverlapWorker::new(
        coord.clone(),
        &config,
        0,
        0,
        Box::new(Sgd::new(1.0)),
        Box::new(NoopHooks),
    )
    .unwrap();

    for _ in 0..10 {
        worker
            .step(|_| BatchResult {
                grad: vec![1.0; 8],
                cost: 0.0,
                weight: 1.0,
            })
            .await
            .unwrap();
        tokio::task::yield_now().await;
    }
    worker.shutdown().await.unwrap();

    let mut committed = vec![0.0f32; 8];
    coord.fetch_params(&mut committed).unwrap();
    // At least one full handoff and sync completed
    assert!(committed.iter().all(|&p| p < 0.0));
}

#[test]
fn moving_average_trails_the_parameters() {
    let config = SyncConfig {
        devices_per_node: 1,
        moving_average: true,
        moving_decay: 0.5,
        ..Default::default()
    };
    let coord = local_setup(&config, 4);
    let mut worker =
        LocalWorker::new(coord.clone(), &config, 0, 0, Box::new(NoopHooks), None).unwrap();

    for _ in 0..5 {
        worker
            .step(|_| BatchResult {
                grad: vec![1.0; 4],
                cost: 0.0,
                weight: 1.0,
            })
            .unwrap();
    }

    let mut params = vec![0.0f32; 4];
    coord.fetch_params(&mut params).unwrap();
    let average = coord.moving_average().unwrap();
    // The average lags behind the raw parameters and has left zero
    assert!(average[0] < 0.0);
    assert!(average[0] > params[0]);
}

#[test]
fn optimizer_state_stays_per_shard() {
    // A stateful rule built through the factory keeps independent moments
    // per shard: updating one shard must not advance another's step count
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StepCounter(Arc<AtomicUsize>);
    impl Optimizer for StepCounter {
        fn apply(&mut self, params: &mut [f32], grad: &[f32], scale: f32) {
            self.0.fetch_add(1, Ordering::SeqCst);
            for (p, g) in params.iter_mut().zip(grad.iter()) {
                *p -= scale * g;
            }
        }
    }

    let counters: Arc<std::sync::Mutex<Vec<Arc<AtomicUsize>>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let counters_clone = counters.clone();
    let make: shardsync::optimizer::OptimizerFactory = Arc::new(move || {
        let counter = Arc::new(AtomicUsize::new(0));
        counters_clone.lock().unwrap().push(counter.clone());
        Box::new(StepCounter(counter))
    });

    let map = ShardMap::build(8, 1, 2).unwrap();
    let store = VersionedShardStore::new(&map.flat_ranges(), &vec![0.0; 8], 1, &make).unwrap();
    assert_eq!(counters.lock().unwrap().len(), 2);

    store.apply_update(0, &vec![1.0; 4], 1.0).unwrap();
    store.apply_update(0, &vec![1.0; 4], 1.0).unwrap();
    store.apply_update(1, &vec![1.0; 4], 1.0).unwrap();

    let counts: Vec<usize> = counters
        .lock()
        .unwrap()
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .collect();
    assert_eq!(counts, vec![2, 1]);
}

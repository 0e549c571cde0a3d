//! Per-device training drivers
//!
//! A worker owns its parameter copy and window state explicitly in a
//! [`WorkerContext`]; nothing is bound to the OS thread that happens to run
//! it. Each step runs an injected compute closure against the current
//! parameters, accumulates the gradient over a window of `tau` batches, and
//! synchronizes on window boundaries. Scheduler hooks and checkpointing run
//! after the synchronization, outside every shard lock.
//!
//! [`LocalWorker`] synchronizes through the blocking push/fetch pair;
//! [`OverlapWorker`] replaces it with the double-buffer handoff and applies
//! a local optimizer step so parameters keep moving between syncs.

use crate::checkpoint::CheckpointManager;
use crate::config::SyncConfig;
use crate::errors::{Result, SyncError};
use crate::local::LocalSyncCoordinator;
use crate::optimizer::{grad_norm, Optimizer};
use crate::overlap::{spawn_sync_task, OverlapPipeline};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One batch's output from the compute closure
pub struct BatchResult {
    /// Gradient over the worker's parameter region
    pub grad: Vec<f32>,
    /// Training cost of the batch
    pub cost: f32,
    /// Batch weight (e.g. target token count); 1.0 when unweighted
    pub weight: f32,
}

/// Per-step statistics handed to scheduler hooks
#[derive(Debug, Clone)]
pub struct StepStats {
    pub step: u64,
    pub grad_norm: f32,
    pub batch_weight: f32,
    /// Whether this step ended with a synchronization
    pub synced: bool,
}

/// Scheduling decisions injected by the surrounding training loop.
/// Invoked outside every shard lock.
pub trait SchedulerHooks: Send {
    fn on_step(&mut self, cost: f32, stats: &StepStats);

    fn should_save(&self) -> bool {
        false
    }

    fn should_validate(&self) -> bool {
        false
    }

    /// Run validation against a parameter snapshot; receives the moving
    /// average when one is maintained, the worker's copy otherwise
    fn on_validate(&mut self, _params: &[f32]) {}
}

/// Hooks that never fire; the default for tests and simple drivers
pub struct NoopHooks;

impl SchedulerHooks for NoopHooks {
    fn on_step(&mut self, _cost: f32, _stats: &StepStats) {}
}

/// Save/validate on fixed step intervals (0 disables an interval)
pub struct IntervalHooks {
    save_every: u64,
    validate_every: u64,
    step: u64,
}

impl IntervalHooks {
    pub fn new(save_every: u64, validate_every: u64) -> Self {
        Self {
            save_every,
            validate_every,
            step: 0,
        }
    }
}

impl SchedulerHooks for IntervalHooks {
    fn on_step(&mut self, _cost: f32, stats: &StepStats) {
        self.step = stats.step;
    }

    fn should_save(&self) -> bool {
        self.save_every > 0 && self.step > 0 && self.step % self.save_every == 0
    }

    fn should_validate(&self) -> bool {
        self.validate_every > 0 && self.step > 0 && self.step % self.validate_every == 0
    }
}

/// Explicit per-worker state: identity, the worker's parameter copy, and
/// the gradient accumulation window.
pub struct WorkerContext {
    pub worker_id: usize,
    /// Device index on this node
    pub device: usize,
    params: Vec<f32>,
    accum: Vec<f32>,
    weight_sum: f32,
    window_pos: usize,
    tau: usize,
    step: u64,
}

impl WorkerContext {
    fn new(worker_id: usize, device: usize, params: Vec<f32>, tau: usize) -> Self {
        let size = params.len();
        Self {
            worker_id,
            device,
            params,
            accum: vec![0.0; size],
            weight_sum: 0.0,
            window_pos: 0,
            tau,
            step: 0,
        }
    }

    /// The worker's current parameter copy
    pub fn params(&self) -> &[f32] {
        &self.params
    }

    /// Completed steps
    pub fn step(&self) -> u64 {
        self.step
    }

    fn accumulate(&mut self, result: &BatchResult) -> Result<()> {
        if result.grad.len() != self.accum.len() {
            return Err(SyncError::Shard(format!(
                "gradient of length {} does not match parameter copy of length {}",
                result.grad.len(),
                self.accum.len()
            )));
        }
        for (sum, g) in self.accum.iter_mut().zip(result.grad.iter()) {
            *sum += g;
        }
        self.weight_sum += result.weight;
        self.window_pos += 1;
        Ok(())
    }

    /// Drain the window: the summed gradient and the update scale
    /// (reciprocal of the summed batch weight).
    fn take_window(&mut self) -> (Vec<f32>, f32) {
        let grad = std::mem::replace(&mut self.accum, vec![0.0; self.params.len()]);
        let scale = if self.weight_sum > 0.0 {
            1.0 / self.weight_sum
        } else {
            1.0
        };
        self.weight_sum = 0.0;
        self.window_pos = 0;
        (grad, scale)
    }

    fn window_complete(&self) -> bool {
        self.window_pos >= self.tau
    }
}

/// Training driver synchronizing through a [`LocalSyncCoordinator`].
pub struct LocalWorker {
    ctx: WorkerContext,
    coordinator: Arc<LocalSyncCoordinator>,
    sparse: bool,
    hooks: Box<dyn SchedulerHooks>,
    checkpoints: Option<CheckpointManager>,
}

impl LocalWorker {
    pub fn new(
        coordinator: Arc<LocalSyncCoordinator>,
        config: &SyncConfig,
        worker_id: usize,
        device: usize,
        hooks: Box<dyn SchedulerHooks>,
        checkpoints: Option<CheckpointManager>,
    ) -> Result<Self> {
        let mut params = vec![0.0; coordinator.region().size];
        // Record the fetched versions so the first sparse fetch does not
        // re-apply changes this copy already contains
        coordinator.fetch_params_for(worker_id, &mut params)?;
        Ok(Self {
            ctx: WorkerContext::new(worker_id, device, params, config.tau),
            coordinator,
            sparse: config.compression_enabled(),
            hooks,
            checkpoints,
        })
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Run one training step. Fetches fresh parameters at window start,
    /// computes, and pushes the accumulated gradient when the window
    /// closes. Returns the batch cost.
    pub fn step<F>(&mut self, compute: F) -> Result<f32>
    where
        F: FnOnce(&[f32]) -> BatchResult,
    {
        if self.ctx.window_pos == 0 {
            if self.sparse {
                self.coordinator
                    .sparse_fetch_params(self.ctx.worker_id, &mut self.ctx.params)?;
            } else {
                self.coordinator.fetch_params(&mut self.ctx.params)?;
            }
        }

        let result = compute(&self.ctx.params);
        let norm = grad_norm(&result.grad);
        let weight = result.weight;
        self.ctx.accumulate(&result)?;

        let synced = self.ctx.window_complete();
        if synced {
            let (grad, scale) = self.ctx.take_window();
            self.coordinator.push_gradients(&grad, scale)?;
            // The average folds in the parameters the push produced, so
            // refresh the copy before updating it
            if self.sparse {
                self.coordinator
                    .sparse_fetch_params(self.ctx.worker_id, &mut self.ctx.params)?;
            } else {
                self.coordinator.fetch_params(&mut self.ctx.params)?;
            }
            self.coordinator
                .update_moving_average(&self.ctx.params, self.ctx.step);
        }

        self.ctx.step += 1;
        let stats = StepStats {
            step: self.ctx.step,
            grad_norm: norm,
            batch_weight: weight,
            synced,
        };
        self.hooks.on_step(result.cost, &stats);
        if self.hooks.should_validate() {
            let snapshot = self
                .coordinator
                .moving_average()
                .unwrap_or_else(|| self.ctx.params.clone());
            self.hooks.on_validate(&snapshot);
        }
        self.maybe_checkpoint()?;
        Ok(result.cost)
    }

    fn maybe_checkpoint(&self) -> Result<()> {
        if !self.hooks.should_save() {
            return Ok(());
        }
        let Some(manager) = &self.checkpoints else {
            return Ok(());
        };
        let average = self.coordinator.moving_average();
        manager.save(self.ctx.step, &self.ctx.params, average.as_deref())?;
        Ok(())
    }
}

/// Training driver that overlaps synchronization with computation.
///
/// Every step accumulates into the handoff pipeline and additionally runs a
/// local optimizer step on the worker's own copy, so local-only rounds
/// still make progress. The background task pushes to the coordinator and
/// fetches committed parameters, which replace the local copy on the next
/// successful handoff.
pub struct OverlapWorker {
    ctx: WorkerContext,
    pipeline: OverlapPipeline,
    sync_task: Option<JoinHandle<Result<()>>>,
    local_optimizer: Box<dyn Optimizer>,
    hooks: Box<dyn SchedulerHooks>,
}

impl OverlapWorker {
    pub fn new(
        coordinator: Arc<LocalSyncCoordinator>,
        config: &SyncConfig,
        worker_id: usize,
        device: usize,
        local_optimizer: Box<dyn Optimizer>,
        hooks: Box<dyn SchedulerHooks>,
    ) -> Result<Self> {
        let size = coordinator.region().size;
        let mut params = vec![0.0; size];
        coordinator.fetch_params(&mut params)?;

        let pipeline = OverlapPipeline::new(size, config.max_compute_iters);
        let sync_task = spawn_sync_task(pipeline.buffer(), move |grad, weight| {
            let coordinator = coordinator.clone();
            async move {
                let scale = if weight > 0.0 { 1.0 / weight } else { 1.0 };
                coordinator.push_gradients(&grad, scale)?;
                let mut fresh = vec![0.0; grad.len()];
                coordinator.fetch_params(&mut fresh)?;
                Ok(fresh)
            }
        });
        info!(worker_id, device, "overlap worker started");

        Ok(Self {
            ctx: WorkerContext::new(worker_id, device, params, config.tau),
            pipeline,
            sync_task: Some(sync_task),
            local_optimizer,
            hooks,
        })
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Run one training step: compute, accumulate into the pipeline, take a
    /// local optimizer step, and attempt the non-blocking handoff. Waits
    /// for the sync task only when the local-only cap is hit.
    pub async fn step<F>(&mut self, compute: F) -> Result<f32>
    where
        F: FnOnce(&[f32]) -> BatchResult,
    {
        // A raised stop flag means the sync task failed or shut down; its
        // error surfaces from shutdown()
        if self.pipeline.is_stopped() {
            return Err(SyncError::Shutdown);
        }
        let result = compute(&self.ctx.params);
        if result.grad.len() != self.ctx.params.len() {
            return Err(SyncError::Shard(format!(
                "gradient of length {} does not match parameter copy of length {}",
                result.grad.len(),
                self.ctx.params.len()
            )));
        }
        let norm = grad_norm(&result.grad);

        self.pipeline.accumulate(&result.grad, result.weight);
        let scale = if result.weight > 0.0 {
            1.0 / result.weight
        } else {
            1.0
        };
        self.local_optimizer
            .apply(&mut self.ctx.params, &result.grad, scale);

        if self.pipeline.must_sync() {
            debug!(
                worker_id = self.ctx.worker_id,
                "local-only cap reached, waiting for sync"
            );
            self.pipeline.wait_until_idle().await;
        }
        let synced = self.pipeline.try_handoff(&mut self.ctx.params);

        self.ctx.step += 1;
        let stats = StepStats {
            step: self.ctx.step,
            grad_norm: norm,
            batch_weight: result.weight,
            synced,
        };
        self.hooks.on_step(result.cost, &stats);
        Ok(result.cost)
    }

    /// Stop the background task and wait for it to drain
    pub async fn shutdown(mut self) -> Result<()> {
        self.pipeline.stop();
        if let Some(task) = self.sync_task.take() {
            task.await
                .map_err(|e| SyncError::Transport(format!("sync task join failed: {e}")))??;
        }
        Ok(())
    }
}

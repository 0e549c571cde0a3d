//! Communication/computation overlap via per-device double buffering
//!
//! Each device owns one shared buffer that cycles through
//! `Filling -> Ready -> Syncing -> Filling`. The compute loop accumulates a
//! running gradient sum on its side and attempts a non-blocking handoff
//! after each batch: if the background sync task is idle the accumulated
//! gradient moves into the buffer, any freshly synchronized parameters move
//! out, and the accumulator resets. If the task is still busy the batch was
//! a local-only round and the sum keeps growing.
//!
//! An optional cap on local-only rounds forces the compute loop to wait for
//! the sync task once the cap is reached. Shutdown wakes a parked sync task
//! with a spurious ready signal; the task drains a gradient already handed
//! off, then exits on the stop flag. A failed sync round also raises the
//! stop flag so waiting compute loops wake instead of hanging.

use crate::errors::Result;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    /// Owned by the compute side; a handoff may fill it
    Filling,
    /// Filled; waiting for the sync task to pick it up
    Ready,
    /// The sync task is working on its contents
    Syncing,
}

struct Slot {
    state: BufferState,
    grad: Vec<f32>,
    scale: f32,
    /// Parameters produced by the last completed sync, not yet collected
    fresh_params: Option<Vec<f32>>,
    stop: bool,
}

/// The buffer shared between one device's compute loop and its sync task.
pub struct OverlapBuffer {
    slot: Mutex<Slot>,
    /// Wakes the sync task when the buffer turns ready (or on stop)
    ready: Notify,
    /// Wakes a compute loop waiting for the buffer to turn idle
    idle: Notify,
}

impl OverlapBuffer {
    fn new(size: usize) -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: BufferState::Filling,
                grad: vec![0.0; size],
                scale: 0.0,
                fresh_params: None,
                stop: false,
            }),
            ready: Notify::new(),
            idle: Notify::new(),
        }
    }

    /// Request shutdown: set the stop flag and wake the sync task even
    /// though no gradient is ready.
    pub fn stop(&self) {
        self.slot.lock().unwrap().stop = true;
        self.ready.notify_one();
    }

    /// Whether the stop flag is raised (shutdown requested or the sync
    /// task failed)
    pub fn is_stopped(&self) -> bool {
        self.slot.lock().unwrap().stop
    }
}

/// Compute-side half of the overlap machinery for one device.
pub struct OverlapPipeline {
    buffer: Arc<OverlapBuffer>,
    accum: Vec<f32>,
    scale_sum: f32,
    batches_accumulated: usize,
    local_rounds: usize,
    max_compute_iters: usize,
}

impl OverlapPipeline {
    /// Create a pipeline for gradient buffers of `size` elements.
    /// `max_compute_iters` caps consecutive local-only rounds (0 = no cap).
    pub fn new(size: usize, max_compute_iters: usize) -> Self {
        Self {
            buffer: Arc::new(OverlapBuffer::new(size)),
            accum: vec![0.0; size],
            scale_sum: 0.0,
            batches_accumulated: 0,
            local_rounds: 0,
            max_compute_iters,
        }
    }

    /// The shared buffer, for spawning the sync task
    pub fn buffer(&self) -> Arc<OverlapBuffer> {
        self.buffer.clone()
    }

    /// Add one batch's gradient into the running sum
    pub fn accumulate(&mut self, grad: &[f32], scale: f32) {
        for (sum, g) in self.accum.iter_mut().zip(grad.iter()) {
            *sum += g;
        }
        self.scale_sum += scale;
        self.batches_accumulated += 1;
    }

    /// Batches folded into the accumulator since the last handoff
    pub fn batches_accumulated(&self) -> usize {
        self.batches_accumulated
    }

    /// Whether the local-only round cap forces a wait before the next batch
    pub fn must_sync(&self) -> bool {
        self.max_compute_iters > 0 && self.local_rounds >= self.max_compute_iters
    }

    /// Attempt the handoff. When the sync task is idle: collect any fresh
    /// parameters into `params`, move the accumulated gradient into the
    /// buffer, mark it ready, and reset the accumulator. When the task is
    /// busy this round stays local-only and nothing changes except the
    /// round counter. Returns whether the handoff happened.
    pub fn try_handoff(&mut self, params: &mut [f32]) -> bool {
        {
            let mut slot = self.buffer.slot.lock().unwrap();
            if slot.state != BufferState::Filling {
                drop(slot);
                self.local_rounds += 1;
                trace!(local_rounds = self.local_rounds, "sync busy, local-only round");
                return false;
            }
            if let Some(fresh) = slot.fresh_params.take() {
                params.copy_from_slice(&fresh);
            }
            std::mem::swap(&mut slot.grad, &mut self.accum);
            slot.scale = self.scale_sum;
            slot.state = BufferState::Ready;
        }
        self.buffer.ready.notify_one();

        self.accum.iter_mut().for_each(|g| *g = 0.0);
        self.scale_sum = 0.0;
        self.batches_accumulated = 0;
        self.local_rounds = 0;
        true
    }

    /// Wait until the sync task has returned the buffer to idle
    pub async fn wait_until_idle(&self) {
        loop {
            {
                let slot = self.buffer.slot.lock().unwrap();
                if slot.state == BufferState::Filling || slot.stop {
                    return;
                }
            }
            self.buffer.idle.notified().await;
        }
    }

    /// Stop this device's sync task
    pub fn stop(&self) {
        self.buffer.stop();
    }

    /// Whether the sync task has stopped (shutdown or failure)
    pub fn is_stopped(&self) -> bool {
        self.buffer.is_stopped()
    }
}

/// Spawn the background sync task for one device.
///
/// `sync` performs one synchronization round: it consumes the accumulated
/// gradient and its summed batch weight and returns the refreshed
/// parameters, which the next successful handoff delivers to the compute
/// loop.
pub fn spawn_sync_task<F, Fut>(buffer: Arc<OverlapBuffer>, mut sync: F) -> JoinHandle<Result<()>>
where
    F: FnMut(Vec<f32>, f32) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<f32>>> + Send,
{
    tokio::spawn(async move {
        loop {
            // Park until a gradient is ready or stop is requested. A
            // gradient handed off before the stop still gets synced.
            let (grad, scale) = loop {
                {
                    let mut slot = buffer.slot.lock().unwrap();
                    if slot.state == BufferState::Ready {
                        slot.state = BufferState::Syncing;
                        let grad = std::mem::take(&mut slot.grad);
                        break (grad, slot.scale);
                    }
                    if slot.stop {
                        debug!("overlap sync task stopping");
                        return Ok(());
                    }
                }
                buffer.ready.notified().await;
            };

            let fresh = match sync(grad, scale).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    // Raise stop and wake waiters so nobody parks on a
                    // buffer that will never turn idle again
                    buffer.slot.lock().unwrap().stop = true;
                    buffer.idle.notify_one();
                    return Err(e);
                }
            };

            {
                let mut slot = buffer.slot.lock().unwrap();
                slot.grad = vec![0.0; fresh.len()];
                slot.fresh_params = Some(fresh);
                slot.state = BufferState::Filling;
            }
            buffer.idle.notify_one();
        }
    })
}

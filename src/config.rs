//! Configuration surface for the synchronization engine
//!
//! `SyncConfig` covers everything the engine reads at startup: the
//! device/node topology, gradient compression, staleness history depth,
//! the gradient accumulation window, overlap, and the moving average.
//! Configs can be loaded from and saved to TOML files.

use crate::errors::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_nodes() -> usize {
    1
}

fn default_devices() -> usize {
    1
}

fn default_tau() -> usize {
    1
}

fn default_moving_decay() -> f32 {
    0.9999
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> usize {
    3
}

/// Configuration for distributed parameter synchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Number of nodes (machines) participating in training
    #[serde(default = "default_nodes")]
    pub nodes: usize,

    /// Number of compute devices per node
    #[serde(default = "default_devices")]
    pub devices_per_node: usize,

    /// Fraction of gradient entries discarded by compression.
    /// 0 disables compression entirely.
    #[serde(default)]
    pub drop_rate: f64,

    /// Override for the per-shard version history depth.
    /// When unset, 1 without compression and `max(2, ceil(devices * 1.5))`
    /// with compression, to tolerate slow sparse readers.
    #[serde(default)]
    pub history_size: Option<usize>,

    /// Gradient accumulation window: gradients from `tau` consecutive
    /// batches are summed locally before one synchronization round.
    #[serde(default = "default_tau")]
    pub tau: usize,

    /// Overlap communication with computation via per-device double buffering
    #[serde(default)]
    pub overlap: bool,

    /// Max local-only compute iterations between synchronizations when
    /// overlapping (0 = unlimited)
    #[serde(default)]
    pub max_compute_iters: usize,

    /// Maintain an exponential moving average of the parameters
    #[serde(default)]
    pub moving_average: bool,

    /// Moving average decay
    #[serde(default = "default_moving_decay")]
    pub moving_decay: f32,

    /// Timeout for one remote request/response round trip, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Number of attempts for a remote round trip before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            devices_per_node: default_devices(),
            drop_rate: 0.0,
            history_size: None,
            tau: default_tau(),
            overlap: false,
            max_compute_iters: 0,
            moving_average: false,
            moving_decay: default_moving_decay(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl SyncConfig {
    /// Create a single-node configuration with the given device count
    pub fn single_node(devices: usize) -> Self {
        Self {
            devices_per_node: devices,
            ..Default::default()
        }
    }

    /// Total number of workers (one per device across all nodes)
    pub fn world_size(&self) -> usize {
        self.nodes * self.devices_per_node
    }

    /// Whether gradient compression is active
    pub fn compression_enabled(&self) -> bool {
        self.drop_rate > 0.0
    }

    /// Effective per-shard history depth. Without compression a single
    /// retained version suffices; with compression slow sparse readers need
    /// extra headroom, so the depth scales with the device count.
    pub fn effective_history_size(&self) -> usize {
        if let Some(h) = self.history_size {
            return h;
        }
        if self.compression_enabled() {
            ((self.devices_per_node as f64 * 1.5).ceil() as usize).max(2)
        } else {
            1
        }
    }

    /// Remote round trip timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate the configuration. Errors here are fatal and must abort
    /// before any worker starts.
    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 {
            return Err(SyncError::Config("nodes must be > 0".to_string()));
        }
        if self.devices_per_node == 0 {
            return Err(SyncError::Config(
                "devices_per_node must be > 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(SyncError::Config(format!(
                "drop_rate must be in [0, 1), got {}",
                self.drop_rate
            )));
        }
        if self.tau == 0 {
            return Err(SyncError::Config("tau must be > 0".to_string()));
        }
        if let Some(h) = self.history_size {
            if h == 0 {
                return Err(SyncError::Config("history_size must be > 0".to_string()));
            }
        }
        if self.moving_average && !(0.0..=1.0).contains(&self.moving_decay) {
            return Err(SyncError::Config(format!(
                "moving_decay must be in [0, 1], got {}",
                self.moving_decay
            )));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SyncConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

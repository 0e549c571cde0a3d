use thiserror::Error;

/// Errors that can occur in the synchronization engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error (invalid topology, bad drop rate, etc.)
    /// Fatal at startup, before any worker runs.
    #[error("configuration error: {0}")]
    Config(String),

    /// A compressed delta exceeded its preallocated sparse capacity.
    /// Fatal: truncating the delta would silently corrupt training.
    #[error("sparse capacity exceeded on shard {shard}: selected {selected} entries, capacity {capacity}")]
    Capacity {
        shard: usize,
        selected: usize,
        capacity: usize,
    },

    /// Shard-level error (size mismatch, unknown shard id, etc.)
    #[error("shard error: {0}")]
    Shard(String),

    /// Transport error (peer unreachable, channel closed, protocol error)
    #[error("transport error: {0}")]
    Transport(String),

    /// A remote round trip timed out after exhausting its retry budget.
    #[error("request to peer {peer} timed out after {attempts} attempts")]
    Timeout { peer: usize, attempts: usize },

    /// IO error occurred (checkpoint files, config files, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The engine is shutting down; the operation was abandoned.
    #[error("engine is shutting down")]
    Shutdown,
}

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

// Implement From for TOML config serialization errors
impl From<toml::ser::Error> for SyncError {
    fn from(e: toml::ser::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(e: toml::de::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

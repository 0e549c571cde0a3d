//! Inter-node message transport
//!
//! Nodes exchange typed synchronization messages addressed by integer peer
//! id and a channel tag. Every message crosses the wire as length-prefixed
//! CBOR (u32 big-endian prefix) with a hard size limit on both ends.
//!
//! The shipped [`ChannelTransport`] connects the nodes of one process over
//! tokio channels and still round-trips every message through the wire
//! codec, so serialization bugs surface in tests rather than on a cluster.

use crate::errors::{Result, SyncError};
use crate::sparse::SparseDelta;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Maximum encoded message size (64MB; parameter shards are large)
pub const MESSAGE_SIZE_LIMIT: usize = 64 * 1024 * 1024;

/// Channel tag separating the two directions of a synchronization round
/// trip. Gradient pushes (and the stop sentinel) arrive on `GradPush`;
/// parameter replies on `ParamPush`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    GradPush,
    ParamPush,
}

pub const TAG_COUNT: usize = 2;

impl Tag {
    fn index(self) -> usize {
        match self {
            Tag::GradPush => 0,
            Tag::ParamPush => 1,
        }
    }
}

/// A synchronization message between nodes.
///
/// Gradient pushes and parameter replies carry a correlation id: the server
/// echoes the request's id into its reply, and a requester discards any
/// reply whose id does not match its outstanding request (left over from an
/// abandoned, timed-out attempt).
///
/// Sparse gradients additionally carry the client slot id and batch weight
/// alongside the delta, so the server can pick the right per-client reply
/// snapshot and scale the update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Dense gradient covering the receiving node's parameter range
    DenseGrad {
        request: Uuid,
        from: usize,
        scale: f32,
        data: Vec<f32>,
    },
    /// Compressed gradient in the receiving node's local coordinates
    SparseGrad {
        request: Uuid,
        from: usize,
        /// Client slot on the sending node (its local device index)
        client: usize,
        /// Batch weight for update scaling
        scale: f32,
        delta: SparseDelta,
    },
    /// Dense parameter reply covering the sending node's range
    DenseParams { request: Uuid, data: Vec<f32> },
    /// Compressed parameter delta against the last snapshot sent to the
    /// requesting client
    SparseParams { request: Uuid, delta: SparseDelta },
    /// Sentinel that unblocks a server loop for shutdown
    Stop,
}

impl SyncMessage {
    /// The correlation id tying a reply to its request
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            SyncMessage::DenseGrad { request, .. }
            | SyncMessage::SparseGrad { request, .. }
            | SyncMessage::DenseParams { request, .. }
            | SyncMessage::SparseParams { request, .. } => Some(*request),
            SyncMessage::Stop => None,
        }
    }
}

/// Encode a message as length-prefixed CBOR
pub fn encode_message(message: &SyncMessage) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(message, &mut payload)
        .map_err(|e| SyncError::Serialization(e.to_string()))?;
    if payload.len() > MESSAGE_SIZE_LIMIT {
        return Err(SyncError::Serialization(format!(
            "message size {} exceeds limit {}",
            payload.len(),
            MESSAGE_SIZE_LIMIT
        )));
    }
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(&payload);
    Ok(framed)
}

/// Decode a length-prefixed CBOR message
pub fn decode_message(framed: &[u8]) -> Result<SyncMessage> {
    if framed.len() < 4 {
        return Err(SyncError::Serialization(
            "message shorter than its length prefix".to_string(),
        ));
    }
    let mut len_buf = [0u8; 4];
    len_buf.copy_from_slice(&framed[..4]);
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MESSAGE_SIZE_LIMIT {
        return Err(SyncError::Serialization(format!(
            "message size {} exceeds limit {}",
            len, MESSAGE_SIZE_LIMIT
        )));
    }
    if framed.len() != 4 + len {
        return Err(SyncError::Serialization(format!(
            "framed length {} does not match prefix {}",
            framed.len() - 4,
            len
        )));
    }
    ciborium::from_reader(&framed[4..]).map_err(|e| SyncError::Serialization(e.to_string()))
}

/// Point-to-point transport between nodes.
///
/// One endpoint per node; messages are addressed by peer id and tag.
/// Delivery per (sender, receiver, tag) triple is in order; there is no
/// ordering across tags or senders.
#[async_trait]
pub trait Transport: Send + Sync {
    /// This endpoint's node id
    fn node_id(&self) -> usize;

    /// Number of nodes in the mesh
    fn num_nodes(&self) -> usize;

    /// Send a message to `peer` on `tag`
    async fn send(&self, peer: usize, tag: Tag, message: SyncMessage) -> Result<()>;

    /// Receive the next message addressed to this node on `tag`.
    /// Callers impose timeouts; this waits indefinitely.
    async fn recv(&self, tag: Tag) -> Result<SyncMessage>;
}

/// In-process transport over tokio channels, one endpoint per node.
///
/// Every message is encoded and decoded through the wire codec even though
/// it never leaves the process.
pub struct ChannelTransport {
    node: usize,
    /// `senders[peer][tag]`
    senders: Vec<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    /// One receiver per tag; locked only for the duration of one `recv`
    receivers: Vec<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl ChannelTransport {
    /// Build a fully connected mesh of `nodes` endpoints
    pub fn mesh(nodes: usize) -> Vec<ChannelTransport> {
        let mut senders = Vec::with_capacity(nodes);
        let mut receivers = Vec::with_capacity(nodes);
        for _ in 0..nodes {
            let mut node_senders = Vec::with_capacity(TAG_COUNT);
            let mut node_receivers = Vec::with_capacity(TAG_COUNT);
            for _ in 0..TAG_COUNT {
                let (tx, rx) = mpsc::unbounded_channel();
                node_senders.push(tx);
                node_receivers.push(tokio::sync::Mutex::new(rx));
            }
            senders.push(node_senders);
            receivers.push(node_receivers);
        }

        receivers
            .into_iter()
            .enumerate()
            .map(|(node, node_receivers)| ChannelTransport {
                node,
                senders: senders.clone(),
                receivers: node_receivers,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn node_id(&self) -> usize {
        self.node
    }

    fn num_nodes(&self) -> usize {
        self.senders.len()
    }

    async fn send(&self, peer: usize, tag: Tag, message: SyncMessage) -> Result<()> {
        let framed = encode_message(&message)?;
        let sender = self
            .senders
            .get(peer)
            .ok_or_else(|| SyncError::Transport(format!("unknown peer {peer}")))?;
        sender[tag.index()]
            .send(framed)
            .map_err(|_| SyncError::Transport(format!("peer {peer} endpoint closed")))
    }

    async fn recv(&self, tag: Tag) -> Result<SyncMessage> {
        let mut receiver = self.receivers[tag.index()].lock().await;
        let framed = receiver
            .recv()
            .await
            .ok_or_else(|| SyncError::Transport("all senders dropped".to_string()))?;
        decode_message(&framed)
    }
}

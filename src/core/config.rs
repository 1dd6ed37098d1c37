//! Cluster configuration, quorum arithmetic, and proposal numbering

use std::time::Duration;

/// Number of low-order bits of a proposal number reserved for the node index.
///
/// A proposal number is `round << NODE_BITS | node_index`, so two nodes can
/// never mint the same number and numbers from the same round are totally
/// ordered by node index. Supports clusters of up to 256 nodes.
pub const NODE_BITS: u32 = 8;

/// Static configuration of a cluster node
///
/// Membership is fixed for the process lifetime: `nodes` lists every node in
/// the cluster (this one included) and `node_index` identifies this node
/// within that list.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Addresses of every node in the cluster, in a shared, agreed order
    nodes: Vec<String>,
    /// Index of this node within `nodes`
    node_index: usize,
    /// Upper bound on a single peer RPC (default: 5s)
    rpc_timeout: Duration,
    /// Base delay between retried proposal rounds (default: 5ms)
    retry_backoff: Duration,
}

impl ClusterConfig {
    /// Create a configuration for the node at `node_index` of `nodes`.
    ///
    /// Panics if the node list is empty, the index is out of range, or the
    /// cluster exceeds the proposal-number node capacity.
    pub fn new(nodes: Vec<String>, node_index: usize) -> Self {
        assert!(!nodes.is_empty(), "cluster must have at least one node");
        assert!(node_index < nodes.len(), "node index out of range");
        assert!(
            nodes.len() <= 1 << NODE_BITS,
            "cluster exceeds {} nodes",
            1u64 << NODE_BITS
        );
        Self {
            nodes,
            node_index,
            rpc_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(5),
        }
    }

    /// Set a custom per-peer RPC timeout
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set a custom base backoff between retried rounds
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// All node addresses, this node's included
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Number of nodes in the cluster
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Membership can never be empty; provided for completeness
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Index of this node in the membership list
    pub fn node_index(&self) -> usize {
        self.node_index
    }

    /// Address this node listens on
    pub fn listen_address(&self) -> &str {
        &self.nodes[self.node_index]
    }

    /// Minimal majority required for agreement: `floor(n / 2) + 1`
    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    /// Per-peer RPC timeout
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Base backoff between retried rounds
    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Compose the proposal number for `round` issued by this node
    pub fn proposal_number(&self, round: u64) -> u64 {
        round << NODE_BITS | self.node_index as u64
    }
}

/// Round component of a proposal number
pub fn round_of(n: u64) -> u64 {
    n >> NODE_BITS
}

//! Peer link: sends one consensus or log message to one peer node
//!
//! - `TcpTransport`: line-protocol TCP transport, one connection per call
//! - `InMemoryTransport`: channel-based transport for testing

pub mod inmemory;
pub mod tcp;

use std::fmt;

use async_trait::async_trait;

use crate::core::acceptor::PrepareReply;

pub use inmemory::InMemoryTransport;
pub use tcp::TcpTransport;

/// Errors that can occur during transport operations
///
/// For quorum purposes every variant counts as a non-response: the peer is
/// neither a promise nor a refusal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection to the target node failed
    ConnectionFailed,
    /// Request timed out
    Timeout,
    /// Target node not found
    NodeNotFound,
    /// Peer answered with something outside the reply grammar
    InvalidReply,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionFailed => write!(f, "connection failed"),
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::NodeNotFound => write!(f, "target node not found"),
            TransportError::InvalidReply => write!(f, "invalid reply from peer"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Transport abstraction for consensus and learn messages
///
/// One call sends one message to one peer and parses its reply; calls are
/// stateless and bounded by the transport's configured timeout. Targets are
/// node indices into the cluster membership list.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `PREPARE n` to a peer's acceptor
    async fn prepare(&self, target: usize, n: u64) -> Result<PrepareReply, TransportError>;

    /// Send `ACCEPT n id value` to a peer's acceptor
    async fn accept(
        &self,
        target: usize,
        n: u64,
        id: &str,
        value: &str,
    ) -> Result<bool, TransportError>;

    /// Send `SET n id value` to a peer's log store (the learn step)
    async fn learn(
        &self,
        target: usize,
        n: u64,
        id: &str,
        value: &str,
    ) -> Result<(), TransportError>;
}

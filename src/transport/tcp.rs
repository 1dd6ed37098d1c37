//! Line-protocol TCP transport
//!
//! Dials one connection per call. The node's own index is a valid target:
//! consensus traffic to the local acceptor loops back through the node's own
//! listener, so every peer is handled uniformly.

use async_trait::async_trait;

use crate::client::{Client, ClientError};
use crate::core::acceptor::PrepareReply;
use crate::core::config::ClusterConfig;
use crate::protocol::{Command, Reply};
use crate::transport::{Transport, TransportError};

/// TCP transport over the cluster membership list
pub struct TcpTransport {
    clients: Vec<Client>,
}

impl TcpTransport {
    /// Build clients for every node in the cluster, announcing this node's
    /// listen address as the connection display name.
    pub fn new(config: &ClusterConfig) -> Self {
        let name = config.listen_address().to_owned();
        let clients = config
            .nodes()
            .iter()
            .map(|address| {
                Client::new(address.clone())
                    .with_timeout(config.rpc_timeout())
                    .with_name(name.clone())
            })
            .collect();
        Self { clients }
    }

    fn client(&self, target: usize) -> Result<&Client, TransportError> {
        self.clients.get(target).ok_or(TransportError::NodeNotFound)
    }
}

fn map_error(err: ClientError) -> TransportError {
    match err {
        ClientError::Timeout => TransportError::Timeout,
        ClientError::InvalidReply(_) => TransportError::InvalidReply,
        ClientError::Connect(_) | ClientError::Io(_) | ClientError::Closed => {
            TransportError::ConnectionFailed
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn prepare(&self, target: usize, n: u64) -> Result<PrepareReply, TransportError> {
        let reply = self
            .client(target)?
            .query_one(&Command::Prepare { n })
            .await
            .map_err(map_error)?;
        match reply {
            Reply::Promise(previous) => Ok(PrepareReply::Promised(previous)),
            // A bare refusal reports no promise; zero keeps the round bump a
            // plain increment.
            Reply::Refuse(promised) => {
                Ok(PrepareReply::Refused { promised: promised.unwrap_or(0) })
            }
            _ => Err(TransportError::InvalidReply),
        }
    }

    async fn accept(
        &self,
        target: usize,
        n: u64,
        id: &str,
        value: &str,
    ) -> Result<bool, TransportError> {
        let command = Command::Accept { n, id: id.to_owned(), value: value.to_owned() };
        let reply = self
            .client(target)?
            .query_one(&command)
            .await
            .map_err(map_error)?;
        match reply {
            Reply::Accepted => Ok(true),
            Reply::Refuse(_) => Ok(false),
            _ => Err(TransportError::InvalidReply),
        }
    }

    async fn learn(
        &self,
        target: usize,
        n: u64,
        id: &str,
        value: &str,
    ) -> Result<(), TransportError> {
        let command = Command::Set { n, id: id.to_owned(), value: value.to_owned() };
        // Best effort: the reply is not awaited beyond delivery of the line.
        self.client(target)?.exec(&command).await.map_err(map_error)
    }
}

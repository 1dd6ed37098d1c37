//! Testing utilities for cluster integration tests
//!
//! Provides `TestCluster` for spinning up in-process clusters on ephemeral
//! ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::core::config::ClusterConfig;
use crate::log::LogStore;
use crate::server::Server;
use crate::transport::TcpTransport;

/// A single test node in the cluster
pub struct TestNode {
    /// Node index within the membership list
    pub index: usize,
    /// Address the node listens on
    pub addr: SocketAddr,
    /// The node's log store, for direct state assertions
    pub log: Arc<LogStore>,
    serve_task: JoinHandle<()>,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.serve_task.abort();
    }
}

/// A test cluster of nodes connected over real TCP
pub struct TestCluster {
    /// All nodes in the cluster
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Create and start a new 3-node cluster
    pub async fn new() -> Self {
        Self::with_nodes(3).await
    }

    /// Create and start a cluster with the specified number of nodes
    pub async fn with_nodes(count: usize) -> Self {
        // Bind all listeners first so every node knows the full membership.
        let mut listeners = Vec::new();
        let mut addrs = Vec::new();
        for _ in 0..count {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            addrs.push(addr.to_string());
            listeners.push((listener, addr));
        }

        let mut nodes = Vec::new();
        for (index, (listener, addr)) in listeners.into_iter().enumerate() {
            let config = ClusterConfig::new(addrs.clone(), index)
                .with_rpc_timeout(Duration::from_millis(500))
                .with_retry_backoff(Duration::from_millis(2));

            let server: Arc<Server<TcpTransport>> = Arc::new(Server::new(config));
            let log = server.log();
            let serve_task = tokio::spawn(async move {
                if let Err(err) = server.serve(listener).await {
                    tracing::error!(error = %err, "test node stopped");
                }
            });

            nodes.push(TestNode { index, addr, log, serve_task });
        }

        TestCluster { nodes }
    }

    /// Client connected to the node at `index`
    pub fn client(&self, index: usize) -> Client {
        Client::new(self.nodes[index].addr.to_string())
            .with_timeout(Duration::from_secs(5))
            .with_name(format!("test-client-{}", index))
    }
}

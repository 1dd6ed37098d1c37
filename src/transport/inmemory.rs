//! In-memory transport implementation for testing

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::core::acceptor::{PrepareReply, SharedAcceptor};
use crate::log::LogStore;
use crate::transport::{Transport, TransportError};

/// Request types that can be sent to a node
pub enum Request {
    Prepare {
        n: u64,
        reply: oneshot::Sender<PrepareReply>,
    },
    Accept {
        n: u64,
        id: String,
        value: String,
        reply: oneshot::Sender<bool>,
    },
    Learn {
        n: u64,
        id: String,
        value: String,
    },
}

/// In-memory transport that uses channels for communication
pub struct InMemoryTransport {
    /// Senders to each node's request channel, keyed by node index
    senders: HashMap<usize, mpsc::Sender<Request>>,
    /// Timeout for RPC calls
    timeout: Duration,
}

impl InMemoryTransport {
    /// Create a new in-memory transport with senders to all nodes
    pub fn new(senders: HashMap<usize, mpsc::Sender<Request>>, timeout: Duration) -> Self {
        Self { senders, timeout }
    }

    async fn await_reply<R>(&self, reply_rx: oneshot::Receiver<R>) -> Result<R, TransportError> {
        tokio::time::timeout(self.timeout, reply_rx)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn prepare(&self, target: usize, n: u64) -> Result<PrepareReply, TransportError> {
        let sender = self.senders.get(&target).ok_or(TransportError::NodeNotFound)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Request::Prepare { n, reply: reply_tx })
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        self.await_reply(reply_rx).await
    }

    async fn accept(
        &self,
        target: usize,
        n: u64,
        id: &str,
        value: &str,
    ) -> Result<bool, TransportError> {
        let sender = self.senders.get(&target).ok_or(TransportError::NodeNotFound)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Request::Accept {
                n,
                id: id.to_owned(),
                value: value.to_owned(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        self.await_reply(reply_rx).await
    }

    async fn learn(
        &self,
        target: usize,
        n: u64,
        id: &str,
        value: &str,
    ) -> Result<(), TransportError> {
        let sender = self.senders.get(&target).ok_or(TransportError::NodeNotFound)?;
        sender
            .send(Request::Learn { n, id: id.to_owned(), value: value.to_owned() })
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

/// Handle for a node that processes incoming requests
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Create a request channel, returning the sender half for the transport
    /// map and the handle that drains it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<Request>, NodeHandle) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, NodeHandle { receiver: rx })
    }

    /// Process one incoming request against the node's acceptor and log.
    /// Returns false once all senders are gone.
    pub async fn process_one(&mut self, acceptor: &SharedAcceptor, log: &Arc<LogStore>) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                Self::handle_request(request, acceptor, log).await;
                true
            }
            None => false,
        }
    }

    /// Spawn a task that serves requests until the transport is dropped.
    pub fn spawn(mut self, acceptor: SharedAcceptor, log: Arc<LogStore>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while self.process_one(&acceptor, &log).await {}
        })
    }

    async fn handle_request(request: Request, acceptor: &SharedAcceptor, log: &Arc<LogStore>) {
        match request {
            Request::Prepare { n, reply } => {
                let result = acceptor.lock().await.prepare(n);
                let _ = reply.send(result);
            }
            Request::Accept { n, id, value, reply } => {
                let result = acceptor.lock().await.accept(n, &id, &value);
                let _ = reply.send(result);
            }
            Request::Learn { n, id, value } => {
                if let Err(err) = log.set(n, &value) {
                    tracing::error!(error = %err, "conflicting learn message");
                    return;
                }
                acceptor.lock().await.mark_learned(id);
            }
        }
    }
}

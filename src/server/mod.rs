//! Node server: connection accept loop and protocol dispatcher
//!
//! One lightweight task per accepted connection. Each connection is a
//! persistent line-oriented session: commands are handled in sequence until
//! EOF. `PULL` takes the connection over and streams values until the client
//! disconnects. Malformed input gets an error reply and closes that
//! connection only; other connections and node state are unaffected.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::core::acceptor::{Acceptor, PrepareReply, SharedAcceptor};
use crate::core::config::ClusterConfig;
use crate::core::proposer::Proposer;
use crate::log::LogStore;
use crate::protocol::{Command, Reply, META_NAME};
use crate::transport::{TcpTransport, Transport};

/// A cluster node: acceptor, log store, proposer, and the dispatcher that
/// routes wire commands between them.
pub struct Server<T: Transport> {
    config: ClusterConfig,
    acceptor: SharedAcceptor,
    log: Arc<LogStore>,
    proposer: Proposer<T>,
}

impl Server<TcpTransport> {
    /// Build a node wired to its cluster over TCP.
    pub fn new(config: ClusterConfig) -> Self {
        let transport = TcpTransport::new(&config);
        Self::with_transport(config, transport)
    }
}

impl<T: Transport + 'static> Server<T> {
    /// Build a node over a custom transport.
    pub fn with_transport(config: ClusterConfig, transport: T) -> Self {
        let acceptor: SharedAcceptor = Arc::new(Mutex::new(Acceptor::new()));
        let log = Arc::new(LogStore::new());
        let proposer = Proposer::new(
            config.clone(),
            transport,
            acceptor.clone(),
            log.clone(),
        );
        Self { config, acceptor, log, proposer }
    }

    /// This node's log store (shared with the proposer)
    pub fn log(&self) -> Arc<LogStore> {
        self.log.clone()
    }

    /// Accept connections on `listener` until the listener fails.
    ///
    /// Each connection is served on its own task; a failing connection never
    /// takes the accept loop down with it.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        tracing::info!(address = %self.config.listen_address(), "node listening");
        loop {
            let (stream, remote) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream, remote.to_string()).await {
                    tracing::debug!(%remote, error = %err, "connection ended");
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote: String,
    ) -> io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let (command, meta) = match Command::parse_line(&line) {
                Ok(parsed) => parsed,
                Err(err) => {
                    // Error reply, then close this connection only.
                    write_reply(&mut write_half, &Reply::Err(err.to_string())).await?;
                    return Ok(());
                }
            };

            // Optional display name from request metadata, for logs only.
            let peer = meta.get(META_NAME).cloned().unwrap_or_else(|| remote.clone());
            tracing::debug!(%peer, %command, "received");

            match command {
                Command::Push { value } => match self.proposer.commit(&value).await {
                    Ok(slot) => {
                        tracing::debug!(%peer, slot, "push committed");
                        write_reply(&mut write_half, &Reply::Ok).await?;
                    }
                    Err(err) => {
                        tracing::error!(%peer, error = %err, "push failed");
                        write_reply(&mut write_half, &Reply::Err(err.to_string())).await?;
                    }
                },
                Command::Pull { from } => {
                    // Streams until the client goes away; nothing to do after.
                    self.stream_tail(from, &mut lines, &mut write_half).await?;
                    return Ok(());
                }
                Command::Status => write_reply(&mut write_half, &Reply::Ok).await?,
                Command::Prepare { n } => {
                    let reply = match self.acceptor.lock().await.prepare(n) {
                        PrepareReply::Promised(previous) => Reply::Promise(previous),
                        PrepareReply::Refused { promised } => Reply::Refuse(Some(promised)),
                    };
                    write_reply(&mut write_half, &reply).await?;
                }
                Command::Accept { n, id, value } => {
                    let accepted = self.acceptor.lock().await.accept(n, &id, &value);
                    let reply = if accepted { Reply::Accepted } else { Reply::Refuse(None) };
                    write_reply(&mut write_half, &reply).await?;
                }
                Command::Set { n, id, value } => match self.log.set(n, &value) {
                    Ok(()) => {
                        self.acceptor.lock().await.mark_learned(id);
                        write_reply(&mut write_half, &Reply::Ok).await?;
                    }
                    Err(err) => {
                        // Safety violation: report, never overwrite.
                        tracing::error!(%peer, error = %err, "conflicting set");
                        write_reply(&mut write_half, &Reply::Err(err.to_string())).await?;
                    }
                },
            }
        }

        Ok(())
    }

    /// Stream log values to the client until it disconnects.
    ///
    /// Dropping the tail on the way out unregisters its subscription, so an
    /// abandoned reader leaks nothing.
    async fn stream_tail(
        &self,
        from: u64,
        lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
        write_half: &mut OwnedWriteHalf,
    ) -> io::Result<()> {
        let mut tail = self.log.pull(from);
        loop {
            tokio::select! {
                entry = tail.next() => {
                    let Some((slot, value)) = entry else { return Ok(()) };
                    tracing::trace!(slot, "streaming value");
                    write_reply(write_half, &Reply::Value(value)).await?;
                }
                line = lines.next_line() => {
                    match line {
                        // Further input during a tail is ignored; EOF or a
                        // read error means the client went away.
                        Ok(Some(_)) => continue,
                        Ok(None) | Err(_) => return Ok(()),
                    }
                }
            }
        }
    }
}

async fn write_reply(write_half: &mut OwnedWriteHalf, reply: &Reply) -> io::Result<()> {
    write_half.write_all(format!("{}\n", reply).as_bytes()).await
}

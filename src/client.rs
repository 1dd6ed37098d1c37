//! Typed client for the wire protocol
//!
//! Each request opens its own connection, mirroring the stateless peer-link
//! contract: `query_one` for request/single-reply commands, `exec` for
//! fire-and-forget delivery, and `pull` for an unbounded streamed tail.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::protocol::{Command, Reply, META_NAME};

/// Errors that can occur during client operations
#[derive(Debug)]
pub enum ClientError {
    /// Could not connect to the node
    Connect(std::io::Error),
    /// The exchange did not complete within the configured timeout
    Timeout,
    /// Reading or writing the connection failed
    Io(std::io::Error),
    /// The node closed the connection before replying
    Closed,
    /// The node's reply was outside the reply grammar
    InvalidReply(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Connect(err) => write!(f, "connect failed: {}", err),
            ClientError::Timeout => write!(f, "request timed out"),
            ClientError::Io(err) => write!(f, "i/o error: {}", err),
            ClientError::Closed => write!(f, "connection closed before reply"),
            ClientError::InvalidReply(line) => write!(f, "invalid reply: {:?}", line),
        }
    }
}

impl std::error::Error for ClientError {}

/// Client for one node's wire endpoint
#[derive(Debug, Clone)]
pub struct Client {
    address: String,
    timeout: Duration,
    name: Option<String>,
}

impl Client {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_secs(5),
            name: None,
        }
    }

    /// Bound the whole connect/send/reply exchange by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Display name sent as `;name=` metadata for the node's logs
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn request_line(&self, command: &Command) -> String {
        match &self.name {
            Some(name) => format!("{};{}={}\n", command, META_NAME, name),
            None => format!("{}\n", command),
        }
    }

    async fn connect(&self) -> Result<TcpStream, ClientError> {
        match timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(ClientError::Connect(err)),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Send one command and parse its single-line reply.
    pub async fn query_one(&self, command: &Command) -> Result<Reply, ClientError> {
        timeout(self.timeout, self.query_one_inner(command))
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    async fn query_one_inner(&self, command: &Command) -> Result<Reply, ClientError> {
        let stream = self.connect().await?;
        let mut stream = BufReader::new(stream);
        stream
            .write_all(self.request_line(command).as_bytes())
            .await
            .map_err(ClientError::Io)?;

        let mut line = String::new();
        let read = stream.read_line(&mut line).await.map_err(ClientError::Io)?;
        if read == 0 {
            return Err(ClientError::Closed);
        }
        Reply::parse(&line).map_err(|_| ClientError::InvalidReply(line.trim().to_owned()))
    }

    /// Send one command without waiting for a reply.
    pub async fn exec(&self, command: &Command) -> Result<(), ClientError> {
        let mut stream = self.connect().await?;
        stream
            .write_all(self.request_line(command).as_bytes())
            .await
            .map_err(ClientError::Io)?;
        stream.flush().await.map_err(ClientError::Io)?;
        Ok(())
    }

    /// Start a streamed tail read at `from`.
    ///
    /// The returned stream yields one value per line until the caller drops
    /// it or the node closes the connection.
    pub async fn pull(&self, from: u64) -> Result<PullStream, ClientError> {
        let stream = self.connect().await?;
        let mut stream = BufReader::new(stream);
        stream
            .write_all(self.request_line(&Command::Pull { from }).as_bytes())
            .await
            .map_err(ClientError::Io)?;
        Ok(PullStream { stream })
    }
}

/// An open `PULL` stream
#[derive(Debug)]
pub struct PullStream {
    stream: BufReader<TcpStream>,
}

impl PullStream {
    /// Next streamed value, blocking until the node commits one.
    ///
    /// Returns `None` once the connection is closed.
    pub async fn next(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.stream.read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end_matches(['\n', '\r']).to_owned()),
            Err(err) => {
                tracing::debug!(error = %err, "pull stream ended");
                None
            }
        }
    }
}
